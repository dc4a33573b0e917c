use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarMap};

const MIN_STD: f64 = 1e-6;

///
/// Invertible map between observables and the space a model is
/// trained in
///
pub trait Preprocessing {
    /// fit the normalization on training events (n x d)
    fn init_normalization(&mut self, x_nd: &Tensor) -> anyhow::Result<()>;

    fn forward(&self, x_nd: &Tensor) -> anyhow::Result<Tensor>;

    /// map back from model space, `batch_size` rows at a time
    fn inverse(&self, y_nd: &Tensor, batch_size: usize) -> anyhow::Result<Tensor>;

    fn output_dim(&self) -> usize;

    /// parameters stored in checkpoints next to the model's
    fn variables(&self) -> VarMap;
}

/// Per-column centering and scaling to unit variance
pub struct Standardize {
    dim: usize,
    varmap: VarMap,
    mean: Var,
    std: Var,
}

fn take_var(varmap: &VarMap, name: &str) -> anyhow::Result<Var> {
    varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing variable {}", name))
}

impl Standardize {
    pub fn new(dim: usize, device: &Device) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        varmap.get((1, dim), "mean", Init::Const(0.0), DType::F32, device)?;
        varmap.get((1, dim), "std", Init::Const(1.0), DType::F32, device)?;
        let mean = take_var(&varmap, "mean")?;
        let std = take_var(&varmap, "std")?;
        Ok(Self {
            dim,
            varmap,
            mean,
            std,
        })
    }

    pub fn mean(&self) -> &Tensor {
        self.mean.as_tensor()
    }

    pub fn std(&self) -> &Tensor {
        self.std.as_tensor()
    }
}

impl Preprocessing for Standardize {
    fn init_normalization(&mut self, x_nd: &Tensor) -> anyhow::Result<()> {
        let (_, d) = x_nd.dims2()?;
        if d != self.dim {
            anyhow::bail!("expected {} column(s), got {}", self.dim, d);
        }
        let x_nd = x_nd.to_dtype(DType::F32)?.to_device(self.mean.device())?;

        // missing entries (NaN) are left out of the column statistics
        let observed = x_nd.eq(&x_nd)?;
        let zeros = x_nd.zeros_like()?;
        let count = observed.to_dtype(DType::F32)?.sum_keepdim(0)?.maximum(1f32)?;

        let mean = (observed.where_cond(&x_nd, &zeros)?.sum_keepdim(0)? / &count)?;
        let centered = observed.where_cond(&x_nd.broadcast_sub(&mean)?, &zeros)?;
        let std = (centered.sqr()?.sum_keepdim(0)? / &count)?
            .sqrt()?
            .maximum(MIN_STD)?;
        self.mean.set(&mean)?;
        self.std.set(&std)?;
        Ok(())
    }

    fn forward(&self, x_nd: &Tensor) -> anyhow::Result<Tensor> {
        Ok(x_nd
            .broadcast_sub(self.mean.as_tensor())?
            .broadcast_div(self.std.as_tensor())?)
    }

    fn inverse(&self, y_nd: &Tensor, batch_size: usize) -> anyhow::Result<Tensor> {
        let n = y_nd.dim(0)?;
        let bs = batch_size.max(1);
        let mut chunks = Vec::with_capacity(n.div_ceil(bs));
        for lb in (0..n).step_by(bs) {
            let y = y_nd.narrow(0, lb, bs.min(n - lb))?;
            chunks.push(
                y.broadcast_mul(self.std.as_tensor())?
                    .broadcast_add(self.mean.as_tensor())?,
            );
        }
        if chunks.is_empty() {
            return Ok(y_nd.clone());
        }
        Ok(Tensor::cat(&chunks, 0)?)
    }

    fn output_dim(&self) -> usize {
        self.dim
    }

    fn variables(&self) -> VarMap {
        self.varmap.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standardized_columns_and_inverse() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 10.], [3., 10.], [5., 10.]], &dev)?;
        let mut pp = Standardize::new(2, &dev)?;
        pp.init_normalization(&x)?;

        let y = pp.forward(&x)?;
        let col_mean = y.mean(0)?.to_vec1::<f32>()?;
        assert!(col_mean.iter().all(|m| m.abs() < 1e-6));
        // constant column maps to zero
        assert_eq!(y.narrow(1, 1, 1)?.flatten_all()?.to_vec1::<f32>()?, vec![0.; 3]);

        let back = pp.inverse(&y, 2)?;
        let err = (back - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(err < 1e-5);
        Ok(())
    }

    #[test]
    fn missing_entries_are_ignored() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.], [f32::NAN, 4.], [3., 6.]], &dev)?;
        let mut pp = Standardize::new(2, &dev)?;
        pp.init_normalization(&x)?;

        let mean = pp.mean().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(mean, vec![2.0, 4.0]);
        let std = pp.std().flatten_all()?.to_vec1::<f32>()?;
        assert!((std[0] - 1.0).abs() < 1e-6);

        let y = pp.forward(&x)?.to_vec2::<f32>()?;
        assert!((y[0][0] + 1.0).abs() < 1e-6);
        assert!(y[1][0].is_nan());
        assert!((y[2][0] - 1.0).abs() < 1e-6);
        assert!(y.iter().all(|row| row[1].is_finite()));
        Ok(())
    }

    #[test]
    fn statistics_live_in_the_variables() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut pp = Standardize::new(1, &dev)?;
        pp.init_normalization(&Tensor::new(&[[2f32], [4.]], &dev)?)?;
        let vars = pp.variables();
        let mean = take_var(&vars, "mean")?.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(mean, vec![3.0]);
        Ok(())
    }
}

use candle_core::{Device, Tensor};
use rand::prelude::SliceRandom;

pub struct MinibatchData {
    pub input: Tensor,
    pub condition: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    /// number of samples in a minibatch
    fn minibatch_size(&self, batch_idx: usize) -> usize;

    fn num_samples(&self) -> usize;

    /// random partition of the samples into minibatches
    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;

    /// consecutive minibatches in the original sample order
    fn ordered_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for paired in-memory matrices: row `i` of
/// `input` goes with row `i` of `condition`.
///
pub struct PairedData {
    input_data: Tensor,
    condition_data: Tensor,

    batched_input: Option<Vec<Tensor>>,
    batched_condition: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl PairedData {
    pub fn new(input_data: Tensor, condition_data: Tensor) -> anyhow::Result<Self> {
        let n = input_data.dim(0)?;
        if condition_data.dim(0)? != n {
            anyhow::bail!(
                "{} input row(s) vs. {} condition row(s)",
                n,
                condition_data.dim(0)?
            );
        }
        Ok(PairedData {
            input_data,
            condition_data,
            batched_input: None,
            batched_condition: None,
            minibatches: Minibatches {
                samples: (0..n).collect(),
                chunks: vec![],
            },
        })
    }

    pub fn input(&self) -> &Tensor {
        &self.input_data
    }

    pub fn condition(&self) -> &Tensor {
        &self.condition_data
    }

    ///
    /// Permute the condition rows against the inputs. Used for
    /// unpaired training; call before building minibatches.
    ///
    pub fn shuffle_condition(&mut self) -> anyhow::Result<()> {
        let mut perm: Vec<u32> = (0..self.num_samples() as u32).collect();
        perm.shuffle(&mut rand::rng());
        let idx = Tensor::from_vec(perm, self.num_samples(), self.condition_data.device())?;
        self.condition_data = self.condition_data.index_select(&idx, 0)?;
        Ok(())
    }

    fn preload(&mut self) -> anyhow::Result<()> {
        let device = self.input_data.device().clone();
        let mut inputs = Vec::with_capacity(self.minibatches.chunks.len());
        let mut conditions = Vec::with_capacity(self.minibatches.chunks.len());

        for samples in self.minibatches.chunks.iter() {
            let rows: Vec<u32> = samples.iter().map(|&i| i as u32).collect();
            let idx = Tensor::from_vec(rows, samples.len(), &device)?;
            inputs.push(self.input_data.index_select(&idx, 0)?);
            conditions.push(self.condition_data.index_select(&idx, 0)?);
        }

        self.batched_input = Some(inputs);
        self.batched_condition = Some(conditions);
        Ok(())
    }
}

impl DataLoader for PairedData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        match (self.batched_input.as_ref(), self.batched_condition.as_ref()) {
            (Some(inputs), Some(conditions)) => {
                if batch_idx >= inputs.len() {
                    return Err(anyhow::anyhow!(
                        "invalid index = {} vs. total # = {}",
                        batch_idx,
                        inputs.len()
                    ));
                }
                Ok(MinibatchData {
                    input: inputs[batch_idx].to_device(target_device)?,
                    condition: conditions[batch_idx].to_device(target_device)?,
                })
            }
            _ => Err(anyhow::anyhow!("need to shuffle data")),
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn minibatch_size(&self, batch_idx: usize) -> usize {
        self.minibatches
            .chunks
            .get(batch_idx)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        self.preload()
    }

    fn ordered_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.ordered_minibatch(batch_size);
        self.preload()
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
/// The last chunk may be smaller than `batch_size`.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        let mut order = self.samples.clone();
        order.shuffle(&mut rng);
        self.chunks = order.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect();
    }

    pub fn ordered_minibatch(&mut self, batch_size: usize) {
        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn shuffled_batches_partition_rows() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::arange(0f32, 10f32, &dev)?.reshape((10, 1))?;
        let c = (&x * 2.0)?;
        let mut data = PairedData::new(x, c)?;
        data.shuffle_minibatch(4)?;
        assert_eq!(data.num_minibatch(), 3);
        assert_eq!(data.minibatch_size(2), 2);

        let mut seen = vec![];
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, &dev)?;
            let xs = mb.input.flatten_all()?.to_vec1::<f32>()?;
            let cs = mb.condition.flatten_all()?.to_vec1::<f32>()?;
            for (xv, cv) in xs.iter().zip(cs.iter()) {
                assert_eq!(*cv, 2.0 * xv);
            }
            seen.extend(xs);
        }
        seen.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(seen, (0..10).map(|i| i as f32).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn ordered_batches_keep_order() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::arange(0f32, 5f32, &dev)?.reshape((5, 1))?;
        let c = Tensor::zeros((5, 2), DType::F32, &dev)?;
        let mut data = PairedData::new(x, c)?;
        data.ordered_minibatch(2)?;
        let last = data.minibatch_data(2, &dev)?;
        assert_eq!(last.input.flatten_all()?.to_vec1::<f32>()?, vec![4.0]);
        Ok(())
    }

    #[test]
    fn row_mismatch_is_an_error() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros((5, 1), DType::F32, &dev)?;
        let c = Tensor::zeros((4, 1), DType::F32, &dev)?;
        assert!(PairedData::new(x, c).is_err());
        Ok(())
    }
}

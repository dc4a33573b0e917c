use candle_core::Tensor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

/// Events of one split; rows of all tensors correspond
pub struct ProcessData {
    /// truth-level observables (n x d_hard)
    pub x_hard: Tensor,
    /// detector-level observables (n x d_reco)
    pub x_reco: Tensor,
    /// optional class labels (n x 1), used by classifier-based unfolding
    pub label: Option<Tensor>,
}

/// Source of training, validation and test events
pub trait Process {
    fn get_data(&self, split: Split) -> anyhow::Result<ProcessData>;
}

///
/// Paired in-memory matrices cut into consecutive train / validation /
/// test row ranges
///
pub struct TabularProcess {
    x_hard: Tensor,
    x_reco: Tensor,
    label: Option<Tensor>,
    split: [f64; 2],
}

impl TabularProcess {
    /// * `split` - fractions of rows for training and validation
    pub fn new(x_hard: Tensor, x_reco: Tensor, split: [f64; 2]) -> anyhow::Result<Self> {
        let n = x_hard.dim(0)?;
        if x_reco.dim(0)? != n {
            anyhow::bail!(
                "{} hard-level vs. {} reco-level events",
                n,
                x_reco.dim(0)?
            );
        }
        Ok(Self {
            x_hard,
            x_reco,
            label: None,
            split,
        })
    }

    pub fn with_label(mut self, label: Tensor) -> anyhow::Result<Self> {
        if label.dim(0)? != self.x_hard.dim(0)? {
            anyhow::bail!("label rows do not match events");
        }
        self.label = Some(label);
        Ok(self)
    }

    pub fn num_events(&self) -> anyhow::Result<usize> {
        Ok(self.x_hard.dim(0)?)
    }

    fn range(&self, split: Split) -> anyhow::Result<(usize, usize)> {
        let n = self.x_hard.dim(0)?;
        let n_train = (n as f64 * self.split[0]) as usize;
        let n_val = (n as f64 * (self.split[0] + self.split[1])) as usize - n_train;
        Ok(match split {
            Split::Train => (0, n_train),
            Split::Val => (n_train, n_val),
            Split::Test => (n_train + n_val, n - n_train - n_val),
        })
    }
}

impl Process for TabularProcess {
    fn get_data(&self, split: Split) -> anyhow::Result<ProcessData> {
        let (lb, len) = self.range(split)?;
        Ok(ProcessData {
            x_hard: self.x_hard.narrow(0, lb, len)?,
            x_reco: self.x_reco.narrow(0, lb, len)?,
            label: match self.label.as_ref() {
                Some(label) => Some(label.narrow(0, lb, len)?),
                None => None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn splits_are_consecutive() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::arange(0f32, 10f32, &dev)?.reshape((10, 1))?;
        let process = TabularProcess::new(x.clone(), x, [0.6, 0.2])?;
        let rows = |s| -> anyhow::Result<Vec<f32>> {
            Ok(process.get_data(s)?.x_hard.flatten_all()?.to_vec1::<f32>()?)
        };
        assert_eq!(rows(Split::Train)?, vec![0., 1., 2., 3., 4., 5.]);
        assert_eq!(rows(Split::Val)?, vec![6., 7.]);
        assert_eq!(rows(Split::Test)?, vec![8., 9.]);
        Ok(())
    }
}

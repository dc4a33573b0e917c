use crate::candle_loss_history::LossHistory;
use crate::candle_optimizer::OptimizerState;
use crate::error::FlowError;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Everything stored next to the parameters of a checkpoint
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    pub optimizer: Option<OptimizerState>,
    pub losses: LossHistory,
    pub epoch: usize,
}

///
/// Named checkpoints in one directory:
/// * `{name}.safetensors` - parameters, keyed `{attribute}.{variable}`
/// * `{name}.json` - optimizer state and loss history
/// * `ema_{name}.safetensors` - parameter averages, if any
///
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

fn lock_vars(
    varmap: &VarMap,
) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, candle_core::Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn params_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.safetensors", name))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn ema_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("ema_{}.safetensors", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.params_path(name).exists()
    }

    /// Write parameters of every `(attribute, variables)` pair and the state
    pub fn save(
        &self,
        name: &str,
        attributes: &[(String, VarMap)],
        state: &CheckpointState,
    ) -> anyhow::Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (attr, varmap) in attributes {
            for (var_name, var) in lock_vars(varmap)?.iter() {
                tensors.insert(format!("{}.{}", attr, var_name), var.as_tensor().clone());
            }
        }
        candle_core::safetensors::save(&tensors, self.params_path(name))?;

        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(self.state_path(name), json)?;
        Ok(())
    }

    ///
    /// Restore parameters in place. Variables missing from the file or
    /// stored with another shape are skipped with a warning; a missing
    /// state file gives the default state.
    ///
    pub fn load(
        &self,
        name: &str,
        attributes: &[(String, VarMap)],
        device: &Device,
    ) -> anyhow::Result<CheckpointState> {
        let path = self.params_path(name);
        if !path.exists() {
            return Err(FlowError::CheckpointNotFound(path).into());
        }
        let stored = candle_core::safetensors::load(&path, device)?;

        for (attr, varmap) in attributes {
            let mut n_loaded = 0;
            for (var_name, var) in lock_vars(varmap)?.iter() {
                let key = format!("{}.{}", attr, var_name);
                match stored.get(&key) {
                    Some(t) if t.shape() == var.shape() => {
                        var.set(&t.to_dtype(var.dtype())?)?;
                        n_loaded += 1;
                    }
                    Some(t) => warn!(
                        "{}: stored shape {:?} vs. {:?}, not loaded",
                        key,
                        t.shape(),
                        var.shape()
                    ),
                    None => warn!("{} not found in {}", key, path.display()),
                }
            }
            info!("Loaded {} variable(s) of {}", n_loaded, attr);
        }

        let state_path = self.state_path(name);
        if state_path.exists() {
            let json = std::fs::read_to_string(&state_path)?;
            Ok(serde_json::from_str(&json)?)
        } else {
            warn!("{} not found, starting from an empty state", state_path.display());
            Ok(CheckpointState::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::Init;

    fn attributes(init: f64) -> anyhow::Result<Vec<(String, VarMap)>> {
        let model = VarMap::new();
        model.get((2, 3), "block.0.w", Init::Const(init), DType::F32, &Device::Cpu)?;
        let pp = VarMap::new();
        pp.get(3, "mean", Init::Const(init + 1.0), DType::F32, &Device::Cpu)?;
        Ok(vec![("model".to_string(), model), ("hard_pp".to_string(), pp)])
    }

    #[test]
    fn round_trip_restores_parameters_and_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;

        let mut state = CheckpointState {
            epoch: 7,
            ..Default::default()
        };
        state.losses.push("val_loss", 0.5);
        store.save("best", &attributes(2.0)?, &state)?;
        assert!(store.exists("best"));

        let target = attributes(0.0)?;
        let loaded = store.load("best", &target, &Device::Cpu)?;
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.losses.last("val_loss"), Some(0.5));

        let w = target[0].1.data().lock().map_err(|_| anyhow::anyhow!("lock"))?["block.0.w"]
            .as_tensor()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(w, vec![2.0; 6]);
        let mean = target[1].1.data().lock().map_err(|_| anyhow::anyhow!("lock"))?["mean"]
            .as_tensor()
            .to_vec1::<f32>()?;
        assert_eq!(mean, vec![3.0; 3]);
        Ok(())
    }

    #[test]
    fn missing_checkpoint_is_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;
        let err = store.load("final", &attributes(0.0)?, &Device::Cpu).err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<FlowError>()),
            Some(FlowError::CheckpointNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn mismatched_variables_are_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;
        store.save("final", &attributes(1.0)?, &CheckpointState::default())?;

        let other = VarMap::new();
        other.get(4, "mean", Init::Const(-1.0), DType::F32, &Device::Cpu)?;
        let target = vec![("hard_pp".to_string(), other)];
        store.load("final", &target, &Device::Cpu)?;
        let mean = target[0].1.data().lock().map_err(|_| anyhow::anyhow!("lock"))?["mean"]
            .as_tensor()
            .to_vec1::<f32>()?;
        assert_eq!(mean, vec![-1.0; 4]);
        Ok(())
    }
}

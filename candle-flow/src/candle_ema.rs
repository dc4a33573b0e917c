use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use log::warn;
use std::collections::HashMap;
use std::path::Path;

const EMA_BETA: f64 = 0.9999;
const EMA_INV_GAMMA: f64 = 1.0;
const EMA_POWER: f64 = 2.0 / 3.0;
const EMA_UPDATE_EVERY: usize = 10;

///
/// Exponential moving average of model parameters. Before
/// `update_after_step` the average simply tracks the parameters;
/// afterwards the decay warms up as 1 - (1 + t / γ)^(-p), capped at β.
///
pub struct Ema {
    shadow: HashMap<String, Tensor>,
    beta: f64,
    inv_gamma: f64,
    power: f64,
    update_every: usize,
    update_after_step: usize,
    step: usize,
}

fn snapshot(varmap: &VarMap) -> anyhow::Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    data.iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?.detach())))
        .collect()
}

impl Ema {
    pub fn new(varmap: &VarMap, update_after_step: usize) -> anyhow::Result<Self> {
        Ok(Self {
            shadow: snapshot(varmap)?,
            beta: EMA_BETA,
            inv_gamma: EMA_INV_GAMMA,
            power: EMA_POWER,
            update_every: EMA_UPDATE_EVERY,
            update_after_step,
            step: 0,
        })
    }

    pub fn with_update_every(mut self, update_every: usize) -> Self {
        self.update_every = update_every.max(1);
        self
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// current decay rate
    pub fn decay(&self) -> f64 {
        let epoch = self.step.saturating_sub(self.update_after_step + 1);
        if epoch == 0 {
            return 0.0;
        }
        let value = 1.0 - (1.0 + epoch as f64 / self.inv_gamma).powf(-self.power);
        value.clamp(0.0, self.beta)
    }

    /// call once per optimizer step
    pub fn update(&mut self, varmap: &VarMap) -> anyhow::Result<()> {
        self.step += 1;
        if self.step % self.update_every != 0 {
            return Ok(());
        }
        if self.step <= self.update_after_step {
            self.shadow = snapshot(varmap)?;
            return Ok(());
        }

        let decay = self.decay();
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
        for (name, var) in data.iter() {
            let current = var.as_tensor().detach();
            let next = match self.shadow.get(name) {
                Some(avg) => ((avg * decay)? + (current * (1.0 - decay))?)?,
                None => current.copy()?,
            };
            self.shadow.insert(name.clone(), next);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.shadow.get(name)
    }

    /// overwrite the parameters in `varmap` by their averages
    pub fn copy_to(&self, varmap: &VarMap) -> anyhow::Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
        for (name, var) in data.iter() {
            match self.shadow.get(name) {
                Some(avg) => var.set(avg)?,
                None => warn!("no average for {}", name),
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        candle_core::safetensors::save(&self.shadow, path)?;
        Ok(())
    }

    /// replace the averages by those stored in `path`
    pub fn load(&mut self, path: &Path, device: &Device) -> anyhow::Result<()> {
        let stored = candle_core::safetensors::load(path, device)?;
        for (name, avg) in stored {
            match self.shadow.get(&name) {
                Some(old) if old.shape() != avg.shape() => {
                    warn!("skipping average {}: shape {:?}", name, avg.shape())
                }
                _ => {
                    self.shadow.insert(name, avg);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::Init;

    fn scalar_map() -> anyhow::Result<(VarMap, candle_core::Var)> {
        let varmap = VarMap::new();
        varmap.get(1, "w", Init::Const(0.0), DType::F32, &Device::Cpu)?;
        let var = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("lock"))?
            .get("w")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("w"))?;
        Ok((varmap, var))
    }

    fn shadow_value(ema: &Ema) -> anyhow::Result<f32> {
        let avg = ema.get("w").ok_or_else(|| anyhow::anyhow!("w"))?;
        Ok(avg.to_vec1::<f32>()?[0])
    }

    #[test]
    fn warmup_then_decay() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let (varmap, w) = scalar_map()?;
        let mut ema = Ema::new(&varmap, 2)?.with_update_every(1);

        ema.update(&varmap)?;
        ema.update(&varmap)?;
        assert_eq!(shadow_value(&ema)?, 0.0);

        // first averaged step still copies
        w.set(&Tensor::new(&[1f32], &dev)?)?;
        ema.update(&varmap)?;
        assert!((shadow_value(&ema)? - 1.0).abs() < 1e-6);

        w.set(&Tensor::new(&[2f32], &dev)?)?;
        ema.update(&varmap)?;
        let decay = 1.0 - 2f64.powf(-2.0 / 3.0);
        let expected = (decay + (1.0 - decay) * 2.0) as f32;
        assert!((shadow_value(&ema)? - expected).abs() < 1e-5);

        // the average is a copy, not a view of the parameter
        w.set(&Tensor::new(&[7f32], &dev)?)?;
        assert!((shadow_value(&ema)? - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn save_load_and_copy_back() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let (varmap, w) = scalar_map()?;
        w.set(&Tensor::new(&[3f32], &dev)?)?;
        let ema = Ema::new(&varmap, 0)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ema_final.safetensors");
        ema.save(&path)?;

        w.set(&Tensor::new(&[-1f32], &dev)?)?;
        let mut other = Ema::new(&varmap, 0)?;
        other.load(&path, &dev)?;
        other.copy_to(&varmap)?;
        assert_eq!(w.as_tensor().to_vec1::<f32>()?, vec![3.0]);
        Ok(())
    }
}

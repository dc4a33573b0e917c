use crate::candle_model_traits::LossTerms;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// series key of the moving average of `val_loss`
pub const VAL_MOVING_AVERAGE: &str = "val_mov_avg";

/// window of the validation moving average
pub const MOVING_AVERAGE_WINDOW: usize = 20;

///
/// Per-epoch loss series, e.g. `tr_loss`, `val_MAP_nll`, `lr`.
/// Every series gets one value per epoch.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LossHistory {
    series: BTreeMap<String, Vec<f32>>,
    best_val_loss: Option<f32>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: f32) {
        self.series.entry(name.to_string()).or_default().push(value);
    }

    /// push every term under `{prefix}{name}`
    pub fn push_terms(&mut self, prefix: &str, terms: &LossTerms) {
        for (name, value) in terms {
            self.push(&format!("{}{}", prefix, name), *value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.series.get(name).map(|v| v.as_slice())
    }

    pub fn last(&self, name: &str) -> Option<f32> {
        self.series.get(name).and_then(|v| v.last().copied())
    }

    pub fn num_epochs(&self) -> usize {
        self.series.values().map(|v| v.len()).max().unwrap_or(0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(|k| k.as_str())
    }

    ///
    /// Append the mean of the last (up to) 20 validation losses to the
    /// moving-average series and return it
    ///
    pub fn update_moving_average(&mut self) -> Option<f32> {
        let val = self.series.get("val_loss")?;
        let window = &val[val.len().saturating_sub(MOVING_AVERAGE_WINDOW)..];
        if window.is_empty() {
            return None;
        }
        let avg = window.iter().sum::<f32>() / window.len() as f32;
        self.push(VAL_MOVING_AVERAGE, avg);
        Some(avg)
    }

    /// record `val_loss` as best if it strictly improves on all before
    pub fn improved(&mut self) -> bool {
        match (self.last("val_loss"), self.best_val_loss) {
            (Some(val), Some(best)) if val < best => {
                self.best_val_loss = Some(val);
                true
            }
            (Some(val), None) if val.is_finite() => {
                self.best_val_loss = Some(val);
                true
            }
            _ => false,
        }
    }

    pub fn best_val_loss(&self) -> Option<f32> {
        self.best_val_loss
    }

    /// `name = value` pairs of the last epoch, `lr` in scientific notation
    pub fn summary(&self) -> String {
        self.series
            .iter()
            .filter_map(|(name, v)| {
                v.last().map(|x| {
                    if name == "lr" {
                        format!("{} = {:.2e}", name, x)
                    } else {
                        format!("{} = {:.5}", name, x)
                    }
                })
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

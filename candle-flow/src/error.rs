use std::fmt;
use std::path::PathBuf;

/// Failures a caller may want to match on. Everything else travels
/// as a plain `anyhow::Error` (tensor shape errors, IO, serde).
#[derive(Debug, Clone, PartialEq)]
pub enum FlowError {
    /// incompatible or incomplete model / training configuration
    InvalidConfig(String),
    /// a Bayesian operation was requested on a deterministic model
    NotBayesian,
    /// inverse spline hit a negative discriminant inside its domain
    SplineOutOfDomain { min_discriminant: f32 },
    /// imported posterior draw does not match the model's layers
    RandomStateMismatch { expected: usize, found: usize },
    CheckpointNotFound(PathBuf),
    /// sampling kept failing after the configured number of attempts
    SamplingFailed { attempts: usize },
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            FlowError::NotBayesian => write!(f, "model has no Bayesian layers"),
            FlowError::SplineOutOfDomain { min_discriminant } => write!(
                f,
                "spline inverse out of domain (discriminant = {})",
                min_discriminant
            ),
            FlowError::RandomStateMismatch { expected, found } => write!(
                f,
                "random state mismatch: expected {} layer(s), found {}",
                expected, found
            ),
            FlowError::CheckpointNotFound(path) => {
                write!(f, "checkpoint not found: {}", path.display())
            }
            FlowError::SamplingFailed { attempts } => {
                write!(f, "sampling failed after {} attempt(s)", attempts)
            }
        }
    }
}

impl std::error::Error for FlowError {}

/// shorthand for configuration failures
pub fn invalid_config<S: Into<String>>(msg: S) -> anyhow::Error {
    FlowError::InvalidConfig(msg.into()).into()
}

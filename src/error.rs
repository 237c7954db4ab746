use std::fmt;

/// Crate-wide error taxonomy. Every fatal class maps to a distinct process
/// exit code so replicas never continue in an inconsistent state.
#[derive(Debug)]
pub enum TrainError {
    /// Bad or unknown hyper-parameter, schedule, clipper, or optimizer name.
    Config(String),
    /// Parameter-count mismatch between flag computation and later use.
    Consistency(String),
    /// Corrupt or unreadable checkpoint.
    Restore(String),
    /// Rendezvous or collective-communication failure.
    Collective(String),
    Io(std::io::Error),
    Runtime(String),
}

impl TrainError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }

    pub fn restore(message: impl Into<String>) -> Self {
        Self::Restore(message.into())
    }

    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Exit status the top-level driver should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            TrainError::Config(_) => 2,
            TrainError::Consistency(_) => 3,
            TrainError::Restore(_) => 4,
            TrainError::Collective(_) => 5,
            TrainError::Io(_) | TrainError::Runtime(_) => 1,
        }
    }
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            TrainError::Consistency(msg) => write!(f, "consistency violation: {}", msg),
            TrainError::Restore(msg) => write!(f, "checkpoint restore failed: {}", msg),
            TrainError::Collective(msg) => write!(f, "collective communication failed: {}", msg),
            TrainError::Io(err) => write!(f, "io error: {}", err),
            TrainError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainError {
    fn from(value: std::io::Error) -> Self {
        TrainError::Io(value)
    }
}

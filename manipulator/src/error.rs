use std::{fmt, path::PathBuf};

use smcd14::{MotionStatus, Smcd14Error};
use utilities::command_executor::ExecutorError;

use crate::{models::AxisId, speed::SpeedError};

/// Register snapshot taken when an axis fails to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    pub status: MotionStatus,
    pub error_code: u16,
}

impl Diagnostics {
    /// Compact form stored in the transaction log.
    pub fn raw(&self) -> String {
        format!("err={};status={}", self.error_code, self.status.bits())
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "err={}, status={}", self.error_code, self.status.bits())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AxisError {
    #[error("{axis} axis is not connected")]
    NotConnected { axis: AxisId },

    #[error("invalid configuration for {axis} axis: {message}")]
    Config { axis: AxisId, message: String },

    #[error("{axis} axis: {source}")]
    Transaction {
        axis: AxisId,
        #[source]
        source: Smcd14Error,
    },

    #[error("{axis} axis returned an unexpected response to {command}")]
    UnexpectedResponse { axis: AxisId, command: &'static str },

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl AxisError {
    /// True when the axis link is gone, either never opened or reset by the peer.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AxisError::NotConnected { .. } | AxisError::Executor(_) => true,
            AxisError::Transaction { source, .. } => source.is_disconnect(),
            AxisError::Config { .. } | AxisError::UnexpectedResponse { .. } => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("Motion never started ({diagnostics})")]
    NeverStarted {
        axis: AxisId,
        diagnostics: Diagnostics,
    },

    #[error("Failed to reach position ({diagnostics})")]
    Stalled {
        axis: AxisId,
        diagnostics: Diagnostics,
    },

    #[error("{0} axis is not configured")]
    NotConfigured(AxisId),

    #[error("speed must be positive and finite, got {0}")]
    NonPositiveSpeed(f64),

    #[error(transparent)]
    Speed(#[from] SpeedError),

    #[error(transparent)]
    Axis(#[from] AxisError),
}

impl MotionError {
    /// Failures that were already logged and published when detected.
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            MotionError::NeverStarted { .. } | MotionError::Stalled { .. }
        )
    }

    pub fn axis(&self) -> Option<AxisId> {
        match self {
            MotionError::NeverStarted { axis, .. }
            | MotionError::Stalled { axis, .. }
            | MotionError::NotConfigured(axis) => Some(*axis),
            MotionError::Axis(
                AxisError::NotConnected { axis }
                | AxisError::Config { axis, .. }
                | AxisError::Transaction { axis, .. }
                | AxisError::UnexpectedResponse { axis, .. },
            ) => Some(*axis),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("Failed to read recipe {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse recipe: {source}")]
    Parse { source: toml::de::Error },
}

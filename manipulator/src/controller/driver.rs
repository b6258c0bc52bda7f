use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::{AxisError, Diagnostics},
    models::AxisId,
    pause::PauseGate,
};

/// How a wait for "in position" ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Arrived,
    /// The pause gate closed; the axis was stopped and is no longer running.
    Paused,
    /// The start request was accepted but the axis never moved.
    NeverStarted(Diagnostics),
    /// The axis moved but stopped changing before reaching the target.
    Stalled(Diagnostics),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Completed,
    /// Ended by an operator stop; reported as status, never as an error.
    Aborted,
}

/// Everything the manager needs from one axis.
#[async_trait]
pub trait AxisDriver: Send + Sync {
    fn axis(&self) -> AxisId;

    /// `Ok(false)` when the device cannot be reached.
    async fn connect(&self) -> Result<bool, AxisError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    async fn motor_on(&self) -> Result<(), AxisError>;

    async fn move_absolute(&self, position: f64, speed: f64) -> Result<(), AxisError>;
    async fn emergency_stop(&self) -> Result<(), AxisError>;

    async fn read_position(&self) -> Result<f64, AxisError>;
    async fn set_backlash(&self, value: f64) -> Result<(), AxisError>;

    /// Speed actually sent with the last move request.
    fn last_speed(&self) -> Option<f64>;

    async fn wait_until_in_position(
        &self,
        timeout: Duration,
        target: Option<f64>,
        pause: Option<&PauseGate>,
    ) -> Result<WaitOutcome, AxisError>;
}

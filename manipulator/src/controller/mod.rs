pub mod axis;
pub mod driver;
pub mod manager;
mod monitor;
mod path;
pub mod service;

#[cfg(test)]
pub(crate) mod fake;

pub use axis::{AxisController, AxisSettings};
pub use driver::{AxisDriver, MoveOutcome, WaitOutcome};
pub use manager::MultiAxisManager;
pub use service::run_controller;

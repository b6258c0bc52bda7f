use smcd14::{
    CLEAR_REQ_REG, MotionStatus, MoveKind, MoveRegisters, PulseTiming, START_REQ_REG,
    STOP_REQ_REG, Smcd14, Smcd14Error,
};
use utilities::{command_executor::DeviceHandler, tcp_link::TcpLink};

use crate::{error::AxisError, models::AxisId};

use commands::AxisCommand;

pub mod command_sender;
pub mod commands;

/// Owns the link to one SMCD14 axis; lives on the axis' executor thread.
pub struct Smcd14Handler {
    axis: AxisId,
    link: TcpLink,
    device: Smcd14,
    pulse: PulseTiming,
}

impl DeviceHandler for Smcd14Handler {
    type Command = AxisCommand;
}

impl Smcd14Handler {
    pub fn new(axis: AxisId, link: TcpLink, device: Smcd14, pulse: PulseTiming) -> Self {
        Self {
            axis,
            link,
            device,
            pulse,
        }
    }

    fn transaction(&self, source: Smcd14Error) -> AxisError {
        AxisError::Transaction {
            axis: self.axis,
            source,
        }
    }

    pub fn set_motor(&mut self, on: bool) -> Result<(), AxisError> {
        self.device
            .set_motor(&mut self.link, on)
            .map_err(|e| self.transaction(e))
    }

    /// Writes the move registers and pulses start as one uninterrupted sequence.
    pub fn start_move(
        &mut self,
        kind: MoveKind,
        value: f32,
        speed: f32,
    ) -> Result<MoveRegisters, AxisError> {
        let registers = self
            .device
            .write_move(&mut self.link, kind, value, speed)
            .map_err(|e| self.transaction(e))?;

        self.device
            .pulse(&mut self.link, START_REQ_REG, &self.pulse)
            .map_err(|e| self.transaction(e))?;

        Ok(registers)
    }

    pub fn stop(&mut self) -> Result<(), AxisError> {
        self.device
            .pulse(&mut self.link, STOP_REQ_REG, &self.pulse)
            .map_err(|e| self.transaction(e))
    }

    pub fn clear_error(&mut self) -> Result<(), AxisError> {
        self.device
            .pulse(&mut self.link, CLEAR_REQ_REG, &self.pulse)
            .map_err(|e| self.transaction(e))
    }

    pub fn status(&mut self) -> Result<MotionStatus, AxisError> {
        self.device
            .read_status(&mut self.link)
            .map_err(|e| self.transaction(e))
    }

    pub fn position(&mut self) -> Result<f32, AxisError> {
        self.device
            .read_position(&mut self.link)
            .map_err(|e| self.transaction(e))
    }

    pub fn error_code(&mut self) -> Result<u16, AxisError> {
        self.device
            .read_error_code(&mut self.link)
            .map_err(|e| self.transaction(e))
    }

    pub fn set_backlash(&mut self, value: f32) -> Result<[u16; 2], AxisError> {
        self.device
            .set_backlash(&mut self.link, value)
            .map_err(|e| self.transaction(e))
    }

    pub fn backlash(&mut self) -> Result<f32, AxisError> {
        self.device
            .get_backlash(&mut self.link)
            .map_err(|e| self.transaction(e))
    }
}

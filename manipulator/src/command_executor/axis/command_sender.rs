use smcd14::{MotionStatus, MoveKind, MoveRegisters};
use utilities::command_executor::CommandSender;

use crate::{error::AxisError, models::AxisId};

use super::commands::{AxisCommand, AxisResponse};

#[derive(Clone)]
pub struct Smcd14CommandSender {
    axis: AxisId,
    sender: CommandSender<AxisCommand>,
}

impl Smcd14CommandSender {
    pub fn new(axis: AxisId, sender: CommandSender<AxisCommand>) -> Self {
        Self { axis, sender }
    }

    fn unexpected(&self, command: &'static str) -> AxisError {
        AxisError::UnexpectedResponse {
            axis: self.axis,
            command,
        }
    }

    pub async fn set_motor(&self, on: bool) -> Result<(), AxisError> {
        match self.sender.send_command(AxisCommand::Motor(on)).await? {
            AxisResponse::Ok => Ok(()),
            _ => Err(self.unexpected("motor")),
        }
    }

    pub async fn start_move(
        &self,
        kind: MoveKind,
        value: f32,
        speed: f32,
    ) -> Result<MoveRegisters, AxisError> {
        let response = self
            .sender
            .send_command(AxisCommand::Move { kind, value, speed })
            .await?;

        match response {
            AxisResponse::Move(registers) => Ok(registers),
            _ => Err(self.unexpected("move")),
        }
    }

    pub async fn stop(&self) -> Result<(), AxisError> {
        match self.sender.send_command(AxisCommand::Stop).await? {
            AxisResponse::Ok => Ok(()),
            _ => Err(self.unexpected("stop")),
        }
    }

    pub async fn clear_error(&self) -> Result<(), AxisError> {
        match self.sender.send_command(AxisCommand::ClearError).await? {
            AxisResponse::Ok => Ok(()),
            _ => Err(self.unexpected("clear_error")),
        }
    }

    pub async fn read_status(&self) -> Result<MotionStatus, AxisError> {
        match self.sender.send_command(AxisCommand::ReadStatus).await? {
            AxisResponse::Status(status) => Ok(status),
            _ => Err(self.unexpected("read_status")),
        }
    }

    pub async fn read_position(&self) -> Result<f32, AxisError> {
        match self.sender.send_command(AxisCommand::ReadPosition).await? {
            AxisResponse::Value(position) => Ok(position),
            _ => Err(self.unexpected("read_position")),
        }
    }

    pub async fn read_error_code(&self) -> Result<u16, AxisError> {
        match self.sender.send_command(AxisCommand::ReadErrorCode).await? {
            AxisResponse::ErrorCode(code) => Ok(code),
            _ => Err(self.unexpected("read_error_code")),
        }
    }

    pub async fn set_backlash(&self, value: f32) -> Result<[u16; 2], AxisError> {
        match self.sender.send_command(AxisCommand::SetBacklash(value)).await? {
            AxisResponse::Registers(registers) => Ok(registers),
            _ => Err(self.unexpected("set_backlash")),
        }
    }

    pub async fn read_backlash(&self) -> Result<f32, AxisError> {
        match self.sender.send_command(AxisCommand::ReadBacklash).await? {
            AxisResponse::Value(value) => Ok(value),
            _ => Err(self.unexpected("read_backlash")),
        }
    }
}

use smcd14::{MotionStatus, MoveKind, MoveRegisters};
use utilities::command_executor::Command;

use crate::{command_executor::axis::Smcd14Handler, error::AxisError};

#[derive(Debug, Clone, Copy)]
pub enum AxisCommand {
    Motor(bool),
    Move {
        kind: MoveKind,
        value: f32,
        speed: f32,
    },
    Stop,
    ClearError,
    ReadStatus,
    ReadPosition,
    ReadErrorCode,
    SetBacklash(f32),
    ReadBacklash,
}

#[derive(Debug)]
pub enum AxisResponse {
    Ok,
    Move(MoveRegisters),
    Status(MotionStatus),
    Value(f32),
    ErrorCode(u16),
    Registers([u16; 2]),
}

impl Command for AxisCommand {
    type Response = AxisResponse;
    type Error = AxisError;
    type Handler = Smcd14Handler;

    fn name(&self) -> &'static str {
        match self {
            AxisCommand::Motor(_) => "motor",
            AxisCommand::Move { .. } => "move",
            AxisCommand::Stop => "stop",
            AxisCommand::ClearError => "clear_error",
            AxisCommand::ReadStatus => "read_status",
            AxisCommand::ReadPosition => "read_position",
            AxisCommand::ReadErrorCode => "read_error_code",
            AxisCommand::SetBacklash(_) => "set_backlash",
            AxisCommand::ReadBacklash => "read_backlash",
        }
    }

    fn execute(self, handler: &mut Self::Handler) -> Result<Self::Response, Self::Error> {
        match self {
            AxisCommand::Motor(on) => {
                handler.set_motor(on)?;
                Ok(AxisResponse::Ok)
            }
            AxisCommand::Move { kind, value, speed } => {
                let registers = handler.start_move(kind, value, speed)?;
                Ok(AxisResponse::Move(registers))
            }
            AxisCommand::Stop => {
                handler.stop()?;
                Ok(AxisResponse::Ok)
            }
            AxisCommand::ClearError => {
                handler.clear_error()?;
                Ok(AxisResponse::Ok)
            }
            AxisCommand::ReadStatus => Ok(AxisResponse::Status(handler.status()?)),
            AxisCommand::ReadPosition => Ok(AxisResponse::Value(handler.position()?)),
            AxisCommand::ReadErrorCode => Ok(AxisResponse::ErrorCode(handler.error_code()?)),
            AxisCommand::SetBacklash(value) => {
                Ok(AxisResponse::Registers(handler.set_backlash(value)?))
            }
            AxisCommand::ReadBacklash => Ok(AxisResponse::Value(handler.backlash()?)),
        }
    }
}

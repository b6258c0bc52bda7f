use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use bitflags::bitflags;
use tracing::debug;
use utilities::modbus::{Modbus, ModbusError};

pub mod codec;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use codec::{FormatError, float_to_registers, registers_to_float};

pub const MOVE_TYPE_REG: u16 = 0;
pub const TARGET_POS_REG: u16 = 2;
pub const TARGET_SPEED_REG: u16 = 8;
pub const MOTOR_ON_REG: u16 = 14;
pub const START_REQ_REG: u16 = 15;
pub const STOP_REQ_REG: u16 = 16;
pub const STATUS_REG: u16 = 17;
pub const ACTUAL_POS_REG: u16 = 18;
pub const ERROR_CODE_REG: u16 = 20;
pub const CLEAR_REQ_REG: u16 = 22;
pub const BACKLASH_REG: u16 = 72;

bitflags!(
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MotionStatus: u16 {
        const RUNNING = 0b0000_0000_0000_0001;
        const IN_POSITION = 0b0000_0000_0001_0000;
    }
);

impl MotionStatus {
    /// Keeps unknown bits so diagnostics show the raw word.
    pub fn from_word(word: u16) -> Self {
        Self::from_bits_retain(word)
    }

    pub fn is_running(&self) -> bool {
        self.contains(MotionStatus::RUNNING)
    }

    pub fn in_position(&self) -> bool {
        self.contains(MotionStatus::IN_POSITION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Absolute = 1,
    Relative = 2,
}

/// Timing of the write-1 / write-0 / wait-for-clear request sequence.
#[derive(Debug, Clone, Copy)]
pub struct PulseTiming {
    pub settle: Duration,
    pub deadline: Duration,
    pub poll: Duration,
}

impl Default for PulseTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(50),
            deadline: Duration::from_secs(1),
            poll: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Smcd14Error {
    #[error("transaction on register {register} failed: {source}")]
    Transaction {
        register: u16,
        #[source]
        source: ModbusError,
    },
    #[error("register {register} did not clear")]
    RegisterNotCleared { register: u16 },
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl Smcd14Error {
    pub fn register(&self) -> Option<u16> {
        match self {
            Smcd14Error::Transaction { register, .. }
            | Smcd14Error::RegisterNotCleared { register } => Some(*register),
            Smcd14Error::Format(_) => None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Smcd14Error::Transaction { source, .. } if source.is_disconnect())
    }
}

/// Register values written for one move request, kept for the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRegisters {
    pub kind: MoveKind,
    pub target: [u16; 2],
    pub speed: [u16; 2],
}

#[derive(Debug, Clone)]
pub struct Smcd14 {
    client: Modbus,
}

impl Smcd14 {
    pub fn new(device_address: u8) -> Self {
        Self {
            client: Modbus::new(device_address),
        }
    }

    pub fn device_address(&self) -> u8 {
        self.client.id()
    }

    fn write(
        &self,
        client: &mut (impl Write + Read),
        register: u16,
        value: u16,
    ) -> Result<(), Smcd14Error> {
        debug!(unit = self.device_address(), register, value, "write register");
        self.client
            .write_single_register(client, register, value)
            .map_err(|source| Smcd14Error::Transaction { register, source })
    }

    fn write_float(
        &self,
        client: &mut (impl Write + Read),
        register: u16,
        value: f32,
    ) -> Result<[u16; 2], Smcd14Error> {
        let registers = float_to_registers(value);
        debug!(unit = self.device_address(), register, value, ?registers, "write float");
        self.client
            .write_multiple_registers(client, register, &registers)
            .map_err(|source| Smcd14Error::Transaction { register, source })?;
        Ok(registers)
    }

    fn read(
        &self,
        client: &mut (impl Write + Read),
        register: u16,
        count: u16,
    ) -> Result<Vec<u16>, Smcd14Error> {
        self.client
            .read_holding_registers(client, register, count)
            .map_err(|source| Smcd14Error::Transaction { register, source })
    }

    fn read_float(
        &self,
        client: &mut (impl Write + Read),
        register: u16,
    ) -> Result<f32, Smcd14Error> {
        let registers = self.read(client, register, 2)?;
        Ok(registers_to_float(&registers)?)
    }

    pub fn set_motor(&self, client: &mut (impl Write + Read), on: bool) -> Result<(), Smcd14Error> {
        self.write(client, MOTOR_ON_REG, on as u16)
    }

    /// Writes move type, target and speed. Motion starts only after a
    /// [`START_REQ_REG`] pulse.
    pub fn write_move(
        &self,
        client: &mut (impl Write + Read),
        kind: MoveKind,
        target: f32,
        speed: f32,
    ) -> Result<MoveRegisters, Smcd14Error> {
        self.write(client, MOVE_TYPE_REG, kind as u16)?;
        let target = self.write_float(client, TARGET_POS_REG, target)?;
        let speed = self.write_float(client, TARGET_SPEED_REG, speed)?;

        Ok(MoveRegisters {
            kind,
            target,
            speed,
        })
    }

    /// Edge-triggers a request register: write 1, settle, write 0, then wait
    /// for the device to read back 0.
    pub fn pulse(
        &self,
        client: &mut (impl Write + Read),
        register: u16,
        timing: &PulseTiming,
    ) -> Result<(), Smcd14Error> {
        self.write(client, register, 1)?;
        std::thread::sleep(timing.settle);
        self.write(client, register, 0)?;

        let deadline = Instant::now() + timing.deadline;
        loop {
            if self.read(client, register, 1)?[0] == 0 {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(Smcd14Error::RegisterNotCleared { register });
            }
            std::thread::sleep(timing.poll);
        }
    }

    pub fn read_status(&self, client: &mut (impl Write + Read)) -> Result<MotionStatus, Smcd14Error> {
        let word = self.read(client, STATUS_REG, 1)?[0];
        Ok(MotionStatus::from_word(word))
    }

    pub fn read_position(&self, client: &mut (impl Write + Read)) -> Result<f32, Smcd14Error> {
        self.read_float(client, ACTUAL_POS_REG)
    }

    pub fn read_error_code(&self, client: &mut (impl Write + Read)) -> Result<u16, Smcd14Error> {
        Ok(self.read(client, ERROR_CODE_REG, 1)?[0])
    }

    pub fn set_backlash(
        &self,
        client: &mut (impl Write + Read),
        value: f32,
    ) -> Result<[u16; 2], Smcd14Error> {
        self.write_float(client, BACKLASH_REG, value)
    }

    pub fn get_backlash(&self, client: &mut (impl Write + Read)) -> Result<f32, Smcd14Error> {
        self.read_float(client, BACKLASH_REG)
    }
}

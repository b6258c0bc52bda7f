//! Register-level simulator of SMCD14 axes sharing one Modbus TCP endpoint.
//!
//! Motion is modelled in wall-clock time (optionally sped up), which is enough
//! to exercise start pulses, running / in-position bits, stops and stalls.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use utilities::modbus::{FrameHeader, encode_frame, read_frame};

use crate::{
    ACTUAL_POS_REG, BACKLASH_REG, CLEAR_REQ_REG, ERROR_CODE_REG, MOVE_TYPE_REG, MotionStatus,
    START_REQ_REG, STATUS_REG, STOP_REQ_REG, TARGET_POS_REG, TARGET_SPEED_REG, float_to_registers,
    registers_to_float,
};

const REGISTER_COUNT: usize = 128;

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_ADDRESS: u8 = 0x02;
const DEVICE_FAILURE: u8 = 0x04;
const GATEWAY_TARGET_FAILED: u8 = 0x0B;

struct Motion {
    from: f32,
    to: f32,
    speed: f32,
    started: Instant,
}

struct AxisState {
    registers: [u16; REGISTER_COUNT],
    position: f32,
    motion: Option<Motion>,
    time_scale: f32,

    writes: Vec<(u16, u16)>,
    armed: HashSet<u16>,
    start_pulses: u32,
    stop_pulses: u32,

    ignore_start: bool,
    jammed: bool,
    latched: HashSet<u16>,
    rejected: HashSet<u16>,
}

impl AxisState {
    fn new() -> Self {
        let mut state = Self {
            registers: [0; REGISTER_COUNT],
            position: 0.0,
            motion: None,
            time_scale: 1.0,
            writes: Vec::new(),
            armed: HashSet::new(),
            start_pulses: 0,
            stop_pulses: 0,
            ignore_start: false,
            jammed: false,
            latched: HashSet::new(),
            rejected: HashSet::new(),
        };
        state.set_status(MotionStatus::IN_POSITION);
        state.store_position(0.0);
        state
    }

    fn set_status(&mut self, status: MotionStatus) {
        self.registers[STATUS_REG as usize] = status.bits();
    }

    fn store_position(&mut self, position: f32) {
        self.position = position;
        self.store_float(ACTUAL_POS_REG, position);
    }

    fn store_float(&mut self, register: u16, value: f32) {
        let [lo, hi] = float_to_registers(value);
        self.registers[register as usize] = lo;
        self.registers[register as usize + 1] = hi;
    }

    fn load_float(&self, register: u16) -> f32 {
        let start = register as usize;
        registers_to_float(&self.registers[start..start + 2]).unwrap_or_default()
    }

    fn advance(&mut self) {
        let Some(motion) = &self.motion else {
            return;
        };

        let distance = (motion.to - motion.from).abs();
        let travelled = motion.started.elapsed().as_secs_f32() * self.time_scale * motion.speed;

        if travelled >= distance {
            let to = motion.to;
            self.motion = None;
            self.store_position(to);
            self.set_status(MotionStatus::IN_POSITION);
        } else {
            let position = motion.from + (motion.to - motion.from).signum() * travelled;
            self.store_position(position);
            self.set_status(MotionStatus::RUNNING);
        }
    }

    fn start_motion(&mut self) {
        self.start_pulses += 1;
        if self.ignore_start {
            return;
        }

        let value = self.load_float(TARGET_POS_REG);
        let target = match self.registers[MOVE_TYPE_REG as usize] {
            2 => self.position + value,
            _ => value,
        };
        let speed = self.load_float(TARGET_SPEED_REG);

        if self.jammed {
            self.set_status(MotionStatus::empty());
        } else if speed <= 0.0 || target == self.position {
            self.set_status(MotionStatus::IN_POSITION);
        } else {
            self.motion = Some(Motion {
                from: self.position,
                to: target,
                speed,
                started: Instant::now(),
            });
            self.set_status(MotionStatus::RUNNING);
        }
    }

    fn stop_motion(&mut self) {
        self.stop_pulses += 1;
        self.advance();
        self.motion = None;
        self.set_status(MotionStatus::IN_POSITION);
    }

    fn write(&mut self, register: u16, value: u16) -> Result<(), u8> {
        if register as usize >= REGISTER_COUNT {
            return Err(ILLEGAL_ADDRESS);
        }
        if self.rejected.contains(&register) {
            return Err(DEVICE_FAILURE);
        }

        self.advance();
        self.writes.push((register, value));
        self.registers[register as usize] = value;

        if matches!(register, START_REQ_REG | STOP_REQ_REG | CLEAR_REQ_REG) {
            if value == 1 {
                self.armed.insert(register);
            } else if self.armed.remove(&register) {
                match register {
                    START_REQ_REG => self.start_motion(),
                    STOP_REQ_REG => self.stop_motion(),
                    _ => self.registers[ERROR_CODE_REG as usize] = 0,
                }
            }

            if self.latched.contains(&register) {
                self.registers[register as usize] = 1;
            }
        }

        Ok(())
    }

    fn read(&mut self, register: u16, count: u16) -> Result<Vec<u16>, u8> {
        let end = register as usize + count as usize;
        if end > REGISTER_COUNT {
            return Err(ILLEGAL_ADDRESS);
        }
        if (register..register + count).any(|r| self.rejected.contains(&r)) {
            return Err(DEVICE_FAILURE);
        }

        self.advance();
        Ok(self.registers[register as usize..end].to_vec())
    }
}

/// One simulated axis; clones share state.
#[derive(Clone)]
pub struct SimulatedAxis {
    state: Arc<Mutex<AxisState>>,
}

impl Default for SimulatedAxis {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAxis {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AxisState::new())),
        }
    }

    /// Runs simulated motion `scale` times faster than real time.
    pub fn with_time_scale(self, scale: f32) -> Self {
        self.state().time_scale = scale;
        self
    }

    fn state(&self) -> MutexGuard<'_, AxisState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, register: u16) -> u16 {
        let mut state = self.state();
        state.advance();
        state.registers[register as usize]
    }

    pub fn set_register(&self, register: u16, value: u16) {
        self.state().registers[register as usize] = value;
    }

    pub fn position(&self) -> f32 {
        let mut state = self.state();
        state.advance();
        state.position
    }

    pub fn set_position(&self, position: f32) {
        let mut state = self.state();
        state.motion = None;
        state.store_position(position);
    }

    pub fn set_error_code(&self, code: u16) {
        self.state().registers[ERROR_CODE_REG as usize] = code;
    }

    pub fn commanded_speed(&self) -> f32 {
        self.state().load_float(TARGET_SPEED_REG)
    }

    pub fn commanded_target(&self) -> f32 {
        self.state().load_float(TARGET_POS_REG)
    }

    pub fn backlash(&self) -> f32 {
        self.state().load_float(BACKLASH_REG)
    }

    pub fn is_running(&self) -> bool {
        let mut state = self.state();
        state.advance();
        state.motion.is_some()
    }

    /// Values written to `register`, in order.
    pub fn writes_to(&self, register: u16) -> Vec<u16> {
        self.state()
            .writes
            .iter()
            .filter(|(r, _)| *r == register)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn start_pulses(&self) -> u32 {
        self.state().start_pulses
    }

    pub fn stop_pulses(&self) -> u32 {
        self.state().stop_pulses
    }

    /// Accepts start pulses without ever moving.
    pub fn ignore_start(&self) {
        self.state().ignore_start = true;
    }

    /// Accepts start pulses, drops the in-position bit, never moves.
    pub fn jam(&self) {
        self.state().jammed = true;
    }

    /// The register keeps reading 1 after the device is asked to clear it.
    pub fn latch_register(&self, register: u16) {
        self.state().latched.insert(register);
    }

    /// Any access to the register is answered with a device-failure exception.
    pub fn reject_register(&self, register: u16) {
        self.state().rejected.insert(register);
    }

    pub fn accept_register(&self, register: u16) {
        self.state().rejected.remove(&register);
    }
}

/// A set of simulated axes addressed by unit id.
#[derive(Clone, Default)]
pub struct SimBus {
    axes: Arc<Mutex<HashMap<u8, SimulatedAxis>>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_axis(self, unit_id: u8, axis: SimulatedAxis) -> Self {
        self.axes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit_id, axis);
        self
    }

    fn axis(&self, unit_id: u8) -> Option<SimulatedAxis> {
        self.axes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&unit_id)
            .cloned()
    }

    /// Answers one request frame.
    pub fn handle(&self, header: &FrameHeader, pdu: &[u8]) -> Vec<u8> {
        let function = pdu.first().copied().unwrap_or_default();
        let response = match self.axis(header.unit_id) {
            Some(axis) => {
                let mut state = axis.state();
                Self::dispatch(&mut state, pdu)
            }
            None => Err(GATEWAY_TARGET_FAILED),
        };

        let pdu = response.unwrap_or_else(|code| vec![function | 0x80, code]);
        encode_frame(header.transaction_id, header.unit_id, &pdu)
    }

    fn dispatch(state: &mut AxisState, pdu: &[u8]) -> Result<Vec<u8>, u8> {
        let word = |at: usize| -> Result<u16, u8> {
            pdu.get(at..at + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or(ILLEGAL_ADDRESS)
        };

        match pdu.first().copied() {
            Some(0x03) => {
                let registers = state.read(word(1)?, word(3)?)?;
                let mut response = vec![0x03, (registers.len() * 2) as u8];
                for register in registers {
                    response.extend_from_slice(&register.to_be_bytes());
                }
                Ok(response)
            }
            Some(0x06) => {
                state.write(word(1)?, word(3)?)?;
                Ok(pdu.to_vec())
            }
            Some(0x10) => {
                let address = word(1)?;
                let count = word(3)?;
                for offset in 0..count {
                    state.write(address + offset, word(6 + offset as usize * 2)?)?;
                }
                Ok(pdu[..5].to_vec())
            }
            _ => Err(ILLEGAL_FUNCTION),
        }
    }

    /// In-memory connection to the bus.
    pub fn connection(&self) -> SimConnection {
        SimConnection {
            bus: self.clone(),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
        }
    }

    /// Serves the bus on an ephemeral localhost port, one thread per client.
    pub fn serve(&self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let bus = self.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let bus = bus.clone();
                std::thread::spawn(move || bus.serve_client(stream));
            }
        });

        Ok(addr)
    }

    fn serve_client(&self, mut stream: TcpStream) {
        while let Ok((header, pdu)) = read_frame(&mut stream) {
            let response = self.handle(&header, &pdu);
            if stream.write_all(&response).is_err() {
                break;
            }
        }
    }
}

/// Byte-stream view of a [`SimBus`], usable wherever a socket is expected.
pub struct SimConnection {
    bus: SimBus,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
}

impl Read for SimConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbound.extend_from_slice(buf);

        while self.inbound.len() >= 7 {
            let mut cursor = io::Cursor::new(&self.inbound);
            let Ok((header, pdu)) = read_frame(&mut cursor) else {
                break;
            };
            let consumed = cursor.position() as usize;
            let response = self.bus.handle(&header, &pdu);
            self.outbound.extend(response);
            self.inbound.drain(..consumed);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//! In-memory axes for manager tests; motion follows tokio's clock.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use smcd14::MotionStatus;
use tokio::time::Instant;

use crate::{
    config::{MotionConfig, TimingConfig},
    controller::{
        driver::{AxisDriver, WaitOutcome},
        manager::MultiAxisManager,
    },
    error::{AxisError, Diagnostics},
    events::{EventScope, EventSink, ManagerEvent, TransactionLog},
    models::AxisId,
    pause::PauseGate,
};

const POLL: Duration = Duration::from_millis(10);
const RUNNING_BIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    Normal,
    /// Accepts moves but never leaves its position.
    NeverStart,
    /// Stops halfway to every target.
    Stall,
    /// Every position read fails.
    FailReads,
}

struct Motion {
    from: f64,
    to: f64,
    speed: f64,
    started: Instant,
}

struct State {
    behavior: Behavior,
    connect_result: bool,
    connected: bool,
    position: f64,
    motion: Option<Motion>,
    moves: Vec<(f64, f64)>,
    waits: Vec<Duration>,
    stops: usize,
    backlash: Option<f64>,
    last_speed: Option<f64>,
    move_delay: Duration,
}

impl State {
    /// Advances the simulated motion to `now`.
    fn settle(&mut self, now: Instant) {
        let Some(motion) = &self.motion else {
            return;
        };

        let span = motion.to - motion.from;
        let covered = motion.speed * now.duration_since(motion.started).as_secs_f64();
        if covered >= span.abs() {
            self.position = motion.to;
            self.motion = None;
        } else {
            self.position = motion.from + covered.copysign(span);
        }
    }
}

pub(crate) struct FakeAxis {
    axis: AxisId,
    state: Mutex<State>,
}

impl FakeAxis {
    pub(crate) fn new(axis: AxisId) -> Self {
        Self {
            axis,
            state: Mutex::new(State {
                behavior: Behavior::Normal,
                connect_result: true,
                connected: false,
                position: 0.0,
                motion: None,
                moves: Vec::new(),
                waits: Vec::new(),
                stops: 0,
                backlash: None,
                last_speed: None,
                move_delay: Duration::ZERO,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.settle(Instant::now());
        state
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        self.state().behavior = behavior;
    }

    pub(crate) fn set_connect_result(&self, connected: bool) {
        self.state().connect_result = connected;
    }

    /// Time each move request spends on the wire before the axis starts.
    pub(crate) fn set_move_delay(&self, delay: Duration) {
        self.state().move_delay = delay;
    }

    pub(crate) fn set_position(&self, position: f64) {
        self.state().position = position;
    }

    pub(crate) fn position(&self) -> f64 {
        self.state().position
    }

    /// `(target, speed)` of every accepted move.
    pub(crate) fn moves(&self) -> Vec<(f64, f64)> {
        self.state().moves.clone()
    }

    /// Timeout handed to every wait.
    pub(crate) fn waits(&self) -> Vec<Duration> {
        self.state().waits.clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.state().stops
    }

    pub(crate) fn backlash(&self) -> Option<f64> {
        self.state().backlash
    }

    fn diagnostics() -> Diagnostics {
        Diagnostics {
            status: MotionStatus::IN_POSITION,
            error_code: 7,
        }
    }
}

#[async_trait]
impl AxisDriver for FakeAxis {
    fn axis(&self) -> AxisId {
        self.axis
    }

    async fn connect(&self) -> Result<bool, AxisError> {
        let mut state = self.state();
        state.connected = state.connect_result;
        Ok(state.connected)
    }

    async fn disconnect(&self) {
        self.state().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn motor_on(&self) -> Result<(), AxisError> {
        Ok(())
    }

    async fn move_absolute(&self, position: f64, speed: f64) -> Result<(), AxisError> {
        let delay = self.state().move_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.moves.push((position, speed));
        state.last_speed = Some(speed);

        let from = state.position;
        let to = match state.behavior {
            Behavior::NeverStart => return Ok(()),
            Behavior::Stall => from + (position - from) / 2.0,
            Behavior::Normal | Behavior::FailReads => position,
        };
        if speed > 0.0 {
            state.motion = Some(Motion {
                from,
                to,
                speed,
                started: Instant::now(),
            });
        }
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), AxisError> {
        let mut state = self.state();
        state.stops += 1;
        state.motion = None;
        Ok(())
    }

    async fn read_position(&self) -> Result<f64, AxisError> {
        let state = self.state();
        if state.behavior == Behavior::FailReads {
            return Err(AxisError::NotConnected { axis: self.axis });
        }
        Ok(state.position)
    }

    async fn set_backlash(&self, value: f64) -> Result<(), AxisError> {
        self.state().backlash = Some(value);
        Ok(())
    }

    fn last_speed(&self) -> Option<f64> {
        self.state().last_speed
    }

    async fn wait_until_in_position(
        &self,
        timeout: Duration,
        target: Option<f64>,
        pause: Option<&PauseGate>,
    ) -> Result<WaitOutcome, AxisError> {
        let behavior = {
            let mut state = self.state();
            state.waits.push(timeout);
            state.behavior
        };
        if behavior == Behavior::NeverStart {
            tokio::time::sleep(RUNNING_BIT_TIMEOUT).await;
            return Ok(WaitOutcome::NeverStarted(Self::diagnostics()));
        }

        loop {
            if pause.is_some_and(|gate| !gate.is_running()) {
                self.emergency_stop().await?;
                return Ok(WaitOutcome::Paused);
            }

            let (position, moving) = {
                let state = self.state();
                (state.position, state.motion.is_some())
            };
            if !moving {
                if target.is_none_or(|target| (position - target).abs() <= 1e-9) {
                    return Ok(WaitOutcome::Arrived);
                }
                tokio::time::sleep(timeout).await;
                return Ok(WaitOutcome::Stalled(Self::diagnostics()));
            }

            tokio::time::sleep(POLL).await;
        }
    }
}

/// Sink that keeps every event for later assertions.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<ManagerEvent>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<ManagerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ManagerEvent::Status(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn errors(&self) -> Vec<(EventScope, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ManagerEvent::Error { scope, message } => Some((scope, message)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: ManagerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// A manager over three fake axes, returned in x, y, z order.
pub(crate) fn fake_manager(
    motion: MotionConfig,
) -> (MultiAxisManager, Vec<Arc<FakeAxis>>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let log = Arc::new(TransactionLog::new(sink.clone()));
    let axes: Vec<Arc<FakeAxis>> = AxisId::ALL
        .into_iter()
        .map(|axis| Arc::new(FakeAxis::new(axis)))
        .collect();

    let drivers = axes
        .iter()
        .map(|axis| Arc::clone(axis) as Arc<dyn AxisDriver>);
    let manager = MultiAxisManager::new(drivers, motion, TimingConfig::default(), log);

    (manager, axes, sink)
}

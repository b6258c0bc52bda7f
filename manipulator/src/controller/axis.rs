use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use smcd14::{
    ACTUAL_POS_REG, BACKLASH_REG, CLEAR_REQ_REG, ERROR_CODE_REG, MOTOR_ON_REG, MOVE_TYPE_REG,
    MotionStatus, MoveKind, MoveRegisters, START_REQ_REG, STATUS_REG, STOP_REQ_REG, Smcd14,
    TARGET_POS_REG, TARGET_SPEED_REG,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use utilities::{
    command_executor::{CommandExecutor, ExecutorError},
    tcp_link::TcpLink,
};

use crate::{
    command_executor::axis::{Smcd14Handler, command_sender::Smcd14CommandSender},
    config::{AxisAddress, Config, TimingConfig},
    controller::driver::{AxisDriver, WaitOutcome},
    error::{AxisError, Diagnostics},
    events::TransactionLog,
    models::AxisId,
    pause::PauseGate,
    speed::SpeedLimits,
};

#[derive(Debug, Clone)]
pub struct AxisSettings {
    pub axis: AxisId,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub device_address: u8,
    pub position_tolerance: f64,
    pub speed: SpeedLimits,
    pub timing: TimingConfig,
}

impl AxisSettings {
    pub fn from_config(config: &Config, entry: &AxisAddress) -> Self {
        Self {
            axis: entry.axis,
            host: config.connection.host.clone(),
            port: config.connection.port,
            timeout: config.connection.timeout(),
            device_address: entry.device_address,
            position_tolerance: config.motion.position_tolerance,
            speed: config.motion.speed_limits(),
            timing: config.timing.clone(),
        }
    }
}

/// One SMCD14 axis reached over its own Modbus TCP connection.
///
/// Register traffic runs on a dedicated executor thread, so requests to the
/// same axis queue behind each other and a move's start pulse is never
/// interleaved with another request.
pub struct AxisController {
    settings: AxisSettings,
    sender: Mutex<Option<Smcd14CommandSender>>,
    last_speed: Mutex<Option<f64>>,
    log: Arc<TransactionLog>,
}

impl AxisController {
    pub fn new(settings: AxisSettings, log: Arc<TransactionLog>) -> Self {
        Self {
            settings,
            sender: Mutex::new(None),
            last_speed: Mutex::new(None),
            log,
        }
    }

    pub fn settings(&self) -> &AxisSettings {
        &self.settings
    }

    fn sender(&self) -> Result<Smcd14CommandSender, AxisError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AxisError::NotConnected {
                axis: self.settings.axis,
            })
    }

    fn config_error(&self, message: String) -> AxisError {
        AxisError::Config {
            axis: self.settings.axis,
            message,
        }
    }

    #[instrument(skip(self), fields(axis = %self.settings.axis))]
    pub async fn connect(&self) -> Result<bool, AxisError> {
        let AxisSettings {
            axis,
            host,
            port,
            timeout,
            device_address,
            ..
        } = self.settings.clone();

        if host.trim().is_empty() {
            return Err(self.config_error("host is empty".to_string()));
        }
        if port == 0 {
            return Err(self.config_error("port must be non-zero".to_string()));
        }
        if timeout.is_zero() {
            return Err(self.config_error("timeout must be positive".to_string()));
        }

        self.disconnect().await;

        let target = format!("{host}:{port}");
        let opened = tokio::task::spawn_blocking(move || {
            TcpLink::resolve(&host, port).map(|addr| {
                let mut link = TcpLink::new(addr, timeout, timeout, timeout);
                link.open().map(|()| link)
            })
        })
        .await
        .map_err(|_| ExecutorError::Stopped)?;

        let link = match opened {
            Err(e) => return Err(self.config_error(format!("cannot resolve {target}: {e}"))),
            Ok(Err(e)) => {
                warn!(%target, error = %e, "Connection failed");
                return Ok(false);
            }
            Ok(Ok(link)) => link,
        };

        let handler = Smcd14Handler::new(
            axis,
            link,
            Smcd14::new(device_address),
            self.settings.timing.pulse(),
        );
        let (executor, sender) = CommandExecutor::new(handler);
        executor.spawn();

        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Smcd14CommandSender::new(axis, sender));

        info!(%target, device_address, "Axis connected");
        Ok(true)
    }

    /// Drops the executor handle; the link closes once queued requests finish.
    pub async fn disconnect(&self) {
        let previous = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if previous.is_some() {
            info!(axis = %self.settings.axis, "Axis disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn motor_on(&self) -> Result<(), AxisError> {
        self.sender()?.set_motor(true).await?;
        self.log.record(
            self.settings.axis,
            "motor_on",
            "Motor ON",
            format!("{MOTOR_ON_REG}=1"),
        );
        Ok(())
    }

    pub async fn motor_off(&self) -> Result<(), AxisError> {
        self.sender()?.set_motor(false).await?;
        self.log.record(
            self.settings.axis,
            "motor_off",
            "Motor OFF",
            format!("{MOTOR_ON_REG}=0"),
        );
        Ok(())
    }

    fn record_move(&self, action: &str, description: String, registers: &MoveRegisters) {
        let raw = format!(
            "{MOVE_TYPE_REG}={}; {TARGET_POS_REG}={:?}; {TARGET_SPEED_REG}={:?}; {START_REQ_REG}=1->0",
            registers.kind as u16, registers.target, registers.speed
        );
        self.log.record(self.settings.axis, action, description, raw);
    }

    async fn start_move(&self, kind: MoveKind, value: f64, speed: f64) -> Result<f64, AxisError> {
        let sender = self.sender()?;
        let axis_speed = self.settings.speed.adjust_axis_speed(speed.abs());

        let registers = sender
            .start_move(kind, value as f32, axis_speed as f32)
            .await?;
        *self.last_speed.lock().unwrap_or_else(PoisonError::into_inner) = Some(axis_speed);

        debug!(axis = %self.settings.axis, ?kind, value, axis_speed, "Move started");
        let action = match kind {
            MoveKind::Absolute => "move_absolute",
            MoveKind::Relative => "move_relative",
        };
        let description = match kind {
            MoveKind::Absolute => format!("Move to {value} mm @ {axis_speed} mm/s"),
            MoveKind::Relative => format!("Move by {value} mm @ {axis_speed} mm/s"),
        };
        self.record_move(action, description, &registers);

        Ok(axis_speed)
    }

    /// Moves to `position` mm; the speed magnitude is clamped to the axis limits.
    pub async fn move_absolute(&self, position: f64, speed: f64) -> Result<(), AxisError> {
        self.start_move(MoveKind::Absolute, position, speed)
            .await
            .map(|_| ())
    }

    pub async fn move_relative(&self, distance: f64, speed: f64) -> Result<(), AxisError> {
        self.start_move(MoveKind::Relative, distance, speed)
            .await
            .map(|_| ())
    }

    pub async fn emergency_stop(&self) -> Result<(), AxisError> {
        self.sender()?.stop().await?;
        self.log.record(
            self.settings.axis,
            "emergency_stop",
            "Emergency stop",
            format!("{STOP_REQ_REG}=1->0"),
        );
        Ok(())
    }

    pub async fn clear_error(&self) -> Result<(), AxisError> {
        self.sender()?.clear_error().await?;
        self.log.record(
            self.settings.axis,
            "clear_error",
            "Clear error",
            format!("{CLEAR_REQ_REG}=1->0"),
        );
        Ok(())
    }

    pub async fn read_position(&self) -> Result<f64, AxisError> {
        let position = self.sender()?.read_position().await?;
        debug!(axis = %self.settings.axis, register = ACTUAL_POS_REG, position, "Position read");
        Ok(f64::from(position))
    }

    pub async fn read_error_code(&self) -> Result<u16, AxisError> {
        let code = self.sender()?.read_error_code().await?;
        debug!(axis = %self.settings.axis, register = ERROR_CODE_REG, code, "Error code read");
        Ok(code)
    }

    pub async fn read_status(&self) -> Result<MotionStatus, AxisError> {
        self.sender()?.read_status().await
    }

    pub async fn set_backlash(&self, value: f64) -> Result<(), AxisError> {
        let registers = self.sender()?.set_backlash(value as f32).await?;
        self.log.record(
            self.settings.axis,
            "set_backlash",
            format!("Backlash {value}"),
            format!("{BACKLASH_REG}={registers:?}"),
        );
        Ok(())
    }

    pub async fn get_backlash(&self) -> Result<f64, AxisError> {
        Ok(f64::from(self.sender()?.read_backlash().await?))
    }

    pub fn last_speed(&self) -> Option<f64> {
        *self.last_speed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Polls the axis until it reports in position, stalls, never starts or
    /// is paused.
    ///
    /// `timeout` bounds the time since the axis last showed progress, not the
    /// whole wait. While `pause` is closed the axis is stopped once and the
    /// wait returns [`WaitOutcome::Paused`] as soon as it stops running.
    #[instrument(skip(self, pause), fields(axis = %self.settings.axis))]
    pub async fn wait_until_in_position(
        &self,
        timeout: Duration,
        target: Option<f64>,
        pause: Option<&PauseGate>,
    ) -> Result<WaitOutcome, AxisError> {
        let sender = self.sender()?;
        let tolerance = self.settings.position_tolerance;
        let timing = &self.settings.timing;
        let on_target = |position: Option<f64>| match (target, position) {
            (Some(target), Some(position)) => (position - target).abs() <= tolerance,
            _ => false,
        };

        let mut last_change = Instant::now();
        let running_deadline = last_change + timing.running_bit_timeout();
        let mut motion_started = false;
        let mut stop_sent = false;
        let mut last_position = sender.read_position().await.ok().map(f64::from);

        loop {
            let status = sender.read_status().await?;
            let position = sender.read_position().await.ok().map(f64::from);

            if on_target(position) && status.in_position() {
                return Ok(WaitOutcome::Arrived);
            }

            if pause.is_some_and(|gate| !gate.is_running()) {
                if !stop_sent {
                    if let Err(e) = self.emergency_stop().await {
                        warn!(error = %e, "Stop on pause failed");
                    }
                    stop_sent = true;
                }
                if !status.is_running() {
                    return Ok(WaitOutcome::Paused);
                }
                tokio::time::sleep(timing.pause_poll()).await;
                continue;
            }

            if status.is_running() {
                motion_started = true;
                last_change = Instant::now();
            }

            if !motion_started
                && !status.is_running()
                && status.in_position()
                && Instant::now() > running_deadline
            {
                let error_code = sender.read_error_code().await?;
                let diagnostics = Diagnostics { status, error_code };
                debug!(
                    register = STATUS_REG,
                    status = status.bits(),
                    error_code,
                    "Start request accepted but axis never moved"
                );
                return Ok(WaitOutcome::NeverStarted(diagnostics));
            }

            if let Some(current) = position {
                if last_position.is_none_or(|last| (current - last).abs() > tolerance) {
                    motion_started = true;
                    last_position = Some(current);
                    last_change = Instant::now();
                }
            }

            if motion_started
                && status.in_position()
                && (target.is_none() || position.is_none() || on_target(position))
            {
                return Ok(WaitOutcome::Arrived);
            }

            if last_change.elapsed() >= timeout {
                if on_target(position) {
                    return Ok(WaitOutcome::Arrived);
                }
                let error_code = sender.read_error_code().await?;
                let status = sender.read_status().await?;
                return Ok(WaitOutcome::Stalled(Diagnostics { status, error_code }));
            }

            tokio::time::sleep(timing.poll_interval()).await;
        }
    }
}

#[async_trait]
impl AxisDriver for AxisController {
    fn axis(&self) -> AxisId {
        self.settings.axis
    }

    async fn connect(&self) -> Result<bool, AxisError> {
        AxisController::connect(self).await
    }

    async fn disconnect(&self) {
        AxisController::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        AxisController::is_connected(self)
    }

    async fn motor_on(&self) -> Result<(), AxisError> {
        AxisController::motor_on(self).await
    }

    async fn move_absolute(&self, position: f64, speed: f64) -> Result<(), AxisError> {
        AxisController::move_absolute(self, position, speed).await
    }

    async fn emergency_stop(&self) -> Result<(), AxisError> {
        AxisController::emergency_stop(self).await
    }

    async fn read_position(&self) -> Result<f64, AxisError> {
        AxisController::read_position(self).await
    }

    async fn set_backlash(&self, value: f64) -> Result<(), AxisError> {
        AxisController::set_backlash(self, value).await
    }

    fn last_speed(&self) -> Option<f64> {
        AxisController::last_speed(self)
    }

    async fn wait_until_in_position(
        &self,
        timeout: Duration,
        target: Option<f64>,
        pause: Option<&PauseGate>,
    ) -> Result<WaitOutcome, AxisError> {
        AxisController::wait_until_in_position(self, timeout, target, pause).await
    }
}

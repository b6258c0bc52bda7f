use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{Config, MotionConfig, TimingConfig},
    controller::{
        axis::{AxisController, AxisSettings},
        driver::{AxisDriver, MoveOutcome, WaitOutcome},
    },
    error::MotionError,
    events::{EventScope, EventSink, ManagerEvent, ModbusEvent, TransactionLog},
    models::{AxisId, Waypoint, format_point},
    pause::PauseGate,
    speed::{SpeedLimits, norm},
};

/// Deltas below this still count as travel during a direct (stop-and-go) hop.
const DIRECT_SKIP: f64 = 1e-9;

/// One axis that has been sent a move and still has to be awaited.
struct Commanded {
    axis: AxisId,
    driver: Arc<dyn AxisDriver>,
    target: f64,
    speed: f64,
    timeout: Duration,
}

/// Coordinates every configured axis of the stage.
///
/// Moves are issued to all travelling axes before any of them is awaited, so
/// the axes run concurrently on the hardware. Operator stops and pauses are
/// observed through a per-axis abort set and a shared [`PauseGate`].
pub struct MultiAxisManager {
    pub(super) axes: BTreeMap<AxisId, Arc<dyn AxisDriver>>,
    pub(super) motion: MotionConfig,
    pub(super) timing: TimingConfig,
    limits: SpeedLimits,
    pub(super) pause: PauseGate,
    aborted: Mutex<HashSet<AxisId>>,
    nozzle_diameter: Mutex<f64>,
    motion_logging: AtomicBool,
    pub(super) log: Arc<TransactionLog>,
    pub(super) monitor: Mutex<Option<JoinHandle<()>>>,
}

impl MultiAxisManager {
    pub fn new(
        axes: impl IntoIterator<Item = Arc<dyn AxisDriver>>,
        motion: MotionConfig,
        timing: TimingConfig,
        log: Arc<TransactionLog>,
    ) -> Self {
        let axes = axes
            .into_iter()
            .map(|driver| (driver.axis(), driver))
            .collect();
        let nozzle_diameter = motion.nozzle_diameter.max(0.0);

        Self {
            axes,
            limits: motion.speed_limits(),
            motion,
            timing,
            pause: PauseGate::new(),
            aborted: Mutex::new(HashSet::new()),
            nozzle_diameter: Mutex::new(nozzle_diameter),
            motion_logging: AtomicBool::new(false),
            log,
            monitor: Mutex::new(None),
        }
    }

    /// Builds one [`AxisController`] per configured axis, all sharing one
    /// transaction log that forwards to `sink`.
    pub fn from_config(config: &Config, sink: Arc<dyn EventSink>) -> Self {
        let log = Arc::new(TransactionLog::new(sink));
        let axes: Vec<Arc<dyn AxisDriver>> = config
            .connection
            .axes
            .iter()
            .map(|entry| {
                let settings = AxisSettings::from_config(config, entry);
                Arc::new(AxisController::new(settings, Arc::clone(&log))) as Arc<dyn AxisDriver>
            })
            .collect();

        let manager = Self::new(axes, config.motion.clone(), config.timing.clone(), log);
        manager.set_motion_logging(config.service.motion_logging);
        manager
    }

    pub fn pause_gate(&self) -> &PauseGate {
        &self.pause
    }

    pub fn speed_limits(&self) -> &SpeedLimits {
        &self.limits
    }

    pub fn axes(&self) -> impl Iterator<Item = AxisId> + '_ {
        self.axes.keys().copied()
    }

    pub(crate) fn driver(&self, axis: AxisId) -> Result<Arc<dyn AxisDriver>, MotionError> {
        self.axes
            .get(&axis)
            .cloned()
            .ok_or(MotionError::NotConfigured(axis))
    }

    pub(crate) fn publish(&self, event: ManagerEvent) {
        self.log.sink().publish(event);
    }

    pub fn transaction_log(&self) -> Vec<ModbusEvent> {
        self.log.snapshot()
    }

    pub fn nozzle_diameter(&self) -> f64 {
        *self
            .nozzle_diameter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Negative or non-finite diameters disable stop-and-go (stored as 0).
    pub fn set_nozzle_diameter(&self, diameter: f64) {
        let diameter = if diameter.is_finite() {
            diameter.max(0.0)
        } else {
            0.0
        };
        *self
            .nozzle_diameter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = diameter;
        debug!(diameter, "Nozzle diameter updated");
    }

    pub fn motion_logging(&self) -> bool {
        self.motion_logging.load(Ordering::Relaxed)
    }

    pub fn set_motion_logging(&self, enabled: bool) {
        self.motion_logging.store(enabled, Ordering::Relaxed);
    }

    fn aborted(&self) -> std::sync::MutexGuard<'_, HashSet<AxisId>> {
        self.aborted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_aborted(&self, axis: AxisId) {
        self.aborted().insert(axis);
    }

    fn clear_abort(&self, axis: AxisId) {
        self.aborted().remove(&axis);
    }

    /// Returns and clears the abort flag, so only one waiter sees it.
    fn consume_abort(&self, axis: AxisId) -> bool {
        self.aborted().remove(&axis)
    }

    /// Live coordinates, falling back per axis to `fallback` when a read fails.
    pub async fn live_position(&self, fallback: Waypoint) -> Waypoint {
        let mut point = fallback;
        for (axis, driver) in &self.axes {
            match driver.read_position().await {
                Ok(position) => point[axis.index()] = position,
                Err(e) => debug!(%axis, error = %e, "Position unavailable, keeping fallback"),
            }
        }
        point
    }

    #[instrument(skip(self))]
    pub async fn connect_all(self: &Arc<Self>) -> BTreeMap<AxisId, bool> {
        let mut status = BTreeMap::new();

        for (&axis, driver) in &self.axes {
            let connected = match driver.connect().await {
                Ok(connected) => connected,
                Err(e) => {
                    warn!(%axis, error = %e, "Axis connection failed");
                    self.publish(ManagerEvent::Error {
                        scope: axis.into(),
                        message: e.to_string(),
                    });
                    status.insert(axis, false);
                    continue;
                }
            };

            self.publish(ManagerEvent::ConnectionChanged { axis, connected });
            if connected {
                self.publish(ManagerEvent::Status(format!(
                    "{} axis connected",
                    axis.label()
                )));
                if let Err(e) = driver.set_backlash(0.0).await {
                    debug!(%axis, error = %e, "Backlash reset skipped");
                }
            }
            status.insert(axis, connected);
        }

        if status.values().any(|connected| *connected) {
            self.start_monitor();
        }
        info!(?status, "Connection attempt finished");
        status
    }

    #[instrument(skip(self))]
    pub async fn disconnect_all(&self) {
        self.stop_monitor();
        for (&axis, driver) in &self.axes {
            if driver.is_connected() {
                driver.disconnect().await;
                self.publish(ManagerEvent::ConnectionChanged {
                    axis,
                    connected: false,
                });
            }
        }
    }

    /// Moves one axis on its own. Returns the operator-facing outcome message.
    ///
    /// Unlike vector moves this wait does not follow the pause gate.
    #[instrument(skip(self))]
    pub async fn move_axis(
        &self,
        axis: AxisId,
        position: f64,
        speed: f64,
    ) -> Result<String, MotionError> {
        check_speed(speed)?;
        let driver = self.driver(axis)?;
        let label = axis.label();

        let current = driver.read_position().await.ok();
        if current.is_some_and(|current| (current - position).abs() <= self.motion.move_epsilon) {
            return Ok(format!("{label} already at {position:.3} mm"));
        }

        if let Err(e) = driver.motor_on().await {
            debug!(%axis, error = %e, "Motor on failed, moving anyway");
        }
        let axis_speed = self.limits.adjust_axis_speed(speed);
        self.clear_abort(axis);
        driver.move_absolute(position, axis_speed).await?;

        let travel = current.map_or(0.0, |current| position - current);
        let timeout = self.motion.wait_timeout(travel, axis_speed);
        let failure = match driver
            .wait_until_in_position(timeout, Some(position), None)
            .await?
        {
            // No gate was passed, so the wait cannot report a pause.
            WaitOutcome::Arrived | WaitOutcome::Paused => None,
            WaitOutcome::NeverStarted(diagnostics) => Some(MotionError::NeverStarted {
                axis,
                diagnostics,
            }),
            WaitOutcome::Stalled(diagnostics) => Some(MotionError::Stalled { axis, diagnostics }),
        };

        if let Some(error) = failure {
            self.settle_failure(axis, position, axis_speed, error)?;
            return Ok(format!("{label} move stopped"));
        }
        if self.consume_abort(axis) {
            self.record_aborted(axis, position, axis_speed);
            return Ok(format!("{label} move stopped"));
        }

        Ok(format!("{label} moved to {position:.3} mm"))
    }

    /// Moves from `start` to `target` with a resultant speed of `speed` mm/s.
    ///
    /// Speeds below the stop-and-go threshold are approximated by short hops
    /// with dwells in between once a nozzle diameter is set.
    #[instrument(skip(self))]
    pub async fn move_axes(
        &self,
        start: Waypoint,
        target: Waypoint,
        speed: f64,
    ) -> Result<MoveOutcome, MotionError> {
        check_speed(speed)?;
        let distance = norm(delta(start, target));
        if distance <= self.motion.move_epsilon {
            self.log.record(
                EventScope::All,
                "info",
                format!(
                    "Zero-distance move ignored start={} target={}",
                    format_point(&start),
                    format_point(&target)
                ),
                "",
            );
            return Ok(MoveOutcome::Completed);
        }

        if speed < self.motion.stop_go_speed_threshold && self.nozzle_diameter() > 0.0 {
            return self
                .move_axes_stop_and_go(start, target, speed, distance)
                .await;
        }

        self.run_vector_move(start, target, speed, false).await
    }

    async fn move_axes_stop_and_go(
        &self,
        start: Waypoint,
        target: Waypoint,
        requested: f64,
        distance: f64,
    ) -> Result<MoveOutcome, MotionError> {
        let hop = (self.nozzle_diameter() * self.motion.stop_go_step_fraction)
            .max(self.motion.move_epsilon);
        let hops = ((distance / hop).ceil() as usize).max(1);
        let hop_speed = self.motion.stop_go_hop_speed.max(requested);
        let deltas = delta(start, target);
        info!(hops, hop, hop_speed, requested, "Stop-and-go move");

        let mut previous = start;
        let mut travelled = 0.0;
        for _ in 0..hops {
            let segment = hop.min(distance - travelled);
            travelled += segment;
            let fraction = travelled / distance;
            let waypoint: Waypoint = std::array::from_fn(|i| start[i] + deltas[i] * fraction);

            let began = Instant::now();
            let outcome = self
                .run_vector_move(previous, waypoint, hop_speed, true)
                .await?;
            if outcome == MoveOutcome::Aborted {
                return Ok(outcome);
            }

            let mut moved = began.elapsed().as_secs_f64();
            if moved <= 0.0 {
                moved = segment / hop_speed;
            }
            let dwell = (segment / requested - moved).max(0.0);
            if dwell > 0.0 {
                self.log.record(
                    EventScope::All,
                    "dwell",
                    format!("segment={segment:.6}mm dwell={dwell:.3}s"),
                    "",
                );
                self.dwell(Duration::from_secs_f64(dwell)).await;
            }
            previous = waypoint;
        }

        Ok(MoveOutcome::Completed)
    }

    /// Sleeps in chunks, holding while the gate is closed.
    async fn dwell(&self, total: Duration) {
        let chunk = self.timing.dwell_chunk().max(Duration::from_millis(1));
        let mut remaining = total;

        while !remaining.is_zero() {
            self.pause.wait_running().await;
            let began = Instant::now();
            tokio::time::sleep(remaining.min(chunk)).await;
            remaining = remaining.saturating_sub(began.elapsed());
        }
    }

    /// Commands every travelling axis, then waits for each of them.
    ///
    /// A pause restarts the move from the live position once the gate opens.
    /// `direct` moves never divert to stop-and-go and command any axis with a
    /// non-zero delta.
    async fn run_vector_move(
        &self,
        start: Waypoint,
        target: Waypoint,
        speed: f64,
        direct: bool,
    ) -> Result<MoveOutcome, MotionError> {
        let mut current_start = start;

        loop {
            self.pause.wait_running().await;

            let deltas = delta(current_start, target);
            let distance = norm(deltas);
            if distance <= self.motion.move_epsilon {
                if !direct {
                    self.log.record(
                        EventScope::All,
                        "info",
                        format!(
                            "Zero-distance move ignored start={} target={}",
                            format_point(&current_start),
                            format_point(&target)
                        ),
                        "",
                    );
                    return Ok(MoveOutcome::Completed);
                }

                self.log.record(
                    EventScope::All,
                    "micro_move",
                    format!(
                        "distance={distance:.6} start={} target={}",
                        format_point(&current_start),
                        format_point(&target)
                    ),
                    "",
                );
                if self.motion_logging() {
                    info!(
                        target: "motion",
                        axis = "ALL",
                        distance,
                        start = %format_point(&current_start),
                        end = %format_point(&target),
                        "micro_move"
                    );
                }
            }

            let skip_below = if direct {
                DIRECT_SKIP
            } else {
                self.motion.move_epsilon
            };
            let speeds = self.limits.decompose(speed, deltas, skip_below);

            let mut commanded = Vec::new();
            let mut paused = false;
            for axis in AxisId::ALL {
                let i = axis.index();
                if deltas[i].abs() <= skip_below {
                    continue;
                }

                let driver = self.driver(axis)?;
                let axis_speed = speeds[i];
                if let Err(e) = driver.motor_on().await {
                    debug!(%axis, error = %e, "Motor on failed, moving anyway");
                }
                if !self.pause.is_running() {
                    paused = true;
                    break;
                }
                self.clear_abort(axis);
                if self.motion_logging() {
                    info!(target: "motion", %axis, position = target[i], speed = axis_speed, "move");
                }

                driver.move_absolute(target[i], axis_speed).await?;
                if let Some(sent) = driver.last_speed() {
                    if (sent - axis_speed).abs() > self.motion.move_epsilon {
                        warn!(%axis, sent, axis_speed, "Axis speed differs from the planned share");
                    }
                }
                let timeout = self.motion.wait_timeout(deltas[i], axis_speed);
                self.log.record(
                    axis,
                    "move",
                    format!("target={} speed={}", target[i], axis_speed),
                    "",
                );

                commanded.push(Commanded {
                    axis,
                    driver,
                    target: target[i],
                    speed: axis_speed,
                    timeout,
                });
                // A pause that landed while this axis was being started.
                if !self.pause.is_running() {
                    paused = true;
                    break;
                }
            }

            if paused {
                self.halt(&commanded).await;
                commanded.clear();
            }

            let mut pending = commanded.into_iter();
            while let Some(Commanded {
                axis,
                driver,
                target,
                speed,
                timeout,
            }) = pending.next()
            {
                let outcome = driver
                    .wait_until_in_position(timeout, Some(target), Some(&self.pause))
                    .await?;

                let error = match outcome {
                    WaitOutcome::Arrived => {
                        self.log.record(
                            axis,
                            "in_position",
                            format!("target={target} speed={speed}"),
                            "",
                        );
                        continue;
                    }
                    WaitOutcome::Paused => {
                        paused = true;
                        self.halt(pending.as_slice()).await;
                        break;
                    }
                    WaitOutcome::NeverStarted(diagnostics) => {
                        MotionError::NeverStarted { axis, diagnostics }
                    }
                    WaitOutcome::Stalled(diagnostics) => {
                        MotionError::Stalled { axis, diagnostics }
                    }
                };

                let outcome = self.settle_failure(axis, target, speed, error)?;
                self.publish(ManagerEvent::Status(format!(
                    "{} move stopped",
                    axis.label()
                )));
                return Ok(outcome);
            }

            if !paused {
                return Ok(MoveOutcome::Completed);
            }

            info!("Move paused, waiting for resume");
            self.pause.wait_running().await;
            current_start = self.live_position(current_start).await;
            debug!(start = %format_point(&current_start), "Restarting move from live position");
        }
    }

    /// Stops axes that were started but will not be awaited.
    async fn halt(&self, commanded: &[Commanded]) {
        for Commanded { axis, driver, .. } in commanded {
            if let Err(e) = driver.emergency_stop().await {
                debug!(%axis, error = %e, "Stop on pause failed");
            }
        }
    }

    /// Resolves a non-arrival: an operator stop wins over the fault.
    fn settle_failure(
        &self,
        axis: AxisId,
        target: f64,
        speed: f64,
        error: MotionError,
    ) -> Result<MoveOutcome, MotionError> {
        if self.consume_abort(axis) {
            self.record_aborted(axis, target, speed);
            return Ok(MoveOutcome::Aborted);
        }

        let raw = match &error {
            MotionError::NeverStarted { diagnostics, .. }
            | MotionError::Stalled { diagnostics, .. } => diagnostics.raw(),
            _ => String::new(),
        };
        warn!(%axis, %error, "Axis failed to reach position");
        self.log.record(axis, "error", error.to_string(), raw);
        self.publish(ManagerEvent::Error {
            scope: axis.into(),
            message: error.to_string(),
        });
        Err(error)
    }

    fn record_aborted(&self, axis: AxisId, target: f64, speed: f64) {
        info!(%axis, target, "Move aborted by operator");
        self.log
            .record(axis, "aborted", format!("target={target} speed={speed}"), "");
    }

    /// Vector move from the live position; announces the point on completion.
    #[instrument(skip(self))]
    pub async fn move_to_point(
        &self,
        target: Waypoint,
        speed: f64,
    ) -> Result<MoveOutcome, MotionError> {
        let start = self.live_position([0.0; 3]).await;
        let outcome = self.move_axes(start, target, speed).await?;

        if outcome == MoveOutcome::Completed {
            self.publish(ManagerEvent::Status(format!(
                "Moved to ({:.3}, {:.3}, {:.3})",
                target[0], target[1], target[2]
            )));
            self.publish(ManagerEvent::PointReached(target));
        }
        Ok(outcome)
    }

    /// Flags the axis as aborted before the stop reaches it.
    #[instrument(skip(self))]
    pub async fn emergency_stop(&self, axis: AxisId) -> Result<String, MotionError> {
        let driver = self.driver(axis)?;
        self.mark_aborted(axis);
        driver.emergency_stop().await?;
        Ok(format!("{} emergency stop executed", axis.label()))
    }

    pub async fn home_axis(&self, axis: AxisId) -> Result<String, MotionError> {
        self.driver(axis)?.motor_on().await?;
        Ok(format!("{} homing procedure started", axis.label()))
    }

    #[instrument(skip(self))]
    pub async fn pause_path(&self) {
        self.pause.pause();

        for (&axis, driver) in &self.axes {
            self.mark_aborted(axis);
            if let Err(e) = driver.emergency_stop().await {
                debug!(%axis, error = %e, "Stop on pause failed");
            }
        }
        self.publish(ManagerEvent::Status("Pattern paused".to_string()));
    }

    #[instrument(skip(self))]
    pub fn resume_path(&self) {
        self.pause.resume();
        self.publish(ManagerEvent::Status("Pattern resumed".to_string()));
    }
}

impl Drop for MultiAxisManager {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

fn check_speed(speed: f64) -> Result<(), MotionError> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(MotionError::NonPositiveSpeed(speed))
    }
}

pub(super) fn delta(from: Waypoint, to: Waypoint) -> [f64; 3] {
    std::array::from_fn(|i| to[i] - from[i])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::controller::fake::{Behavior, FakeAxis, RecordingSink, fake_manager};

    fn entries(manager: &MultiAxisManager, action: &str) -> Vec<ModbusEvent> {
        manager
            .transaction_log()
            .into_iter()
            .filter(|entry| entry.action == action)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn single_axis_vector_move_commands_only_that_axis() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());

        let outcome = manager
            .move_axes([0.0; 3], [1.0, 0.0, 0.0], 0.5)
            .await
            .unwrap();

        assert_eq!(outcome, MoveOutcome::Completed);
        assert_eq!(axes[0].moves(), vec![(1.0, 0.5)]);
        assert!(axes[1].moves().is_empty());
        assert!(axes[2].moves().is_empty());
        assert!((axes[0].position() - 1.0).abs() <= 4e-4);

        let moves = entries(&manager, "move");
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].scope, EventScope::Axis(AxisId::X));
        assert_eq!(moves[0].description, "target=1 speed=0.5");
        assert_eq!(entries(&manager, "in_position").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn underflowing_axis_is_clamped_to_minimum_speed() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());

        manager
            .move_axes([0.0; 3], [0.1, 100.0, 0.0], 0.01)
            .await
            .unwrap();

        let (_, x_speed) = axes[0].moves()[0];
        let (_, y_speed) = axes[1].moves()[0];
        assert_eq!(x_speed, 1e-5);
        assert!((y_speed - 0.01).abs() < 1e-6);
        assert!(axes[2].moves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn all_axes_are_commanded_before_any_wait() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());

        manager
            .move_axes([0.0; 3], [1.0, -2.0, 0.5], 0.8)
            .await
            .unwrap();

        let log = manager.transaction_log();
        let last_move = log.iter().rposition(|e| e.action == "move").unwrap();
        let first_arrival = log.iter().position(|e| e.action == "in_position").unwrap();
        assert!(last_move < first_arrival);
        for axis in &axes {
            assert_eq!(axis.moves().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_distance_move_only_logs() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());

        let outcome = manager
            .move_axes([1.0, 1.0, 1.0], [1.0001, 1.0, 1.0], 0.5)
            .await
            .unwrap();

        assert_eq!(outcome, MoveOutcome::Completed);
        assert!(axes.iter().all(|axis| axis.moves().is_empty()));
        let info = entries(&manager, "info");
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].scope, EventScope::All);
        assert!(info[0].description.starts_with("Zero-distance move ignored"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_scales_with_travel() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());

        manager
            .move_axes([0.0; 3], [10.0, 1.0, 0.0], 0.5)
            .await
            .unwrap();

        let expected = 101f64.sqrt() / 0.5 * 3.0;
        for axis in &axes[..2] {
            let timeout = axis.waits()[0].as_secs_f64();
            assert!((timeout - expected).abs() < 1e-3, "timeout {timeout}");
        }

        manager
            .move_axes([10.0, 1.0, 0.0], [11.0, 1.0, 0.0], 0.5)
            .await
            .unwrap();
        assert_eq!(axes[0].waits()[1], Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_axis_reports_status_not_error() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        let manager = Arc::new(manager);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.move_axes([0.0; 3], [5.0, 0.0, 0.0], 0.5).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            manager.emergency_stop(AxisId::X).await.unwrap(),
            "X emergency stop executed"
        );

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, MoveOutcome::Aborted);
        assert_eq!(axes[0].stops(), 1);
        assert_eq!(entries(&manager, "aborted").len(), 1);
        assert!(entries(&manager, "error").is_empty());
        assert!(sink.errors().is_empty());
        assert!(sink.statuses().contains(&"X move stopped".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_without_stop_is_an_error() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        axes[1].set_behavior(Behavior::Stall);

        let err = manager
            .move_axes([0.0; 3], [0.0, 2.0, 0.0], 0.5)
            .await
            .unwrap_err();

        assert!(matches!(err, MotionError::Stalled { axis: AxisId::Y, .. }));
        let errors = entries(&manager, "error");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].description.starts_with("Failed to reach position"));
        assert_eq!(errors[0].raw, "err=7;status=16");
        assert_eq!(sink.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_started_axis_is_an_error() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        axes[2].set_behavior(Behavior::NeverStart);

        let err = manager
            .move_axes([0.0; 3], [0.0, 0.0, 1.0], 0.5)
            .await
            .unwrap_err();

        assert!(matches!(err, MotionError::NeverStarted { axis: AxisId::Z, .. }));
        assert!(err.is_reported());
        assert_eq!(sink.errors(), vec![(EventScope::Axis(AxisId::Z), err.to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_motion_starts_is_not_an_error() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        axes[0].set_behavior(Behavior::NeverStart);
        let manager = Arc::new(manager);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.move_axes([0.0; 3], [1.0, 0.0, 0.0], 0.5).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.emergency_stop(AxisId::X).await.unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, MoveOutcome::Aborted);
        assert_eq!(entries(&manager, "aborted").len(), 1);
        assert!(entries(&manager, "error").is_empty());
        assert!(sink.errors().is_empty());
        assert!(sink.statuses().contains(&"X move stopped".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_while_commanding_keeps_every_axis_stopped() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        for axis in &axes {
            axis.set_move_delay(Duration::from_millis(200));
        }
        let manager = Arc::new(manager);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.move_axes([0.0; 3], [5.0, 5.0, 5.0], 1.0).await })
        };
        // X is running and Y's request is still in flight.
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.pause_path().await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        let positions: Vec<f64> = axes.iter().map(|axis| axis.position()).collect();
        assert!(positions.iter().all(|p| *p < 0.2), "moved while paused: {positions:?}");
        assert!(axes[2].moves().is_empty());
        assert!(!task.is_finished());

        manager.resume_path();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, MoveOutcome::Completed);
        for axis in &axes {
            assert!((axis.position() - 5.0).abs() <= 4e-4);
        }
        assert!(sink.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_during_waits_stops_axes_not_yet_awaited() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());
        let manager = Arc::new(manager);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.move_axes([0.0; 3], [4.0, 4.0, 0.0], 1.0).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Closing the gate alone leaves Y to the manager once X reports the pause.
        manager.pause_gate().pause();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let y = axes[1].position();
        assert!(y < 1.0, "Y kept moving to {y}");
        assert!(axes[1].stops() >= 1);

        manager.resume_path();
        assert_eq!(task.await.unwrap().unwrap(), MoveOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_restarts_from_live_position() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        let manager = Arc::new(manager);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.move_axes([0.0; 3], [10.0, 0.0, 0.0], 1.0).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        manager.pause_path().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let paused_at = axes[0].position();
        assert!(paused_at > 1.0 && paused_at < 5.0, "paused at {paused_at}");
        assert!(!task.is_finished());

        manager.resume_path();
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(outcome, MoveOutcome::Completed);
        assert!((axes[0].position() - 10.0).abs() <= 4e-4);
        let waits = axes[0].waits();
        assert_eq!(waits.len(), 2);
        let expected = (10.0 - paused_at) * 3.0;
        assert!((waits[1].as_secs_f64() - expected.max(15.0)).abs() < 1e-6);
        assert!(sink.errors().is_empty());
        assert!(sink.statuses().contains(&"Pattern paused".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_go_hops_and_dwells() {
        let motion = MotionConfig {
            nozzle_diameter: 1.0,
            ..MotionConfig::default()
        };
        let (manager, axes, _) = fake_manager(motion);

        let began = Instant::now();
        let outcome = manager
            .move_axes([0.0; 3], [0.2, 0.0, 0.0], 5e-5)
            .await
            .unwrap();

        assert_eq!(outcome, MoveOutcome::Completed);
        let moves = axes[0].moves();
        assert_eq!(moves.len(), 2);
        assert!((moves[0].0 - 0.1).abs() < 1e-9);
        assert!((moves[1].0 - 0.2).abs() < 1e-9);
        assert!(moves.iter().all(|(_, speed)| (*speed - 1e-3).abs() < 1e-12));

        let dwells = entries(&manager, "dwell");
        assert_eq!(dwells.len(), 2);
        assert!(dwells[0].description.starts_with("segment=0.100000mm dwell="));
        // 0.1 mm at 5e-5 mm/s takes 2000 s per hop in total.
        let elapsed = began.elapsed().as_secs_f64();
        assert!((elapsed - 4000.0).abs() < 1.0, "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_positive_or_nan_speed_is_rejected() {
        let motion = MotionConfig {
            nozzle_diameter: 1.0,
            ..MotionConfig::default()
        };
        let (manager, axes, _) = fake_manager(motion);

        for speed in [0.0, -0.5, f64::NAN, f64::INFINITY] {
            let err = manager
                .move_axes([0.0; 3], [0.2, 0.0, 0.0], speed)
                .await
                .unwrap_err();
            assert!(matches!(err, MotionError::NonPositiveSpeed(_)), "{speed}");
        }
        let err = manager.move_axis(AxisId::Y, 1.0, -0.5).await.unwrap_err();
        assert!(matches!(err, MotionError::NonPositiveSpeed(_)));
        assert!(axes.iter().all(|axis| axis.moves().is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_hop_is_logged_as_micro_move() {
        let motion = MotionConfig {
            nozzle_diameter: 0.005,
            ..MotionConfig::default()
        };
        let (manager, axes, _) = fake_manager(motion);

        manager
            .move_axes([0.0; 3], [0.0007, 0.0, 0.0], 5e-5)
            .await
            .unwrap();

        // One full 0.0005 mm hop, then a 0.0002 mm remainder below the move epsilon.
        assert_eq!(axes[0].moves().len(), 2);
        let micro = entries(&manager, "micro_move");
        assert_eq!(micro.len(), 1);
        assert!(micro[0].description.starts_with("distance=0.000200 "));
    }

    #[tokio::test(start_paused = true)]
    async fn move_axis_already_in_place_is_a_no_op() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());
        axes[0].set_position(2.0);

        let message = manager.move_axis(AxisId::X, 2.0003, 0.5).await.unwrap();

        assert_eq!(message, "X already at 2.000 mm");
        assert!(axes[0].moves().is_empty());
        assert!(manager.transaction_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn move_axis_reports_arrival() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());

        let message = manager.move_axis(AxisId::Z, -1.5, 2.0).await.unwrap();

        assert_eq!(message, "Z moved to -1.500 mm");
        assert_eq!(axes[2].moves(), vec![(-1.5, 1.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn move_to_point_announces_the_point() {
        let (manager, _, sink) = fake_manager(MotionConfig::default());

        manager.move_to_point([1.0, 2.0, 0.0], 0.9).await.unwrap();

        assert!(sink.statuses().contains(&"Moved to (1.000, 2.000, 0.000)".to_string()));
        assert!(sink.events().contains(&ManagerEvent::PointReached([1.0, 2.0, 0.0])));
    }

    #[tokio::test(start_paused = true)]
    async fn new_move_clears_a_stale_abort_flag() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        manager.emergency_stop(AxisId::Y).await.unwrap();
        axes[1].set_behavior(Behavior::Stall);

        let err = manager.move_axes([0.0; 3], [0.0, 1.0, 0.0], 0.5).await;

        assert!(matches!(err, Err(MotionError::Stalled { .. })));
        assert_eq!(sink.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nozzle_diameter_is_never_negative() {
        let (manager, _, _) = fake_manager(MotionConfig::default());

        manager.set_nozzle_diameter(-3.0);
        assert_eq!(manager.nozzle_diameter(), 0.0);
        manager.set_nozzle_diameter(0.4);
        assert_eq!(manager.nozzle_diameter(), 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_all_reports_each_axis() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        axes[2].set_connect_result(false);
        let manager = Arc::new(manager);

        let status = manager.connect_all().await;

        assert!(status[&AxisId::X]);
        assert!(!status[&AxisId::Z]);
        assert!(sink.statuses().contains(&"Y axis connected".to_string()));
        assert_eq!(axes[0].backlash(), Some(0.0));
        assert!(sink.events().contains(&ManagerEvent::ConnectionChanged {
            axis: AxisId::Z,
            connected: false,
        }));

        manager.disconnect_all().await;
        assert!(axes.iter().all(|axis| !axis.is_connected()));
    }

    #[test]
    fn unknown_axis_is_not_configured() {
        let sink = Arc::new(RecordingSink::default());
        let log = Arc::new(TransactionLog::new(sink));
        let only_x: Arc<dyn AxisDriver> = Arc::new(FakeAxis::new(AxisId::X));
        let manager = MultiAxisManager::new(
            [only_x],
            MotionConfig::default(),
            TimingConfig::default(),
            log,
        );

        assert!(matches!(
            manager.driver(AxisId::Z),
            Err(MotionError::NotConfigured(AxisId::Z))
        ));
    }
}

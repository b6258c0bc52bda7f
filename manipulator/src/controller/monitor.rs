use std::sync::{Arc, PoisonError};

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{controller::manager::MultiAxisManager, events::ManagerEvent};

impl MultiAxisManager {
    /// Starts the background position poll unless it is already running.
    ///
    /// The task holds only a weak reference and ends with the manager.
    pub(crate) fn start_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let manager = Arc::downgrade(self);
        let period = self.timing.monitor_interval();
        debug!(?period, "Starting position monitor");

        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.poll_positions().await;
            }
        }));
    }

    pub fn stop_monitor(&self) {
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Position monitor stopped");
        }
    }

    /// Publishes the position of every connected axis once.
    ///
    /// An axis whose read fails is disconnected; the others are still polled.
    pub async fn poll_positions(&self) {
        for (&axis, driver) in &self.axes {
            if !driver.is_connected() {
                continue;
            }

            match driver.read_position().await {
                Ok(position) => self.publish(ManagerEvent::Position { axis, position }),
                Err(e) => {
                    warn!(%axis, error = %e, "Monitor read failed, disconnecting axis");
                    self.publish(ManagerEvent::Error {
                        scope: axis.into(),
                        message: format!("Monitor error: {e}"),
                    });
                    driver.disconnect().await;
                    self.publish(ManagerEvent::ConnectionChanged {
                        axis,
                        connected: false,
                    });
                }
            }
        }
    }
}

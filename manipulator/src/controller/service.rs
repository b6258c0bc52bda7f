use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    controller::manager::MultiAxisManager,
    error::MotionError,
    events::{EventScope, ManagerEvent},
    models::{
        CommandEnvelope, CommandError, CommandResponse, CommandResult, ManipulatorCommand,
        MoveTarget,
    },
};

impl MultiAxisManager {
    /// Runs one command to completion.
    ///
    /// Outcome messages are published as `Status` events and failures as
    /// `Error` events, unless the failure was already reported where it
    /// happened.
    pub async fn dispatch(self: &Arc<Self>, command: ManipulatorCommand) -> CommandResult {
        debug!(?command, "Dispatching command");

        match command {
            ManipulatorCommand::Connect => {
                let status = self.connect_all().await;
                if status.values().any(|connected| *connected) {
                    Ok(CommandResponse::Success)
                } else {
                    Err("No axis could be connected".to_string().into())
                }
            }
            ManipulatorCommand::Disconnect => {
                self.disconnect_all().await;
                Ok(CommandResponse::Success)
            }
            ManipulatorCommand::Move(request) => match request.target {
                MoveTarget::Axis { axis, position } => {
                    let result = self.move_axis(axis, position, request.speed).await;
                    self.announce(result, axis.into())
                }
                MoveTarget::Point(target) => {
                    let result = self.move_to_point(target, request.speed).await;
                    self.settle(result.map(|_| ()), EventScope::Path)
                }
            },
            ManipulatorCommand::ExecutePath { waypoints, speed } => {
                let result = self.execute_path(&waypoints, speed).await;
                self.settle(result.map(|_| ()), EventScope::Path)
            }
            ManipulatorCommand::ExecuteRecipe {
                commands,
                print_speed,
                travel_speed,
            } => {
                let result = self
                    .execute_recipe(&commands, print_speed, travel_speed)
                    .await;
                self.settle(result.map(|_| ()), EventScope::Path)
            }
            ManipulatorCommand::Pause => {
                self.pause_path().await;
                Ok(CommandResponse::Success)
            }
            ManipulatorCommand::Resume => {
                self.resume_path();
                Ok(CommandResponse::Success)
            }
            ManipulatorCommand::Stop(axis) => {
                let result = self.emergency_stop(axis).await;
                self.announce(result, axis.into())
            }
            ManipulatorCommand::Home(axis) => {
                let result = self.home_axis(axis).await;
                self.announce(result, axis.into())
            }
            ManipulatorCommand::SetNozzle(diameter) => {
                self.set_nozzle_diameter(diameter);
                Ok(CommandResponse::Success)
            }
            ManipulatorCommand::SetMotionLogging(enabled) => {
                self.set_motion_logging(enabled);
                Ok(CommandResponse::Success)
            }
            ManipulatorCommand::GetPosition(axis) => {
                let driver = self
                    .driver(axis)
                    .map_err(|e| CommandError::from(e.to_string()))?;
                driver
                    .read_position()
                    .await
                    .map(CommandResponse::Position)
                    .map_err(|e| e.to_string().into())
            }
        }
    }

    fn announce(&self, result: Result<String, MotionError>, scope: EventScope) -> CommandResult {
        let message = result.map_err(|e| self.report(e, scope))?;
        self.publish(ManagerEvent::Status(message));
        Ok(CommandResponse::Success)
    }

    fn settle(&self, result: Result<(), MotionError>, scope: EventScope) -> CommandResult {
        result
            .map(|()| CommandResponse::Success)
            .map_err(|e| self.report(e, scope))
    }

    fn report(&self, error: MotionError, scope: EventScope) -> CommandError {
        if !error.is_reported() {
            self.publish(ManagerEvent::Error {
                scope,
                message: error.to_string(),
            });
        }
        error.to_string().into()
    }

    /// Rejects long-running commands whose speeds are out of range before
    /// they are accepted.
    fn precheck(&self, command: &ManipulatorCommand) -> Result<(), CommandError> {
        let limits = self.speed_limits();
        let check = |speed: f64| -> Result<(), CommandError> {
            limits
                .validate_speed(speed)
                .map_err(|e| CommandError::from(e.to_string()))
        };

        match command {
            ManipulatorCommand::Move(request) => {
                if let MoveTarget::Axis { axis, .. } = request.target {
                    self.driver(axis).map_err(|e| e.to_string())?;
                }
                check(request.speed)
            }
            ManipulatorCommand::ExecutePath { speed, .. } => check(*speed),
            ManipulatorCommand::ExecuteRecipe {
                print_speed,
                travel_speed,
                ..
            } => {
                check(*print_speed)?;
                check(*travel_speed)
            }
            _ => Ok(()),
        }
    }
}

/// Receives commands and runs each on its own task.
///
/// Moves, paths and recipes are acknowledged with `Accepted` as soon as they
/// pass validation; their outcome arrives as events. Every other command is
/// answered once it finishes.
pub async fn run_controller(
    mut command_rx: mpsc::Receiver<CommandEnvelope>,
    manager: Arc<MultiAxisManager>,
) -> Result<()> {
    while let Some(envelope) = command_rx.recv().await {
        let CommandEnvelope { command, response } = envelope;
        let manager = Arc::clone(&manager);

        if command.is_long_running() {
            if let Err(e) = manager.precheck(&command) {
                let _ = response.send(Err(e));
                continue;
            }
            let _ = response.send(Ok(CommandResponse::Accepted));
            tokio::spawn(async move {
                let _ = manager.dispatch(command).await;
            });
        } else {
            tokio::spawn(async move {
                let result = manager.dispatch(command).await;
                let _ = response.send(result);
            });
        }
    }

    info!("Command channel closed, controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        config::MotionConfig,
        controller::fake::fake_manager,
        models::{AxisId, MoveRequest},
    };

    async fn send(
        tx: &mpsc::Sender<CommandEnvelope>,
        command: ManipulatorCommand,
    ) -> CommandResult {
        let (response, rx) = oneshot::channel();
        tx.send(CommandEnvelope { command, response }).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_commands_are_accepted_immediately() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        let manager = Arc::new(manager);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_controller(rx, Arc::clone(&manager)));

        let reply = send(
            &tx,
            ManipulatorCommand::Move(MoveRequest {
                target: MoveTarget::Axis {
                    axis: AxisId::X,
                    position: 5.0,
                },
                speed: 0.5,
            }),
        )
        .await;
        assert_eq!(reply, Ok(CommandResponse::Accepted));
        assert!(axes[0].position() < 5.0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(sink.statuses().contains(&"X moved to 5.000 mm".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_speed_is_rejected_up_front() {
        let (manager, axes, _) = fake_manager(MotionConfig::default());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_controller(rx, Arc::new(manager)));

        let reply = send(
            &tx,
            ManipulatorCommand::ExecutePath {
                waypoints: vec![[1.0, 0.0, 0.0]],
                speed: 5.0,
            },
        )
        .await;

        assert!(reply.unwrap_err().message.contains("exceeds the maximum"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(axes[0].moves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quick_commands_reply_with_their_result() {
        let (manager, axes, sink) = fake_manager(MotionConfig::default());
        axes[1].set_position(-0.75);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_controller(rx, Arc::new(manager)));

        assert_eq!(
            send(&tx, ManipulatorCommand::GetPosition(AxisId::Y)).await,
            Ok(CommandResponse::Position(-0.75))
        );
        assert_eq!(
            send(&tx, ManipulatorCommand::Stop(AxisId::Z)).await,
            Ok(CommandResponse::Success)
        );
        assert_eq!(
            send(&tx, ManipulatorCommand::SetNozzle(0.4)).await,
            Ok(CommandResponse::Success)
        );
        assert!(sink
            .statuses()
            .contains(&"Z emergency stop executed".to_string()));
        assert_eq!(axes[2].stops(), 1);
    }
}

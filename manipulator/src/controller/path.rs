use tracing::{info, instrument};

use crate::{
    controller::{
        driver::MoveOutcome,
        manager::{MultiAxisManager, delta},
    },
    error::MotionError,
    events::{EventScope, ManagerEvent},
    models::{PathMode, RecipeCommand, Waypoint, format_point},
    speed::norm,
};

/// One segment of a pattern: where to go and how fast.
#[derive(Debug, Clone, Copy)]
struct Leg {
    target: Waypoint,
    speed: f64,
}

/// Seconds needed for `legs` starting at `from`, at each leg's own speed.
fn remaining_secs(from: Waypoint, legs: &[Leg]) -> f64 {
    let mut position = from;
    legs.iter()
        .map(|leg| {
            let length = norm(delta(position, leg.target));
            position = leg.target;
            if leg.speed > 0.0 {
                length / leg.speed
            } else {
                0.0
            }
        })
        .sum()
}

impl MultiAxisManager {
    /// Visits `waypoints` in order at a constant resultant speed.
    #[instrument(skip(self, waypoints), fields(waypoints = waypoints.len()))]
    pub async fn execute_path(
        &self,
        waypoints: &[Waypoint],
        speed: f64,
    ) -> Result<MoveOutcome, MotionError> {
        if waypoints.is_empty() {
            return Ok(MoveOutcome::Completed);
        }

        let legs: Vec<Leg> = waypoints
            .iter()
            .map(|&target| Leg { target, speed })
            .collect();
        self.run_pattern(&legs).await
    }

    /// Runs print and travel polylines back to back.
    ///
    /// The first vertex of each command is where the previous one left the
    /// stage, so it is not visited again.
    #[instrument(skip(self, commands), fields(commands = commands.len()))]
    pub async fn execute_recipe(
        &self,
        commands: &[RecipeCommand],
        print_speed: f64,
        travel_speed: f64,
    ) -> Result<MoveOutcome, MotionError> {
        if commands.is_empty() {
            return Ok(MoveOutcome::Completed);
        }

        let legs: Vec<Leg> = commands
            .iter()
            .flat_map(|command| {
                let speed = match command.mode {
                    PathMode::Print => print_speed,
                    PathMode::Travel => travel_speed,
                };
                command
                    .vertices
                    .iter()
                    .skip(1)
                    .map(move |&target| Leg { target, speed })
            })
            .collect();
        self.run_pattern(&legs).await
    }

    async fn run_pattern(&self, legs: &[Leg]) -> Result<MoveOutcome, MotionError> {
        self.pause.resume();

        let mut current = self.live_position([0.0; 3]).await;
        self.log.record(
            EventScope::Path,
            "pattern_start",
            format!("start={}", format_point(&current)),
            "",
        );

        let total = legs.len();
        for (index, leg) in legs.iter().enumerate() {
            self.pause.wait_running().await;

            let outcome = self.move_axes(current, leg.target, leg.speed).await?;
            if outcome == MoveOutcome::Aborted {
                info!(index, "Pattern stopped by operator");
                return Ok(outcome);
            }
            current = leg.target;

            self.publish(ManagerEvent::Progress {
                index,
                fraction: (index + 1) as f64 / total as f64,
                remaining_secs: remaining_secs(current, &legs[index + 1..]),
            });
        }

        self.log.record(
            EventScope::Path,
            "pattern_completed",
            format!("end={}", format_point(&current)),
            "",
        );
        self.publish(ManagerEvent::PatternCompleted);
        info!(legs = total, "Pattern completed");
        Ok(MoveOutcome::Completed)
    }
}

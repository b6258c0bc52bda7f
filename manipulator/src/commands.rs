use tokio::sync::oneshot;

use crate::models::{
    AxisId, CommandEnvelope, CommandError, CommandResult, ManipulatorCommand, MoveRequest,
    MoveTarget, Recipe, Waypoint,
};

/// Parses one line of the socket protocol.
///
/// `Ok(None)` means the line is not a command at all; `Err` is a well-formed
/// command that cannot be carried out, such as an unreadable recipe file.
pub fn parse_command(
    cmd_str: &str,
) -> Result<Option<(CommandEnvelope, oneshot::Receiver<CommandResult>)>, CommandError> {
    let Some(command) = parse_manipulator_command(cmd_str)? else {
        return Ok(None);
    };

    let (tx, rx) = oneshot::channel();
    Ok(Some((
        CommandEnvelope {
            command,
            response: tx,
        },
        rx,
    )))
}

fn parse_manipulator_command(cmd_str: &str) -> Result<Option<ManipulatorCommand>, CommandError> {
    let parts: Vec<&str> = cmd_str.trim().split(':').collect();

    let command = match parts.as_slice() {
        ["connect"] => ManipulatorCommand::Connect,
        ["disconnect"] => ManipulatorCommand::Disconnect,
        ["pause"] => ManipulatorCommand::Pause,
        ["resume"] => ManipulatorCommand::Resume,
        ["move", axis, position, speed] => {
            let (Some(axis), Some(position), Some(speed)) =
                (parse_axis(axis), parse_number(position), parse_number(speed))
            else {
                return Ok(None);
            };

            ManipulatorCommand::Move(MoveRequest {
                target: MoveTarget::Axis { axis, position },
                speed,
            })
        }
        ["point", x, y, z, speed] => {
            let (Some(point), Some(speed)) = (parse_point(&[*x, *y, *z]), parse_number(speed)) else {
                return Ok(None);
            };

            ManipulatorCommand::Move(MoveRequest {
                target: MoveTarget::Point(point),
                speed,
            })
        }
        ["path", speed, points] => {
            let (Some(speed), Some(waypoints)) = (parse_number(speed), parse_waypoints(points))
            else {
                return Ok(None);
            };

            ManipulatorCommand::ExecutePath { waypoints, speed }
        }
        ["recipe", file, print_speed, travel_speed] => {
            let (Some(print_speed), Some(travel_speed)) =
                (parse_number(print_speed), parse_number(travel_speed))
            else {
                return Ok(None);
            };
            let recipe = Recipe::load(file).map_err(|e| CommandError::from(e.to_string()))?;

            ManipulatorCommand::ExecuteRecipe {
                commands: recipe.commands,
                print_speed,
                travel_speed,
            }
        }
        ["stop", axis] => match parse_axis(axis) {
            Some(axis) => ManipulatorCommand::Stop(axis),
            None => return Ok(None),
        },
        ["home", axis] => match parse_axis(axis) {
            Some(axis) => ManipulatorCommand::Home(axis),
            None => return Ok(None),
        },
        ["nozzle", diameter] => match parse_number(diameter) {
            Some(diameter) => ManipulatorCommand::SetNozzle(diameter),
            None => return Ok(None),
        },
        ["motion_log", state] => match *state {
            "on" | "1" | "true" => ManipulatorCommand::SetMotionLogging(true),
            "off" | "0" | "false" => ManipulatorCommand::SetMotionLogging(false),
            _ => return Ok(None),
        },
        ["get", axis, "position"] => match parse_axis(axis) {
            Some(axis) => ManipulatorCommand::GetPosition(axis),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };

    Ok(Some(command))
}

fn parse_axis(s: &str) -> Option<AxisId> {
    s.parse().ok()
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_point(coords: &[&str]) -> Option<Waypoint> {
    match coords {
        [x, y, z] => Some([parse_number(x)?, parse_number(y)?, parse_number(z)?]),
        _ => None,
    }
}

fn parse_waypoints(s: &str) -> Option<Vec<Waypoint>> {
    s.split(';')
        .filter(|point| !point.trim().is_empty())
        .map(|point| parse_point(&point.split(',').collect::<Vec<_>>()))
        .collect()
}

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::RecipeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisId {
    X,
    Y,
    Z,
}

impl AxisId {
    pub const ALL: [AxisId; 3] = [AxisId::X, AxisId::Y, AxisId::Z];

    /// Component index inside a [`Waypoint`].
    pub fn index(self) -> usize {
        match self {
            AxisId::X => 0,
            AxisId::Y => 1,
            AxisId::Z => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AxisId::X => "x",
            AxisId::Y => "y",
            AxisId::Z => "z",
        }
    }

    /// Upper-case form used in operator status messages.
    pub fn label(self) -> &'static str {
        match self {
            AxisId::X => "X",
            AxisId::Y => "Y",
            AxisId::Z => "Z",
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown axis '{0}'")]
pub struct UnknownAxis(pub String);

impl FromStr for AxisId {
    type Err = UnknownAxis;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(AxisId::X),
            "y" => Ok(AxisId::Y),
            "z" => Ok(AxisId::Z),
            _ => Err(UnknownAxis(s.to_string())),
        }
    }
}

/// Millimetre coordinates in x, y, z order.
pub type Waypoint = [f64; 3];

pub(crate) fn format_point(point: &Waypoint) -> String {
    format!("({:.6}, {:.6}, {:.6})", point[0], point[1], point[2])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    #[default]
    Print,
    Travel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeCommand {
    #[serde(default)]
    pub mode: PathMode,
    #[serde(default)]
    pub vertices: Vec<Waypoint>,
}

/// A list of print / travel polylines, stored as TOML:
///
/// ```toml
/// [[commands]]
/// mode = "travel"
/// vertices = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub commands: Vec<RecipeCommand>,
}

impl Recipe {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecipeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| RecipeError::Parse { source })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveTarget {
    Axis { axis: AxisId, position: f64 },
    Point(Waypoint),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRequest {
    pub target: MoveTarget,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManipulatorCommand {
    Connect,
    Disconnect,
    Move(MoveRequest),
    ExecutePath {
        waypoints: Vec<Waypoint>,
        speed: f64,
    },
    ExecuteRecipe {
        commands: Vec<RecipeCommand>,
        print_speed: f64,
        travel_speed: f64,
    },
    Pause,
    Resume,
    Stop(AxisId),
    Home(AxisId),
    SetNozzle(f64),
    SetMotionLogging(bool),
    GetPosition(AxisId),
}

impl ManipulatorCommand {
    /// Commands that run for as long as the stage moves.
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            ManipulatorCommand::Move(_)
                | ManipulatorCommand::ExecutePath { .. }
                | ManipulatorCommand::ExecuteRecipe { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Success,
    Accepted,
    Position(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub message: String,
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        CommandError { message }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.message)
    }
}

pub type CommandResult = Result<CommandResponse, CommandError>;

#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: ManipulatorCommand,
    pub response: oneshot::Sender<CommandResult>,
}

//! Typed control commands.
//!
//! Every numeric argument has a documented range on the device. Builders check
//! the range before a [`Command`] exists, and [`Command::validate`] checks it
//! again before anything is written to the socket, so out-of-range input never
//! reaches the device.
//!
//! ```rust
//! use hoverlink::{Command, MoveDirection};
//!
//! let rc = Command::rc(10, -20, 0, 100).unwrap();
//! assert_eq!(rc.to_string(), "rc 10 -20 0 100");
//!
//! assert!(Command::rc(150, 0, 0, 0).is_err());
//! assert_eq!(Command::move_by(MoveDirection::Up, 50).unwrap().to_string(), "up 50");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use crate::{DroneError, Result};

/// Range of each `rc` channel.
pub const RC_RANGE: RangeInclusive<i32> = -100..=100;
/// Range of a relative move, in centimetres.
pub const MOVE_RANGE: RangeInclusive<u32> = 20..=500;
/// Range of a rotation, in degrees.
pub const ROTATE_RANGE: RangeInclusive<u32> = 1..=3600;
/// Range of `go`/`curve` coordinates, in centimetres.
pub const COORD_RANGE: RangeInclusive<i32> = -500..=500;
/// Coordinates may not all fall inside this band at once.
pub const COORD_DEAD_BAND: RangeInclusive<i32> = -20..=20;
/// Range of `speed` and `go` speed, in cm/s.
pub const SPEED_RANGE: RangeInclusive<u32> = 10..=100;
/// Range of `curve` speed, in cm/s.
pub const CURVE_SPEED_RANGE: RangeInclusive<u32> = 10..=60;

/// Direction of a relative move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
    Left,
    Right,
    Forward,
    Back,
}

impl MoveDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MoveDirection::Up => "up",
            MoveDirection::Down => "down",
            MoveDirection::Left => "left",
            MoveDirection::Right => "right",
            MoveDirection::Forward => "forward",
            MoveDirection::Back => "back",
        }
    }
}

/// Direction of a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotateDirection {
    Clockwise,
    CounterClockwise,
}

impl RotateDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            RotateDirection::Clockwise => "cw",
            RotateDirection::CounterClockwise => "ccw",
        }
    }
}

/// Direction of a flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipDirection {
    Left,
    Right,
    Forward,
    Back,
}

impl FlipDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            FlipDirection::Left => "l",
            FlipDirection::Right => "r",
            FlipDirection::Forward => "f",
            FlipDirection::Back => "b",
        }
    }
}

/// Read commands answered with a value instead of `ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Speed,
    Battery,
    Time,
    Wifi,
    Height,
    Temperature,
    Attitude,
    Barometer,
    Acceleration,
    Tof,
}

impl Query {
    pub fn as_str(self) -> &'static str {
        match self {
            Query::Speed => "speed?",
            Query::Battery => "battery?",
            Query::Time => "time?",
            Query::Wifi => "wifi?",
            Query::Height => "height?",
            Query::Temperature => "temp?",
            Query::Attitude => "attitude?",
            Query::Barometer => "baro?",
            Query::Acceleration => "acceleration?",
            Query::Tof => "tof?",
        }
    }
}

/// A control, set or read command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Enter programmatic command mode (the handshake)
    Command,
    Takeoff,
    Land,
    StreamOn,
    StreamOff,
    /// Stop all motors immediately
    Emergency,
    /// Hover in place
    Stop,
    Move { direction: MoveDirection, cm: u32 },
    Rotate { direction: RotateDirection, degrees: u32 },
    Flip(FlipDirection),
    Go { x: i32, y: i32, z: i32, speed: u32 },
    Curve { x1: i32, y1: i32, z1: i32, x2: i32, y2: i32, z2: i32, speed: u32 },
    SetSpeed(u32),
    Rc { left_right: i32, forward_back: i32, up_down: i32, yaw: i32 },
    Query(Query),
}

impl Command {
    /// Remote-control stick values, each in `-100..=100`.
    pub fn rc(left_right: i32, forward_back: i32, up_down: i32, yaw: i32) -> Result<Self> {
        Self::checked(Command::Rc { left_right, forward_back, up_down, yaw })
    }

    /// Relative move of `cm` centimetres.
    pub fn move_by(direction: MoveDirection, cm: u32) -> Result<Self> {
        Self::checked(Command::Move { direction, cm })
    }

    /// Rotation of `degrees`.
    pub fn rotate(direction: RotateDirection, degrees: u32) -> Result<Self> {
        Self::checked(Command::Rotate { direction, degrees })
    }

    pub fn flip(direction: FlipDirection) -> Self {
        Command::Flip(direction)
    }

    /// Fly to `(x, y, z)` relative to the current position.
    pub fn go(x: i32, y: i32, z: i32, speed: u32) -> Result<Self> {
        Self::checked(Command::Go { x, y, z, speed })
    }

    /// Fly a curve through `(x1, y1, z1)` to `(x2, y2, z2)`.
    pub fn curve(start: (i32, i32, i32), end: (i32, i32, i32), speed: u32) -> Result<Self> {
        let (x1, y1, z1) = start;
        let (x2, y2, z2) = end;
        Self::checked(Command::Curve { x1, y1, z1, x2, y2, z2, speed })
    }

    pub fn set_speed(cm_per_sec: u32) -> Result<Self> {
        Self::checked(Command::SetSpeed(cm_per_sec))
    }

    pub fn query(query: Query) -> Self {
        Command::Query(query)
    }

    fn checked(command: Command) -> Result<Self> {
        command.validate()?;
        Ok(command)
    }

    /// Wire keyword of the command.
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Command => "command",
            Command::Takeoff => "takeoff",
            Command::Land => "land",
            Command::StreamOn => "streamon",
            Command::StreamOff => "streamoff",
            Command::Emergency => "emergency",
            Command::Stop => "stop",
            Command::Move { direction, .. } => direction.as_str(),
            Command::Rotate { direction, .. } => direction.as_str(),
            Command::Flip(_) => "flip",
            Command::Go { .. } => "go",
            Command::Curve { .. } => "curve",
            Command::SetSpeed(_) => "speed",
            Command::Rc { .. } => "rc",
            Command::Query(query) => query.as_str(),
        }
    }

    /// Check every argument against the device's documented range.
    pub fn validate(&self) -> Result<()> {
        let keyword = self.keyword();
        match *self {
            Command::Move { cm, .. } => check_range(keyword, "distance", cm, &MOVE_RANGE),
            Command::Rotate { degrees, .. } => {
                check_range(keyword, "degrees", degrees, &ROTATE_RANGE)
            }
            Command::Go { x, y, z, speed } => {
                check_point(keyword, (x, y, z))?;
                check_range(keyword, "speed", speed, &SPEED_RANGE)
            }
            Command::Curve { x1, y1, z1, x2, y2, z2, speed } => {
                check_point(keyword, (x1, y1, z1))?;
                check_point(keyword, (x2, y2, z2))?;
                check_range(keyword, "speed", speed, &CURVE_SPEED_RANGE)
            }
            Command::SetSpeed(speed) => check_range(keyword, "speed", speed, &SPEED_RANGE),
            Command::Rc { left_right, forward_back, up_down, yaw } => {
                check_range(keyword, "left_right", left_right, &RC_RANGE)?;
                check_range(keyword, "forward_back", forward_back, &RC_RANGE)?;
                check_range(keyword, "up_down", up_down, &RC_RANGE)?;
                check_range(keyword, "yaw", yaw, &RC_RANGE)
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Move { direction, cm } => write!(f, "{} {}", direction.as_str(), cm),
            Command::Rotate { direction, degrees } => {
                write!(f, "{} {}", direction.as_str(), degrees)
            }
            Command::Flip(direction) => write!(f, "flip {}", direction.as_str()),
            Command::Go { x, y, z, speed } => write!(f, "go {x} {y} {z} {speed}"),
            Command::Curve { x1, y1, z1, x2, y2, z2, speed } => {
                write!(f, "curve {x1} {y1} {z1} {x2} {y2} {z2} {speed}")
            }
            Command::SetSpeed(speed) => write!(f, "speed {speed}"),
            Command::Rc { left_right, forward_back, up_down, yaw } => {
                write!(f, "rc {left_right} {forward_back} {up_down} {yaw}")
            }
            other => f.write_str(other.keyword()),
        }
    }
}

fn check_range<T>(command: &str, name: &str, value: T, range: &RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(DroneError::invalid_argument(
            command,
            format!("{name} {value} outside {}..={}", range.start(), range.end()),
        ))
    }
}

fn check_point(command: &str, (x, y, z): (i32, i32, i32)) -> Result<()> {
    check_range(command, "x", x, &COORD_RANGE)?;
    check_range(command, "y", y, &COORD_RANGE)?;
    check_range(command, "z", z, &COORD_RANGE)?;
    if [x, y, z].iter().all(|v| COORD_DEAD_BAND.contains(v)) {
        return Err(DroneError::invalid_argument(
            command,
            format!("point ({x}, {y}, {z}) lies entirely within the -20..=20 dead band"),
        ));
    }
    Ok(())
}

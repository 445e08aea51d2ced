//! Definitions of important types used throughout the project

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Stable identifier of a remote car
///
/// Usually the MAC address of the car's radio, or `host:port` when the radio
/// bridge is reached over TCP. Compared by exact string match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Identifies one finger for the duration of its contact with the surface
pub type ContactId = u32;

/// Position on the touch surface in pixels, +X: Right, +Y: Down
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    /// Marks a point that is not set
    pub const SENTINEL: Point = Point::new(-1, -1);

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Speeds for the two motors of the car
///
/// Positive is forwards, negative is backwards. Both values stay within
/// `-MAX_SPEED..=MAX_SPEED`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MotorCommand {
    pub left: i8,
    pub right: i8,
}

impl MotorCommand {
    pub const MAX_SPEED: i8 = 127;
    pub const STOP: MotorCommand = MotorCommand::new(0, 0);

    pub const fn new(left: i8, right: i8) -> Self {
        Self { left, right }
    }

    pub fn is_stop(&self) -> bool {
        *self == Self::STOP
    }
}

// Basic Units

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialOrd, PartialEq)]
pub struct Meters(pub f64);

impl Display for Meters {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(&format!("{:.2}m", self.0))
    }
}

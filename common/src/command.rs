//! Turns finger positions into motor commands for the car
//!
//! Pushing a finger up drives its motor forwards, pulling it down drives it
//! backwards. Both fingers at the same height drive straight, any difference
//! between them turns the car. One or no finger stops the car.
//!
//! Binary frame: `'H' 'S' left right` where the speeds are signed bytes.
//!
//! Text frame, for debugging with a serial terminal:
//! `HS:S\r\n` to stop, `HS:L+090,R-005\r\n` to drive.

use crate::touch::{TouchSnapshot, TouchState};
use crate::types::MotorCommand;
use serde::{Deserialize, Serialize};

pub const FRAME_MARKER: [u8; 2] = *b"HS";
pub const FRAME_LEN: usize = 4;

/// Fraction of the surface height ignored as finger shake, also the largest
/// difference between both fingers still treated as driving straight
pub const DEFAULT_DEADZONE: f32 = 0.1;
/// Smallest non-zero speed of the floored scaling, slower speeds stall the motors
pub const DEFAULT_MIN_SPEED: u8 = 30;

/// Maps the displacement of a finger to the speed of its motor
pub trait SpeedScale {
    /// `height` is never zero
    fn scale(&self, delta: i32, height: u32) -> i8;
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum Scaling {
    /// Full height maps to full speed
    #[default]
    Linear,
    /// Like `Linear` but any non-zero speed is at least `min`
    Floored {
        #[serde(default = "default_min_speed")]
        min: u8,
    },
}

fn default_min_speed() -> u8 {
    DEFAULT_MIN_SPEED
}

impl SpeedScale for Scaling {
    fn scale(&self, delta: i32, height: u32) -> i8 {
        let max = f32::from(MotorCommand::MAX_SPEED);
        let ratio = delta as f32 / height as f32;

        let speed = match *self {
            Scaling::Linear => (ratio * max).round(),
            Scaling::Floored { min } => {
                if delta == 0 {
                    0.0
                } else {
                    let min = f32::from(min).min(max);
                    let magnitude = min + (ratio.abs() * (max - min)).round();
                    magnitude.copysign(ratio)
                }
            }
        };

        speed.clamp(-max, max) as i8
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    #[default]
    Binary,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEncoder<S = Scaling> {
    deadzone: f32,
    scaling: S,
    format: FrameFormat,
}

impl Default for CommandEncoder {
    fn default() -> Self {
        Self::new(Scaling::default())
    }
}

impl<S: SpeedScale> CommandEncoder<S> {
    pub fn new(scaling: S) -> Self {
        Self {
            deadzone: DEFAULT_DEADZONE,
            scaling,
            format: FrameFormat::Binary,
        }
    }

    pub fn with_deadzone(mut self, deadzone: f32) -> Self {
        self.deadzone = deadzone;
        self
    }

    pub fn with_format(mut self, format: FrameFormat) -> Self {
        self.format = format;
        self
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// `height` must not be zero
    pub fn command(&self, left: &TouchState, right: &TouchState, height: u32) -> MotorCommand {
        debug_assert!(height > 0, "Touch surface has no height");

        if !(left.is_valid() && right.is_valid()) {
            return MotorCommand::STOP;
        }

        let threshold = height as f32 * self.deadzone;
        let ignored = |delta: i32| (delta.unsigned_abs() as f32) < threshold;

        let mut delta_left = left.delta_y();
        let mut delta_right = right.delta_y();

        if ignored(delta_left) {
            delta_left = 0;
        }
        if ignored(delta_right) {
            delta_right = 0;
        }

        if ignored(delta_left.saturating_sub(delta_right)) {
            let straight = delta_left.min(delta_right);
            delta_left = straight;
            delta_right = straight;
        }

        MotorCommand::new(
            self.scaling.scale(delta_left, height),
            self.scaling.scale(delta_right, height),
        )
    }

    pub fn command_for(&self, snapshot: &TouchSnapshot) -> MotorCommand {
        self.command(&snapshot.left, &snapshot.right, snapshot.height)
    }

    /// Bytes to put on the wire for the snapshot
    pub fn encode(&self, snapshot: &TouchSnapshot) -> Vec<u8> {
        self.command_for(snapshot).encode(self.format)
    }
}

impl MotorCommand {
    pub fn to_frame(self) -> [u8; FRAME_LEN] {
        let [h, s] = FRAME_MARKER;
        [h, s, self.left as u8, self.right as u8]
    }

    pub fn to_text(self) -> String {
        if self.is_stop() {
            "HS:S\r\n".to_owned()
        } else {
            format!("HS:L{:+04},R{:+04}\r\n", self.left, self.right)
        }
    }

    pub fn encode(self, format: FrameFormat) -> Vec<u8> {
        match format {
            FrameFormat::Binary => self.to_frame().to_vec(),
            FrameFormat::Text => self.to_text().into_bytes(),
        }
    }
}

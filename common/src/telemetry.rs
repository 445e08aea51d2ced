//! Decodes the distance reports sent back by the car
//!
//! Frame: `'D' whole tenths hundredths`, the free space in front of the car in
//! meters. A whole part of 10 or more means nothing is in range.

use crate::types::Meters;
use std::fmt::{Display, Formatter};
use tracing::trace;

pub const TELEMETRY_MARKER: u8 = b'D';
pub const TELEMETRY_LEN: usize = 4;
/// Readings at or above this many whole meters are out of the sensor's range
pub const MAX_WHOLE_METERS: u8 = 10;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Distance {
    Meters(Meters),
    OutOfRange,
}

impl Display for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Distance::Meters(meters) => Display::fmt(meters, f),
            Distance::OutOfRange => f.pad("out of range"),
        }
    }
}

/// Returns `None` if the frame does not start with the telemetry marker
pub fn decode_frame(frame: [u8; TELEMETRY_LEN]) -> Option<Distance> {
    let [marker, whole, tenths, hundredths] = frame;
    if marker != TELEMETRY_MARKER {
        return None;
    }

    if whole >= MAX_WHOLE_METERS {
        return Some(Distance::OutOfRange);
    }

    let meters = f64::from(whole) + f64::from(tenths) * 0.1 + f64::from(hundredths) * 0.01;
    Some(Distance::Meters(Meters(meters)))
}

/// Collects bytes from the link until a complete frame is available
#[derive(Debug, Default, Clone)]
pub struct TelemetryDecoder {
    window: [u8; TELEMETRY_LEN],
    len: usize,
}

impl TelemetryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered towards the next frame
    pub fn pending(&self) -> usize {
        self.len
    }

    pub fn push(&mut self, byte: u8) -> Option<Distance> {
        self.window[self.len] = byte;
        self.len += 1;

        if self.len < TELEMETRY_LEN {
            return None;
        }

        match decode_frame(self.window) {
            Some(distance) => {
                self.len = 0;
                Some(distance)
            }
            None => {
                trace!(window = ?self.window, "Bad telemetry marker, resyncing");
                self.resync();
                None
            }
        }
    }

    /// Drops the bad marker and anything else that can't start a frame
    fn resync(&mut self) {
        let skip = self.window[1..self.len]
            .iter()
            .position(|&byte| byte == TELEMETRY_MARKER)
            .map_or(self.len, |position| position + 1);

        self.window.copy_within(skip..self.len, 0);
        self.len -= skip;
    }
}

impl Extend<u8> for TelemetryDecoder {
    /// Feeds bytes while discarding the decoded distances, mostly useful for tests
    fn extend<I: IntoIterator<Item = u8>>(&mut self, bytes: I) {
        for byte in bytes {
            self.push(byte);
        }
    }
}

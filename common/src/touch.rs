//! Tracks the fingers driving the car
//!
//! The surface is split into a left and a right half. Each half follows at
//! most one finger, the first one to land in it, and every finger is followed
//! until it is lifted even if it wanders into the other half.

use crate::types::{ContactId, Point};
use std::fmt::{Debug, Formatter};
use tracing::{debug, trace};

/// Gestures never use more than two fingers, pointers past that are ignored
pub const MAX_CONTACTS: usize = 2;

/// One finger on one half of the surface
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TouchState {
    pub start: Point,
    pub current: Point,
    pub id: Option<ContactId>,
}

impl TouchState {
    pub const INVALID: TouchState = TouchState {
        start: Point::SENTINEL,
        current: Point::SENTINEL,
        id: None,
    };

    pub fn is_valid(&self) -> bool {
        self.id.is_some() && self.start != Point::SENTINEL
    }

    pub fn invalidate(&mut self) {
        *self = Self::INVALID;
    }

    /// Distance pushed upwards since the finger landed
    pub fn delta_y(&self) -> i32 {
        self.start.y.saturating_sub(self.current.y)
    }

    fn begin(&mut self, id: ContactId, point: Point) {
        self.start = point;
        self.current = point;
        self.id = Some(id);
    }
}

impl Default for TouchState {
    fn default() -> Self {
        Self::INVALID
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Half {
    Left,
    Right,
}

/// State published to observers after every touch event
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TouchSnapshot {
    pub left: TouchState,
    pub right: TouchState,
    pub width: u32,
    pub height: u32,
}

impl TouchSnapshot {
    pub fn valid_contacts(&self) -> usize {
        [self.left, self.right]
            .iter()
            .filter(|state| state.is_valid())
            .count()
    }

    /// Fraction of the surface height each finger was pushed, used for the
    /// level bars. `None` unless both fingers are down.
    pub fn levels(&self) -> Option<(f32, f32)> {
        if self.valid_contacts() != 2 || self.height == 0 {
            return None;
        }

        let height = self.height as f32;
        Some((
            self.left.delta_y() as f32 / height,
            self.right.delta_y() as f32 / height,
        ))
    }
}

/// A finger as reported by the platform. `index` is the position of the
/// pointer within the current gesture.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pointer {
    pub index: usize,
    pub id: ContactId,
    pub position: Point,
}

impl Pointer {
    pub fn new(index: usize, id: ContactId, x: i32, y: i32) -> Self {
        Self {
            index,
            id,
            position: Point::new(x, y),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TouchEvent {
    /// A finger landed
    Down(Pointer),
    /// Every pointer of the gesture at its new position
    Move(Vec<Pointer>),
    /// A finger was lifted
    Up { index: usize, id: ContactId },
}

pub type Observer = Box<dyn FnMut(&TouchSnapshot)>;

pub struct TouchTracker {
    width: u32,
    height: u32,
    left: TouchState,
    right: TouchState,
    observers: Vec<Observer>,
}

impl Debug for TouchTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TouchTracker")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("left", &self.left)
            .field("right", &self.right)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl TouchTracker {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            left: TouchState::INVALID,
            right: TouchState::INVALID,
            observers: Vec::new(),
        }
    }

    /// Observers are called in registration order after every event
    pub fn add_observer(&mut self, observer: impl FnMut(&TouchSnapshot) + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn left(&self) -> &TouchState {
        &self.left
    }

    pub fn right(&self) -> &TouchState {
        &self.right
    }

    pub fn snapshot(&self) -> TouchSnapshot {
        TouchSnapshot {
            left: self.left,
            right: self.right,
            width: self.width,
            height: self.height,
        }
    }

    /// Applies one event and notifies the observers
    ///
    /// Returns false if the event belonged to a pointer past `MAX_CONTACTS`,
    /// in which case nothing changed and nobody was notified.
    pub fn handle(&mut self, event: TouchEvent) -> bool {
        match event {
            TouchEvent::Down(pointer) => {
                if pointer.index >= MAX_CONTACTS {
                    return false;
                }
                self.add_finger(pointer.id, pointer.position);
            }
            TouchEvent::Move(pointers) => {
                for pointer in pointers.iter().filter(|it| it.index < MAX_CONTACTS) {
                    self.move_finger(pointer.id, pointer.position);
                }
            }
            TouchEvent::Up { index, id } => {
                if index >= MAX_CONTACTS {
                    return false;
                }
                self.remove_finger(id);
            }
        }

        self.notify();
        true
    }

    fn half_of(&self, point: Point) -> Half {
        if i64::from(point.x) < i64::from(self.width / 2) {
            Half::Left
        } else {
            Half::Right
        }
    }

    fn add_finger(&mut self, id: ContactId, point: Point) {
        // Would be indistinguishable from an empty half
        if point == Point::SENTINEL {
            debug!("Refusing contact {id} at {point}");
            return;
        }

        let half = self.half_of(point);
        let state = match half {
            Half::Left => &mut self.left,
            Half::Right => &mut self.right,
        };

        if state.is_valid() && state.id != Some(id) {
            debug!("Refusing contact {id} in the {half:?} half, already held by {:?}", state.id);
            return;
        }

        state.begin(id, point);
    }

    fn move_finger(&mut self, id: ContactId, point: Point) {
        match self.find(id) {
            Some(state) => state.current = point,
            // Expected for fingers that were refused when they landed
            None => trace!("Contact {id} is not tracked"),
        }
    }

    fn remove_finger(&mut self, id: ContactId) {
        match self.find(id) {
            Some(state) => state.invalidate(),
            None => trace!("Contact {id} is not tracked"),
        }
    }

    fn find(&mut self, id: ContactId) -> Option<&mut TouchState> {
        if self.left.id == Some(id) {
            Some(&mut self.left)
        } else if self.right.id == Some(id) {
            Some(&mut self.right)
        } else {
            None
        }
    }

    fn notify(&mut self) {
        let snapshot = self.snapshot();
        for observer in &mut self.observers {
            (observer)(&snapshot);
        }
    }
}

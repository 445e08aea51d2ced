//! Code shared between the touch controller and the car link

pub mod command;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod touch;
pub mod types;

use std::fmt::Debug;

use tracing::{error, warn};

/// Logs errors that the caller has no better way to handle
pub trait LogErrorExt<T> {
    fn log_error(self, message: &str) -> Option<T>;
    fn log_warn(self, message: &str) -> Option<T>;
}

impl<T, E: Debug> LogErrorExt<T> for Result<T, E> {
    fn log_error(self, message: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                error!("{}: {:?}", message, err);
                None
            }
        }
    }

    fn log_warn(self, message: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("{}: {:?}", message, err);
                None
            }
        }
    }
}

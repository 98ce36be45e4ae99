//! Error types shared across the runtime
//!
//! Defines source locations, serializable test errors and configuration errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Declaration site of a test, hook, modifier or fixture
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An error attributed to a test attempt
///
/// Crosses the controller/worker boundary, so it carries plain data only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestError {
    pub message: String,
    pub location: Option<Location>,
}

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location: Some(location),
        }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(location) = &self.location {
            write!(f, "\n  at {location}")?;
        }
        Ok(())
    }
}

impl From<anyhow::Error> for TestError {
    fn from(error: anyhow::Error) -> Self {
        TestError::new(format!("{error:#}"))
    }
}

/// A fixture or suite declaration problem
///
/// Configuration errors abort the run before any worker starts and are
/// never retried.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{message}\n  at {location}")]
pub struct ConfigError {
    pub message: String,
    pub location: Location,
}

impl ConfigError {
    pub fn new(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let location = Location::new("suite.rs", 10, 4);
        assert_eq!(location.to_string(), "suite.rs:10:4");
    }

    #[test]
    fn test_error_display_with_location() {
        let error = TestError::at("boom", Location::new("a.rs", 1, 1));
        assert_eq!(error.to_string(), "boom\n  at a.rs:1:1");
    }

    #[test]
    fn config_error_display() {
        let error = ConfigError::new("unknown fixture", Location::new("f.rs", 3, 9));
        assert!(error.to_string().contains("unknown fixture"));
        assert!(error.to_string().contains("f.rs:3:9"));
    }
}

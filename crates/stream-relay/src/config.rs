//! Relay sizing.

use crate::error::RelayError;
use serde::Deserialize;

/// Queue and buffer sizes for every session relay.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Events kept per session for replay to late observers.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Events an observer may fall behind before it is dropped.
    #[serde(default = "default_observer_queue")]
    pub observer_queue: usize,

    /// Events buffered towards the primary consumer before the writer waits.
    #[serde(default = "default_primary_queue")]
    pub primary_queue: usize,
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_observer_queue() -> usize {
    256
}

fn default_primary_queue() -> usize {
    256
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            observer_queue: default_observer_queue(),
            primary_queue: default_primary_queue(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.buffer_capacity == 0 {
            return Err(RelayError::Config("buffer_capacity must be at least 1".into()));
        }
        if self.observer_queue == 0 {
            return Err(RelayError::Config("observer_queue must be at least 1".into()));
        }
        if self.primary_queue == 0 {
            return Err(RelayError::Config("primary_queue must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = RelayConfig {
            observer_queue: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }
}

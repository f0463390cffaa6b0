use thiserror::Error;

/// Errors surfaced by the device entry points.
///
/// Each variant carries a stable negative code so callers that speak the
/// character-device convention can forward it unchanged.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("read length {0} does not match the packet size")]
    ReadLength(usize),

    #[error("write length {0} is not a 4 byte interrupt number")]
    WriteLength(usize),

    #[error("device is shutting down")]
    Shutdown,

    #[error("completion interrupt number has not been provided")]
    NotConfigured,

    #[error("no packet arrived within the watchdog window")]
    Timeout,

    #[error("failed to map register block at {base:#010x}: {reason}")]
    Map { base: u64, reason: String },

    #[error("failed to request interrupt {line}: {reason}")]
    Irq { line: String, reason: String },

    #[error("GPIO error: {0}")]
    Gpio(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn code(&self) -> i32 {
        match self {
            DriverError::ReadLength(_) => -1,
            DriverError::WriteLength(_) => -2,
            DriverError::Shutdown => -3,
            DriverError::NotConfigured => -4,
            DriverError::Timeout => -5,
            DriverError::Map { .. } => -12,
            DriverError::Irq { .. } => -16,
            DriverError::Gpio(_) | DriverError::Io(_) => -19,
        }
    }

    /// Timeouts are part of normal operation when both receivers are idle.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout)
    }
}

impl From<rppal::gpio::Error> for DriverError {
    fn from(e: rppal::gpio::Error) -> Self {
        DriverError::Gpio(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_for_read_path() {
        let codes = [
            DriverError::ReadLength(0).code(),
            DriverError::WriteLength(0).code(),
            DriverError::Shutdown.code(),
            DriverError::NotConfigured.code(),
            DriverError::Timeout.code(),
        ];
        assert_eq!(codes, [-1, -2, -3, -4, -5]);
    }

    #[test]
    fn test_timeout_predicate() {
        assert!(DriverError::Timeout.is_timeout());
        assert!(!DriverError::Shutdown.is_timeout());
    }
}

use thiserror::Error;

/// Errors that can occur when working with cycling sensors and trainers
#[derive(Error, Debug)]
pub enum VeloError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No compatible device found during discovery
    #[error("No matching device found")]
    DeviceNotFound,

    /// The user dismissed the device-selection prompt
    #[error("Device selection cancelled by user")]
    UserCancelled,

    /// A connect attempt is already in flight for this slot
    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A GATT service or characteristic was not found on the device
    #[error("GATT setup failed: {0}")]
    GattSetup(String),

    /// Malformed or truncated telemetry frame
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    /// Recovery snapshot could not be read or written
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for velodrive operations
pub type Result<T> = std::result::Result<T, VeloError>;

impl VeloError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectionFailed(_) | Self::Disconnected | Self::DeviceNotFound
        )
    }

    /// Check if this error is a user cancellation of a selection prompt.
    ///
    /// User cancellations never trigger the auto-reconnect policy.
    #[must_use]
    pub const fn is_user_cancellation(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Check if a scheduled reconnect attempt should retry after this error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::DeviceNotFound
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::Ble(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = VeloError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_user_cancellation());
        assert!(connection_error.is_retryable());

        let cancelled = VeloError::UserCancelled;
        assert!(!cancelled.is_connection_error());
        assert!(cancelled.is_user_cancellation());
        assert!(!cancelled.is_retryable());

        let timeout = VeloError::Timeout { timeout_ms: 60_000 };
        assert!(!timeout.is_connection_error());
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = VeloError::Decode("buffer too short: 1 bytes".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Failed to decode frame"));
        assert!(error_string.contains("buffer too short"));
    }
}

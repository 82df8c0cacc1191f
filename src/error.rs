//! Error types for the ble-central crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Platform error codes reported by the adapter gateway are preserved
/// verbatim in the `code` field of the matching variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The radio refused to start (or aborted) a scan.
    #[error("Scan failed with platform code {code}")]
    ScanFailed {
        /// Platform error code.
        code: i32,
    },

    /// Opening the GATT link failed.
    #[error("Connection failed with platform code {code}")]
    ConnectError {
        /// Platform error code.
        code: i32,
    },

    /// Service discovery failed after the link was established.
    #[error("Service discovery failed with platform code {code}")]
    DiscoveryError {
        /// Platform error code.
        code: i32,
    },

    /// A GATT operation was attempted outside the `Ready` state.
    #[error("Connection not ready")]
    NotReady,

    /// No completion arrived from the gateway before the request deadline.
    #[error("Operation timed out")]
    Timeout,

    /// The link dropped unexpectedly while the request was pending.
    #[error("Link lost")]
    LinkLost,

    /// The request was superseded by an explicit disconnect.
    #[error("Operation cancelled")]
    Cancelled,

    /// The characteristic is not present in the discovered service table.
    #[error("Unknown characteristic: {uuid}")]
    UnknownCharacteristic {
        /// The UUID that was looked up.
        uuid: String,
    },

    /// The service is not present in the discovered service table.
    #[error("Unknown service: {uuid}")]
    UnknownService {
        /// The UUID that was looked up.
        uuid: String,
    },

    /// A GATT operation completed with a non-success status.
    #[error("GATT operation failed with platform code {code}")]
    GattError {
        /// Platform status code.
        code: i32,
    },

    /// The characteristic does not support the requested operation.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The connection manager (or the connection's actor) is gone.
    #[error("Connection manager shut down")]
    ManagerShutdown,
}

impl Error {
    /// The platform error code carried by this error, if any.
    pub fn platform_code(&self) -> Option<i32> {
        match self {
            Self::ScanFailed { code }
            | Self::ConnectError { code }
            | Self::DiscoveryError { code }
            | Self::GattError { code } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn unknown_characteristic(uuid: &uuid::Uuid) -> Self {
        Self::UnknownCharacteristic {
            uuid: uuid.to_string(),
        }
    }

    pub(crate) fn unknown_service(uuid: &uuid::Uuid) -> Self {
        Self::UnknownService {
            uuid: uuid.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_code_preserved() {
        assert_eq!(Error::ScanFailed { code: 2 }.platform_code(), Some(2));
        assert_eq!(Error::ConnectError { code: 133 }.platform_code(), Some(133));
        assert_eq!(Error::GattError { code: -5 }.platform_code(), Some(-5));
        assert_eq!(Error::Timeout.platform_code(), None);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::ConnectError { code: 133 }.to_string(),
            "Connection failed with platform code 133"
        );
        assert_eq!(Error::NotReady.to_string(), "Connection not ready");
    }
}

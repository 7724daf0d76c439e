//! Error types for edu driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for edu operations
pub type Result<T> = std::result::Result<T, EduError>;

/// Errors that can occur during edu operations
#[derive(Debug, Error)]
pub enum EduError {
    /// Argument outside the range the protocol accepts
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument
        reason: String,
    },

    /// DMA bus address does not fit the addressable width
    #[error("DMA address {bus_address:#x} not addressable with {bits} bits")]
    AddressNotSupported {
        /// Bus address of the buffer
        bus_address: u64,
        /// Width that was required
        bits: u8,
    },

    /// DMA buffer allocation failed
    #[error("Out of memory allocating {requested} byte DMA buffer")]
    OutOfMemory {
        /// Requested capacity in bytes
        requested: usize,
    },

    /// A blocking wait was cancelled before the device completed
    #[error("Wait cancelled before completion")]
    Cancelled,

    /// Register access failed; the attachment is no longer usable
    #[error("Bus fault: {reason}")]
    BusFault {
        /// Reason for failure
        reason: String,
    },

    /// Unknown control command number
    #[error("Unknown command {cmd:#010x}")]
    UnknownCommand {
        /// Raw command number
        cmd: u32,
    },

    /// Device node or PCI function not present
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// Platform facility the backend needs is unavailable
    #[error("Unsupported: {reason}")]
    Unsupported {
        /// Reason for failure
        reason: String,
    },

    /// I/O error during device setup or interrupt delivery
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl EduError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a bus fault error
    pub fn bus_fault(reason: impl Into<String>) -> Self {
        Self::BusFault {
            reason: reason.into(),
        }
    }

    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create an unsupported error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Whether this error leaves the attachment unusable.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::BusFault { .. })
    }

    /// Errno the char-device façade reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } => libc::EINVAL,
            Self::AddressNotSupported { .. } => libc::EOPNOTSUPP,
            Self::OutOfMemory { .. } => libc::ENOMEM,
            // Kernel-internal ERESTARTSYS; not exported by libc.
            Self::Cancelled => 512,
            Self::BusFault { .. } => libc::EIO,
            Self::UnknownCommand { .. } => libc::ENOTTY,
            Self::DeviceNotFound { .. } => libc::ENODEV,
            Self::Unsupported { .. } => libc::ENOSYS,
            Self::Io { source } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

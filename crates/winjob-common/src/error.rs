//! Common error types for winjob.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`WinjobError`].
pub type WinjobResult<T> = Result<T, WinjobError>;

/// Result type alias for raw OS job API calls.
pub type OsResult<T> = Result<T, OsError>;

/// A Win32 error code as reported by `GetLastError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsErrorCode(pub u32);

impl OsErrorCode {
    /// The operation completed successfully.
    pub const SUCCESS: Self = Self(0);
    /// The system cannot find the file specified.
    pub const FILE_NOT_FOUND: Self = Self(2);
    /// Access is denied.
    pub const ACCESS_DENIED: Self = Self(5);
    /// The handle is invalid.
    pub const INVALID_HANDLE: Self = Self(6);
    /// There are no more files.
    pub const NO_MORE_FILES: Self = Self(18);
    /// The request is not supported.
    pub const NOT_SUPPORTED: Self = Self(50);
    /// The parameter is incorrect.
    pub const INVALID_PARAMETER: Self = Self(87);
    /// The wait operation timed out.
    pub const WAIT_TIMEOUT: Self = Self(258);
    /// Cannot create a file when that file already exists.
    pub const ALREADY_EXISTS: Self = Self(183);
    /// The I/O completion port handle was closed while a wait was outstanding.
    pub const ABANDONED_WAIT_0: Self = Self(0x2df);
    /// Not enough quota is available to process this command.
    pub const NOT_ENOUGH_QUOTA: Self = Self(1816);

    /// Capture the calling thread's last OS error.
    #[must_use]
    pub fn last() -> Self {
        Self::from_io(&std::io::Error::last_os_error())
    }

    /// Extract the raw OS code from an I/O error.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_io(err: &std::io::Error) -> Self {
        Self(err.raw_os_error().unwrap_or(0) as u32)
    }

    /// Symbolic name of well-known codes.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "ERROR_SUCCESS",
            2 => "ERROR_FILE_NOT_FOUND",
            5 => "ERROR_ACCESS_DENIED",
            6 => "ERROR_INVALID_HANDLE",
            18 => "ERROR_NO_MORE_FILES",
            50 => "ERROR_NOT_SUPPORTED",
            87 => "ERROR_INVALID_PARAMETER",
            183 => "ERROR_ALREADY_EXISTS",
            258 => "WAIT_TIMEOUT",
            0x2df => "ERROR_ABANDONED_WAIT_0",
            1816 => "ERROR_NOT_ENOUGH_QUOTA",
            _ => return None,
        })
    }

    /// Whether a blocked completion-port wait was cut short by a handle close.
    #[must_use]
    pub const fn is_abandoned_wait(self) -> bool {
        self.0 == Self::ABANDONED_WAIT_0.0
    }

    /// Whether the code means the handle involved is gone: either it was
    /// already invalid, or it was closed under an outstanding wait.
    #[must_use]
    pub const fn is_closed_handle(self) -> bool {
        self.0 == Self::INVALID_HANDLE.0 || self.is_abandoned_wait()
    }
}

impl fmt::Display for OsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "os error {}", self.0),
        }
    }
}

/// A failed OS job API call.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {code}")]
#[diagnostic(code(winjob::os))]
pub struct OsError {
    /// Name of the OS call that failed.
    pub operation: &'static str,
    /// The error code it reported.
    pub code: OsErrorCode,
}

impl OsError {
    /// Create an error for `operation` with an explicit code.
    #[must_use]
    pub const fn new(operation: &'static str, code: OsErrorCode) -> Self {
        Self { operation, code }
    }

    /// Create an error for `operation` from the thread's last OS error.
    #[must_use]
    pub fn last(operation: &'static str) -> Self {
        Self::new(operation, OsErrorCode::last())
    }

    /// Create an error for `operation` from an I/O error.
    #[must_use]
    pub fn from_io(operation: &'static str, err: &std::io::Error) -> Self {
        Self::new(operation, OsErrorCode::from_io(err))
    }
}

/// The stage of a suspended launch that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    /// Creating the suspended process.
    Spawn,
    /// Assigning the suspended process to the job.
    Assign,
    /// Resuming the process after assignment.
    Resume,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn => write!(f, "spawn"),
            Self::Assign => write!(f, "assign"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

/// Common errors across winjob.
#[derive(Error, Diagnostic, Debug)]
pub enum WinjobError {
    /// An OS job API call failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Os(#[from] OsError),

    /// Starting a process inside a job failed part way.
    #[error("Failed to {stage} process{}: {source}", .pid.map(|p| format!(" {p}")).unwrap_or_default())]
    #[diagnostic(
        code(winjob::launch),
        help("A process that was created but not resumed is left suspended; the caller must terminate it")
    )]
    Launch {
        /// The stage that failed.
        stage: LaunchStage,
        /// The process, if it had been created.
        pid: Option<u32>,
        /// The underlying OS failure.
        #[source]
        source: OsError,
    },

    /// Invalid quantity format.
    #[error("Invalid quantity: {value}")]
    #[diagnostic(
        code(winjob::quantity::invalid),
        help("Use formats like '64Mi', '1G', '12.5%', '1500', '30s', '250ms'")
    )]
    InvalidQuantity {
        /// The invalid value.
        value: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(winjob::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(winjob::unsupported),
        help("Job objects require Windows; use the simulated backend elsewhere")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(winjob::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(winjob::serialization))]
    Serialization(String),
}

impl WinjobError {
    /// The OS error code behind this error, if any.
    #[must_use]
    pub const fn os_code(&self) -> Option<OsErrorCode> {
        match self {
            Self::Os(err) | Self::Launch { source: err, .. } => Some(err.code),
            _ => None,
        }
    }

    /// Whether the error reports an invalid handle.
    #[must_use]
    pub fn is_invalid_handle(&self) -> bool {
        self.os_code() == Some(OsErrorCode::INVALID_HANDLE)
    }
}

impl From<serde_json::Error> for WinjobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

use thiserror::Error;

/// Target interaction errors.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation's requirements are not satisfied by the current target
    /// state or configuration.
    #[error("{op} - {reason}")]
    OperationNotSupported { op: String, reason: String },

    /// An operation failed at runtime; the current API call is aborted.
    #[error("{0}")]
    OperationFailed(String),

    #[error("{op} requires address to be aligned on a {alignment}-byte boundary")]
    OperationAlignment { op: String, alignment: u64 },

    /// Raw data was passed to an operation that only accepts a Stratagem.
    #[error("{0} requires a Stratagem in order to perform the requested operation")]
    StratagemRequired(String),

    #[error("{0} does not require the use of Stratagem objects")]
    StratagemNotRequired(String),

    /// The user interrupted a long-running operation.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out while attempting to {0}")]
    Timeout(String),

    /// Protocol framing or expected-response mismatch.
    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Architecture error: {0}")]
    Arch(#[from] depthcharge_arch::ArchError),

    #[error("U-Boot data error: {0}")]
    UBoot(#[from] depthcharge_uboot::UBootError),

    #[error(transparent)]
    Hunter(#[from] depthcharge_hunter::HunterError),
}

impl Error {
    pub(crate) fn not_supported(op: &str, reason: impl Into<String>) -> Self {
        Self::OperationNotSupported {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

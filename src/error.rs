// Error taxonomy shared by the store, transport, provisioning and session layers.

use thiserror::Error;

pub const HVE_ALREADY_EXISTS: i32 = 2;
pub const HVE_SCHEDULED: i32 = 1;
pub const HVE_OK: i32 = 0;
pub const HVE_CREATE_ERROR: i32 = -1;
pub const HVE_MODIFY_ERROR: i32 = -2;
pub const HVE_CONTROL_ERROR: i32 = -3;
pub const HVE_DELETE_ERROR: i32 = -4;
pub const HVE_QUERY_ERROR: i32 = -5;
pub const HVE_IO_ERROR: i32 = -6;
pub const HVE_EXTERNAL_ERROR: i32 = -7;
pub const HVE_INVALID_STATE: i32 = -8;
pub const HVE_NOT_FOUND: i32 = -9;
pub const HVE_NOT_ALLOWED: i32 = -10;
pub const HVE_NOT_SUPPORTED: i32 = -11;
pub const HVE_NOT_VALIDATED: i32 = -12;
pub const HVE_NOT_TRUSTED: i32 = -13;
pub const HVE_STILL_WORKING: i32 = -14;
pub const HVE_PASSWORD_DENIED: i32 = -20;
pub const HVE_USAGE_ERROR: i32 = -99;
pub const HVE_NOT_IMPLEMENTED: i32 = -100;

pub type Result<T> = std::result::Result<T, Error>;

/// Non-error outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Scheduled,
    AlreadyExists,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => HVE_OK,
            Status::Scheduled => HVE_SCHEDULED,
            Status::AlreadyExists => HVE_ALREADY_EXISTS,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("create failed: {0}")]
    Create(String),
    #[error("modify failed: {0}")]
    Modify(String),
    #[error("control failed: {0}")]
    Control(String),
    #[error("delete failed: {0}")]
    Delete(String),
    #[error("query failed: {0}")]
    Query(String),
    /// Local file or transport failure. Both report the same kind.
    #[error("i/o error: {0}")]
    Io(String),
    #[error("transfer aborted")]
    Aborted,
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    Verification {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("external error: {0}")]
    External(String),
    #[error("operation `{operation}` not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("validation failed: {0}")]
    NotValidated(String),
    #[error("not trusted: {0}")]
    NotTrusted(String),
    #[error("still working: {0}")]
    StillWorking(String),
    #[error("secret mismatch for session {0}")]
    PasswordDenied(String),
    #[error("parameter `{key}` has non-numeric value `{value}`")]
    Conversion { key: String, value: String },
    #[error("usage error: {0}")]
    Usage(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl Error {
    /// Numeric code reported to callers that speak the legacy integer protocol.
    pub fn code(&self) -> i32 {
        match self {
            Error::Create(_) => HVE_CREATE_ERROR,
            Error::Modify(_) => HVE_MODIFY_ERROR,
            Error::Control(_) => HVE_CONTROL_ERROR,
            Error::Delete(_) => HVE_DELETE_ERROR,
            Error::Query(_) => HVE_QUERY_ERROR,
            Error::Io(_) | Error::Aborted | Error::Verification { .. } => HVE_IO_ERROR,
            Error::External(_) => HVE_EXTERNAL_ERROR,
            Error::InvalidState { .. } => HVE_INVALID_STATE,
            Error::NotFound(_) => HVE_NOT_FOUND,
            Error::NotAllowed(_) => HVE_NOT_ALLOWED,
            Error::NotSupported(_) => HVE_NOT_SUPPORTED,
            Error::NotValidated(_) => HVE_NOT_VALIDATED,
            Error::NotTrusted(_) => HVE_NOT_TRUSTED,
            Error::StillWorking(_) => HVE_STILL_WORKING,
            Error::PasswordDenied(_) => HVE_PASSWORD_DENIED,
            Error::Conversion { .. } | Error::Usage(_) => HVE_USAGE_ERROR,
            Error::NotImplemented(_) => HVE_NOT_IMPLEMENTED,
        }
    }

    /// Failures the provisioning retry loop absorbs.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Verification { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Io(format!("json: {}", e))
    }
}

/// Human-readable name for a numeric code.
pub fn error_str(code: i32) -> &'static str {
    match code {
        HVE_ALREADY_EXISTS => "Already exists",
        HVE_SCHEDULED => "Scheduled",
        HVE_OK => "No error",
        HVE_CREATE_ERROR => "Creation error",
        HVE_MODIFY_ERROR => "Modification error",
        HVE_CONTROL_ERROR => "Control error",
        HVE_DELETE_ERROR => "Delete error",
        HVE_QUERY_ERROR => "Query error",
        HVE_IO_ERROR => "I/O error",
        HVE_EXTERNAL_ERROR => "External error",
        HVE_INVALID_STATE => "Invalid state",
        HVE_NOT_FOUND => "Not found",
        HVE_NOT_ALLOWED => "Not allowed",
        HVE_NOT_SUPPORTED => "Not supported",
        HVE_NOT_VALIDATED => "Not validated",
        HVE_NOT_TRUSTED => "Not trusted",
        HVE_STILL_WORKING => "Still working",
        HVE_PASSWORD_DENIED => "Password denied",
        HVE_USAGE_ERROR => "Usage error",
        HVE_NOT_IMPLEMENTED => "Not implemented",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_failures_share_io_code() {
        assert_eq!(Error::Io("x".into()).code(), HVE_IO_ERROR);
        assert_eq!(Error::Aborted.code(), HVE_IO_ERROR);
        let verify = Error::Verification {
            url: "u".into(),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(verify.code(), HVE_IO_ERROR);
        assert!(verify.is_transient());
        assert!(!Error::Aborted.is_transient());
    }

    #[test]
    fn test_error_str() {
        assert_eq!(error_str(Error::PasswordDenied("s".into()).code()), "Password denied");
        assert_eq!(error_str(Status::AlreadyExists.code()), "Already exists");
        assert_eq!(error_str(12345), "Unknown error");
    }
}

//! Error types for this crate.

use std::borrow::Cow;
use std::fmt::Display;

/// A convenience type alias for a `Result` with an `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    data: ErrorData,
}

/// The kind of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The operation requires the manager to be powered on.
    NotReady,
    /// A service include/remove ordering rule was violated.
    Dependency,
    /// A request was answered more than once, or was never delivered.
    ProtocolViolation,
    /// The arguments did not describe a valid operation.
    InvalidParameters,
    /// An ATT protocol error.
    ATT(AttError),
    /// An unknown or other error.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ErrorData {
    Simple(ErrorKind),
    Context {
        kind: ErrorKind,
        message: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Simple(kind) => kind.fmt(f),
            ErrorData::Context { kind, message } => write!(f, "{kind}: {message}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl From<AttError> for Error {
    fn from(error: AttError) -> Self {
        ErrorKind::ATT(error).into()
    }
}

impl Error {
    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            data: ErrorData::Context {
                kind,
                message: message.into(),
            },
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Simple(kind) => *kind,
            ErrorData::Context { kind, .. } => *kind,
        }
    }

    /// Returns the ATT error code that best describes this error on the wire.
    pub fn att_error(&self) -> AttError {
        match self.kind() {
            ErrorKind::ATT(att) => att,
            ErrorKind::NotReady => AttError::UNLIKELY_ERROR,
            ErrorKind::Dependency => AttError::UNLIKELY_ERROR,
            ErrorKind::ProtocolViolation => AttError::UNLIKELY_ERROR,
            ErrorKind::InvalidParameters => AttError::INVALID_HANDLE,
            ErrorKind::Other => AttError::UNLIKELY_ERROR,
        }
    }
}

/// An ATT protocol error code, as sent in an Error Response PDU.
///
/// See the Bluetooth Core Specification, Vol 3, Part F, §3.4.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttError(pub u8);

impl AttError {
    pub const SUCCESS: Self = Self(0x00);
    pub const INVALID_HANDLE: Self = Self(0x01);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    pub const INVALID_PDU: Self = Self(0x04);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    pub const INVALID_OFFSET: Self = Self(0x07);
    pub const INSUFFICIENT_AUTHORIZATION: Self = Self(0x08);
    pub const PREPARE_QUEUE_FULL: Self = Self(0x09);
    pub const ATTRIBUTE_NOT_FOUND: Self = Self(0x0a);
    pub const ATTRIBUTE_NOT_LONG: Self = Self(0x0b);
    pub const INSUFFICIENT_ENCRYPTION_KEY_SIZE: Self = Self(0x0c);
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: Self = Self(0x0d);
    pub const UNLIKELY_ERROR: Self = Self(0x0e);
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(0x0f);
    pub const UNSUPPORTED_GROUP_TYPE: Self = Self(0x10);
    pub const INSUFFICIENT_RESOURCES: Self = Self(0x11);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl Display for AttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            AttError::SUCCESS => f.write_str("success"),
            AttError::INVALID_HANDLE => f.write_str("invalid handle"),
            AttError::READ_NOT_PERMITTED => f.write_str("read not permitted"),
            AttError::WRITE_NOT_PERMITTED => f.write_str("write not permitted"),
            AttError::INVALID_PDU => f.write_str("invalid PDU"),
            AttError::INSUFFICIENT_AUTHENTICATION => f.write_str("insufficient authentication"),
            AttError::REQUEST_NOT_SUPPORTED => f.write_str("request not supported"),
            AttError::INVALID_OFFSET => f.write_str("invalid offset"),
            AttError::INSUFFICIENT_AUTHORIZATION => f.write_str("insufficient authorization"),
            AttError::PREPARE_QUEUE_FULL => f.write_str("prepare queue full"),
            AttError::ATTRIBUTE_NOT_FOUND => f.write_str("attribute not found"),
            AttError::ATTRIBUTE_NOT_LONG => f.write_str("attribute not long"),
            AttError::INSUFFICIENT_ENCRYPTION_KEY_SIZE => {
                f.write_str("insufficient encryption key size")
            }
            AttError::INVALID_ATTRIBUTE_VALUE_LENGTH => {
                f.write_str("invalid attribute value length")
            }
            AttError::UNLIKELY_ERROR => f.write_str("unlikely error"),
            AttError::INSUFFICIENT_ENCRYPTION => f.write_str("insufficient encryption"),
            AttError::UNSUPPORTED_GROUP_TYPE => f.write_str("unsupported group type"),
            AttError::INSUFFICIENT_RESOURCES => f.write_str("insufficient resources"),
            _ => write!(f, "unknown ATT error ({:#04x})", self.0),
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotReady => f.write_str("peripheral manager is not powered on"),
            ErrorKind::Dependency => f.write_str("service dependency violated"),
            ErrorKind::ProtocolViolation => f.write_str("request/response protocol violated"),
            ErrorKind::InvalidParameters => f.write_str("invalid parameters"),
            ErrorKind::ATT(att) => att.fmt(f),
            ErrorKind::Other => f.write_str("other error"),
        }
    }
}

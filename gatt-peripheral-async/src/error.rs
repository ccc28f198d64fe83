//! Error types for this crate.

use std::fmt::Display;

use futures_channel::oneshot;
use gatt_peripheral::AttError;

/// A convenience type alias for a `Result` with an `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate.
#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

/// The kind of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The peripheral manager is not powered on, or never will be.
    NotReady,
    /// A service include/remove ordering rule was violated.
    Dependency,
    /// A request was answered more than once.
    ProtocolViolation,
    /// The arguments did not describe a valid operation.
    InvalidParameters,
    /// An ATT protocol error.
    ATT(AttError),
    /// The operation was canceled.
    Canceled,
    /// A broadcast channel lagged.
    Lagged,
    /// An unknown or other error.
    Other,
}

#[derive(Debug, Clone)]
enum ErrorData {
    Manager(gatt_peripheral::Error),
    Simple(ErrorKind),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Manager(error) => error.fmt(f),
            ErrorData::Simple(kind) => kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<gatt_peripheral::Error> for Error {
    fn from(error: gatt_peripheral::Error) -> Self {
        Error {
            data: ErrorData::Manager(error),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl From<gatt_peripheral::ErrorKind> for Error {
    fn from(kind: gatt_peripheral::ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind.into()),
        }
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_value: oneshot::Canceled) -> Self {
        ErrorKind::Canceled.into()
    }
}

impl From<async_broadcast::RecvError> for Error {
    fn from(value: async_broadcast::RecvError) -> Self {
        match value {
            async_broadcast::RecvError::Overflowed(_) => ErrorKind::Lagged.into(),
            async_broadcast::RecvError::Closed => ErrorKind::Canceled.into(),
        }
    }
}

impl Error {
    /// If this error came from the peripheral manager, returns a reference to it.
    pub fn get_ref(&self) -> Option<&gatt_peripheral::Error> {
        match &self.data {
            ErrorData::Manager(error) => Some(error),
            ErrorData::Simple(_) => None,
        }
    }

    /// If this error came from the peripheral manager, returns it.
    pub fn into_inner(self) -> Option<gatt_peripheral::Error> {
        match self.data {
            ErrorData::Manager(error) => Some(error),
            ErrorData::Simple(_) => None,
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Manager(error) => error.kind().into(),
            ErrorData::Simple(kind) => *kind,
        }
    }
}

impl From<gatt_peripheral::ErrorKind> for ErrorKind {
    fn from(kind: gatt_peripheral::ErrorKind) -> Self {
        match kind {
            gatt_peripheral::ErrorKind::NotReady => ErrorKind::NotReady,
            gatt_peripheral::ErrorKind::Dependency => ErrorKind::Dependency,
            gatt_peripheral::ErrorKind::ProtocolViolation => ErrorKind::ProtocolViolation,
            gatt_peripheral::ErrorKind::InvalidParameters => ErrorKind::InvalidParameters,
            gatt_peripheral::ErrorKind::ATT(att) => ErrorKind::ATT(att),
            gatt_peripheral::ErrorKind::Other => ErrorKind::Other,
        }
    }
}

impl TryFrom<ErrorKind> for gatt_peripheral::ErrorKind {
    type Error = ErrorKind;

    fn try_from(kind: ErrorKind) -> std::result::Result<Self, Self::Error> {
        match kind {
            ErrorKind::NotReady => Ok(gatt_peripheral::ErrorKind::NotReady),
            ErrorKind::Dependency => Ok(gatt_peripheral::ErrorKind::Dependency),
            ErrorKind::ProtocolViolation => Ok(gatt_peripheral::ErrorKind::ProtocolViolation),
            ErrorKind::InvalidParameters => Ok(gatt_peripheral::ErrorKind::InvalidParameters),
            ErrorKind::ATT(att) => Ok(gatt_peripheral::ErrorKind::ATT(att)),
            ErrorKind::Other => Ok(gatt_peripheral::ErrorKind::Other),
            ErrorKind::Canceled => Err(kind),
            ErrorKind::Lagged => Err(kind),
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match gatt_peripheral::ErrorKind::try_from(*self) {
            Ok(kind) => kind.fmt(f),
            Err(ErrorKind::Canceled) => f.write_str("canceled"),
            Err(_) => f.write_str("lagged"),
        }
    }
}

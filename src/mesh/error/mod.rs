//! Error related business logic of `bxmesh`.
//!
//! Contains the `ErrorKind` enum, one variant per module area of the
//! crate, as well as useful extensions of the `std::result::Result`
//! type, to work with our very own `Error` type.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// The kinds of errors reported throughout this crate.
///
/// Kinds mirror the module a failure originated in, with the
/// exception of `NodeFatal`, which flags conditions the node
/// cannot recover from, regardless of the module reporting them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    Alarms,
    Buffers,
    Communication,
    CommunicationChannel,
    CommunicationPool,
    CommunicationSocket,
    CryptoHashRingSha2,
    Expiry,
    Message,
    MessageFactory,
    MessageValidator,
    MessageVersioning,
    Network,
    Threadpool,
    Transactions,
    Core,
    NodeFatal,
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// Returns an error not wrapping another error
    /// implementation, with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }

    /// Wraps an arbitrary error in an `Error`,
    /// with kind of type `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error {
            kind,
            source: Some(e.into()),
        }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Swaps the `ErrorKind` of this `Error`.
    pub fn swap_kind(self, kind: ErrorKind) -> Self {
        Error { kind, ..self }
    }

    /// Reports whether this error names a condition the node
    /// cannot recover from.
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::NodeFatal
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(e) => write!(fmt, "{:?}({:?})", self.kind, e),
            None => fmt::Debug::fmt(&self.kind, fmt),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(e) => write!(fmt, "{:?}: {}", self.kind, e),
            None => write!(fmt, "{:?}", self.kind),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Error, e)
    }
}

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `bxmesh::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is used in
/// cases where we want to drop the underlying error type in
/// the `Result`, e.g. when it doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

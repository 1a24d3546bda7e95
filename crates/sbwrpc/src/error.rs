//! # Error Definitions
//!
//! Two ledgers of failure live here:
//!
//! - `Error` is raised locally while parsing signatures, checking values or decoding frames.
//! - `Fault` is what a remote caller sees. It travels in Fault frames and every lower
//!   error converts into one.

use sbwpack::Error as PackError;

/// Local failures of the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The underlying Sbwpack serialization failed.
    Serialization(PackError),
    /// A signature or selector string could not be parsed.
    SignatureSyntax { input: String, position: usize, expected: &'static str },
    /// A value did not conform to the signature it was checked against.
    TypeMismatch { expected: String, found: String },
    /// No method of a service matched a selector.
    MethodNotFound(String),
    /// More than one method of a service matched a selector.
    MethodAmbiguous { selector: String, candidates: Vec<String> },
    /// A method or service with the same identity is already defined.
    DuplicateDefinition(String),
    /// The message structure was malformed (unknown kind, missing field, bad code).
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Serialization(e) => write!(f, "serialization failed: {}", e),
            Error::SignatureSyntax { input, position, expected } => {
                write!(f, "syntax error in `{}` at {}: expecting {}", input, position, expected)
            }
            Error::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, found {}", expected, found)
            }
            Error::MethodNotFound(selector) => write!(f, "no method matches `{}`", selector),
            Error::MethodAmbiguous { selector, candidates } => {
                write!(f, "`{}` is ambiguous between {}", selector, candidates.join(" and "))
            }
            Error::DuplicateDefinition(what) => write!(f, "{} is already defined", what),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Serialization(e) }
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The classes of failure a remote call can end in.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    SignatureSyntax = 1,
    TypeMismatch = 2,
    MethodNotFound = 3,
    MethodAmbiguous = 4,
    ServiceNotFound = 5,
    ModuleNotFound = 6,
    ModuleStartFailure = 7,
    CommunicationFailure = 8,
    /// The handler itself failed.
    Application = 9,
    DuplicateDefinition = 10,
    ProtocolViolation = 11,
}

impl FaultKind {
    /// The code used on the wire.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => FaultKind::SignatureSyntax,
            2 => FaultKind::TypeMismatch,
            3 => FaultKind::MethodNotFound,
            4 => FaultKind::MethodAmbiguous,
            5 => FaultKind::ServiceNotFound,
            6 => FaultKind::ModuleNotFound,
            7 => FaultKind::ModuleStartFailure,
            8 => FaultKind::CommunicationFailure,
            9 => FaultKind::Application,
            10 => FaultKind::DuplicateDefinition,
            11 => FaultKind::ProtocolViolation,
            _ => return None,
        })
    }
}

/// A failed call, as seen by the caller.
///
/// Faults are values: they are delivered as the answer to a call rather than tearing down
/// the connection that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::new(FaultKind::CommunicationFailure, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Application, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ProtocolViolation, message)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Serialization(PackError::TypeMismatch { .. })
            | Error::Serialization(PackError::ElementMismatch { .. })
            | Error::Serialization(PackError::ShapeMismatch { .. })
            | Error::TypeMismatch { .. } => FaultKind::TypeMismatch,
            Error::Serialization(_) | Error::ProtocolViolation(_) => FaultKind::ProtocolViolation,
            Error::SignatureSyntax { .. } => FaultKind::SignatureSyntax,
            Error::MethodNotFound(_) => FaultKind::MethodNotFound,
            Error::MethodAmbiguous { .. } => FaultKind::MethodAmbiguous,
            Error::DuplicateDefinition(_) => FaultKind::DuplicateDefinition,
        };
        Fault::new(kind, e.to_string())
    }
}

impl From<PackError> for Fault {
    fn from(e: PackError) -> Self { Error::from(e).into() }
}

use thiserror::Error;

use tether_core::domain::StreamError;
use tether_core::domain::runtime::SessionError;

use crate::router::OperationKind;

/// Registration and lookup failures. These are programmer errors: a
/// router with a duplicate name is never built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("Operation {name} is already registered")]
    DuplicateOperation { name: String },

    #[error("Unknown operation: {name}")]
    UnknownOperation { name: String },

    #[error("Operation {name} is a {registered}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: OperationKind,
        registered: OperationKind,
    },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("Operation {operation} expects input of type {expected}")]
    InputMismatch {
        operation: String,
        expected: &'static str,
    },

    #[error("Operation {operation} does not produce {expected}")]
    OutputMismatch {
        operation: String,
        expected: &'static str,
    },

    #[error("Handler for {operation} panicked: {message}")]
    HandlerPanicked { operation: String, message: String },

    #[error(transparent)]
    Core(#[from] tether_core::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl From<SessionError> for LinkError {
    fn from(error: SessionError) -> Self {
        LinkError::Core(error.into())
    }
}

impl LinkError {
    /// The session error behind a handler failure, if any.
    pub fn as_session_error(&self) -> Option<&SessionError> {
        match self {
            LinkError::Core(tether_core::Error::Session(error)) => Some(error),
            _ => None,
        }
    }
}

use thiserror::Error;
use tonic::{Code, Status};

use crate::lifecycle::ServerState;

/// Boxed error returned by external collaborators (codecs, resources).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while parsing method paths.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MethodPathError {
    #[error("invalid method path: {0}")]
    Invalid(String),
}

/// Errors produced by registration, dispatch and the server lifecycle.
///
/// Every variant has a stable kind exposed through [`RpcError::code`], which is
/// what travels on the wire.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// A method with this name is already registered.
    #[error("method '{0}' is already registered")]
    DuplicateMethod(String),

    /// No method registered under this name.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// The raw request could not be decoded.
    #[error("failed to decode request: {0}")]
    Decode(String),

    /// The handler response could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(String),

    /// A resource failed to come up during startup.
    #[error("startup failed acquiring {resource}: {source}")]
    Startup {
        resource: String,
        #[source]
        source: BoxError,
    },

    /// Registration attempted after the registry was sealed.
    #[error("server already started, registration is closed")]
    ServerAlreadyStarted,

    /// The call was cancelled by the caller or by server shutdown.
    #[error("call cancelled")]
    Cancelled,

    /// The call deadline passed before a result was produced.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Whatever the business logic returned.
    #[error("handler error: {0}")]
    Handler(Status),

    /// A fault inside the call was caught and translated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The lifecycle was asked to move backwards or out of a terminal state.
    #[error("invalid server state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ServerState, to: ServerState },

    /// An I/O error from the underlying TCP transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The connection closed before the call completed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl RpcError {
    /// Stable kind of this error.
    pub fn code(&self) -> Code {
        match self {
            RpcError::UnknownMethod(_) => Code::Unimplemented,
            RpcError::Decode(_) => Code::InvalidArgument,
            RpcError::Encode(_) | RpcError::Internal(_) => Code::Internal,
            RpcError::Cancelled => Code::Cancelled,
            RpcError::DeadlineExceeded => Code::DeadlineExceeded,
            RpcError::Handler(status) => status.code(),
            RpcError::DuplicateMethod(_)
            | RpcError::ServerAlreadyStarted
            | RpcError::InvalidTransition { .. } => Code::FailedPrecondition,
            RpcError::Startup { .. } | RpcError::Transport(_) | RpcError::ConnectionClosed => {
                Code::Unavailable
            }
        }
    }

    /// Message sent alongside the code on the wire.
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::Handler(status) => status.message().to_string(),
            RpcError::UnknownMethod(name) => name.clone(),
            RpcError::Internal(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from a remote peer.
    ///
    /// Kinds that only the dispatcher produces are restored; anything else is
    /// surfaced as a handler status.
    pub fn from_wire(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match Code::from(code) {
            Code::Unimplemented => RpcError::UnknownMethod(message),
            Code::Cancelled => RpcError::Cancelled,
            Code::DeadlineExceeded => RpcError::DeadlineExceeded,
            Code::Internal => RpcError::Internal(message),
            other => RpcError::Handler(Status::new(other, message)),
        }
    }

    pub fn startup(resource: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RpcError::Startup {
            resource: resource.into(),
            source: source.into(),
        }
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        RpcError::Handler(status)
    }
}

impl From<prost::DecodeError> for RpcError {
    fn from(e: prost::DecodeError) -> Self {
        RpcError::Decode(e.to_string())
    }
}

impl From<prost::EncodeError> for RpcError {
    fn from(e: prost::EncodeError) -> Self {
        RpcError::Encode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(RpcError::UnknownMethod("Echo".into()).code(), Code::Unimplemented);
        assert_eq!(RpcError::Decode("bad".into()).code(), Code::InvalidArgument);
        assert_eq!(RpcError::Cancelled.code(), Code::Cancelled);
        assert_eq!(RpcError::DeadlineExceeded.code(), Code::DeadlineExceeded);
        assert_eq!(
            RpcError::Handler(Status::not_found("user 7")).code(),
            Code::NotFound
        );
    }

    #[test]
    fn test_from_wire_restores_dispatch_kinds() {
        let err = RpcError::UnknownMethod("user.User/Echo".into());
        let back = RpcError::from_wire(err.code() as i32, err.wire_message());
        assert!(matches!(back, RpcError::UnknownMethod(_)));

        let back = RpcError::from_wire(Code::DeadlineExceeded as i32, "");
        assert!(matches!(back, RpcError::DeadlineExceeded));
    }

    #[test]
    fn test_from_wire_keeps_handler_status() {
        let err = RpcError::Handler(Status::permission_denied("nope"));
        let back = RpcError::from_wire(err.code() as i32, err.wire_message());
        match back {
            RpcError::Handler(status) => {
                assert_eq!(status.code(), Code::PermissionDenied);
                assert_eq!(status.message(), "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_from_wire_invalid_argument_stays_handler() {
        let back = RpcError::from_wire(Code::InvalidArgument as i32, "bad email");
        match back {
            RpcError::Handler(status) => assert_eq!(status.code(), Code::InvalidArgument),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_startup_names_resource() {
        let err = RpcError::startup("cache", "connection refused");
        assert!(err.to_string().contains("cache"));
        assert_eq!(err.code(), Code::Unavailable);
    }
}

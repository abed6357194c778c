//! Error types for the transport layer.
//!
//! Every failure belongs to one of the classes reported by [`TransportError::class`]:
//! resource failures at the driver boundary, protocol-usage errors raised by this crate
//! before anything reaches the hardware, hardware conditions reported through work
//! completions, and bootstrap errors from the out-of-band channel.

use thiserror::Error;

use crate::completion::CompletionOpcode;
use crate::fabric::CompletionStatus;
use crate::queue_pair::QpState;

/// Broad classification of a [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Creation, state transition or teardown failed at the driver boundary.
    Resource,
    /// The caller used the API incorrectly.
    ProtocolUsage,
    /// A work request finished with a non-success status.
    Hardware,
    /// The out-of-band bootstrap channel or configuration failed.
    Bootstrap,
}

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A driver call failed. `call` names the verb, `source` carries the errno.
    #[error("{call} failed: {source}")]
    Resource {
        /// The verbs call that failed.
        call: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// No usable RDMA device.
    #[error("RDMA device unavailable: {reason}")]
    DeviceUnavailable {
        /// Why discovery failed.
        reason: String,
    },

    /// A queue pair was used in a state that does not allow the operation.
    #[error("queue pair {qp_num} is in state {state:?}, {operation} requires {required}")]
    InvalidState {
        /// Queue pair number.
        qp_num: u32,
        /// Current state.
        state: QpState,
        /// The attempted operation.
        operation: &'static str,
        /// Human readable description of the required state.
        required: &'static str,
    },

    /// A connect attempt is already running on this queue pair.
    #[error("connect already in progress on queue pair {qp_num}")]
    ConnectInProgress {
        /// Queue pair number.
        qp_num: u32,
    },

    /// A message does not fit the buffer it is written into.
    #[error("message of {size} bytes exceeds capacity of {capacity} bytes")]
    MessageTooLarge {
        /// Encoded size of the message.
        size: usize,
        /// Capacity of the target buffer.
        capacity: usize,
    },

    /// An inline work request carries more data than the negotiated threshold.
    #[error("inline payload of {size} bytes exceeds inline threshold of {max} bytes")]
    InlineTooLarge {
        /// Payload size.
        size: usize,
        /// Negotiated threshold.
        max: u32,
    },

    /// A completion of the wrong kind was dequeued.
    #[error("unexpected completion opcode: expected {expected:?}, got {got:?} (wr_id {wr_id})")]
    UnexpectedOpcode {
        /// What the caller expected.
        expected: CompletionOpcode,
        /// What the hardware produced.
        got: CompletionOpcode,
        /// Identifier of the offending work request.
        wr_id: u64,
    },

    /// A work request finished with a non-success status. Fatal for the queue pair.
    #[error("work request {wr_id} on queue pair {qp_num} completed with status {status:?}")]
    CompletionFailed {
        /// Completion status reported by the hardware.
        status: CompletionStatus,
        /// Identifier of the work request.
        wr_id: u64,
        /// Queue pair the request was posted to.
        qp_num: u32,
    },

    /// A slice or offset lies outside its memory region.
    #[error("range [{offset}, {offset}+{len}) is out of bounds for a region of {region_len} bytes")]
    OutOfBounds {
        /// Start offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Length of the region.
        region_len: usize,
    },

    /// An argument violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A client index that does not belong to any connection.
    #[error("unknown client {0}")]
    UnknownClient(usize),

    /// A non-blocking operation could not proceed because the buffer is full.
    #[error("ring buffer full: {used} of {capacity} bytes in use")]
    Full {
        /// Bytes between read and write position.
        used: u64,
        /// Ring capacity.
        capacity: u64,
    },

    /// A bounded wait ran past its deadline.
    #[error("{operation} timed out after {elapsed_ms}ms")]
    TimedOut {
        /// What was being waited for.
        operation: &'static str,
        /// Time spent waiting.
        elapsed_ms: u64,
    },

    /// Encoding or decoding a wire structure failed.
    #[error("malformed {what}: {reason}")]
    Codec {
        /// The structure being decoded.
        what: &'static str,
        /// Description of the problem.
        reason: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bootstrap socket or file I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Builds a [`TransportError::Resource`] from a verbs call and a raw errno.
    pub fn from_errno(call: &'static str, errno: i32) -> Self {
        TransportError::Resource {
            call,
            source: std::io::Error::from_raw_os_error(errno),
        }
    }

    /// Builds a [`TransportError::Resource`] from the calling thread's last OS error.
    pub fn last_os_error(call: &'static str) -> Self {
        TransportError::Resource {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Returns the error class used by the propagation policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Resource { .. } | TransportError::DeviceUnavailable { .. } => {
                ErrorClass::Resource
            }
            TransportError::CompletionFailed { .. } => ErrorClass::Hardware,
            TransportError::Io(_) | TransportError::Codec { .. } | TransportError::Config(_) => {
                ErrorClass::Bootstrap
            }
            _ => ErrorClass::ProtocolUsage,
        }
    }

    /// Returns `true` for errors that leave the affected queue pair unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Resource | ErrorClass::Hardware)
    }
}

/// Reports a release that failed inside a `Drop` impl. Logged, then fatal unless the
/// thread is already unwinding. Explicit `close()`/`deregister()` methods return the
/// error instead.
pub(crate) fn teardown_failed(what: &str, error: &dyn std::fmt::Display) {
    tracing::error!(resource = what, %error, "teardown failed");
    if !std::thread::panicking() {
        panic!("failed to release {}: {}", what, error);
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_error_names_call_and_errno() {
        let err = TransportError::from_errno("ibv_modify_qp", libc::EINVAL);
        let msg = format!("{}", err);
        assert!(msg.contains("ibv_modify_qp"));
        assert!(msg.contains("Invalid argument"));
        assert_eq!(err.class(), ErrorClass::Resource);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_message_too_large() {
        let err = TransportError::MessageTooLarge {
            size: 4096,
            capacity: 1024,
        };
        assert_eq!(
            format!("{}", err),
            "message of 4096 bytes exceeds capacity of 1024 bytes"
        );
        assert_eq!(err.class(), ErrorClass::ProtocolUsage);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_completion_failed_is_hardware() {
        let err = TransportError::CompletionFailed {
            status: CompletionStatus::RetryExceeded,
            wr_id: 7,
            qp_num: 42,
        };
        assert_eq!(err.class(), ErrorClass::Hardware);
        assert!(format!("{}", err).contains("RetryExceeded"));
    }

    #[test]
    fn test_unexpected_opcode() {
        let err = TransportError::UnexpectedOpcode {
            expected: CompletionOpcode::Send,
            got: CompletionOpcode::Receive,
            wr_id: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Send"));
        assert!(msg.contains("Receive"));
    }

    #[test]
    fn test_io_error_is_bootstrap() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer hung up").into();
        assert_eq!(err.class(), ErrorClass::Bootstrap);
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Eager Error System
//!
//! Every fallible operation in the eager runtime reports an [`EagerError`]:
//! - Categorized by an [`ErrorCode`] so callers can decide what to do with it
//! - Chained via the standard [`std::error::Error::source()`] method
//! - Serializable, since remote workers report failures over the wire
//!
//! The status handed to an executor's completion callback is a [`Status`],
//! i.e. `Result<(), EagerError>`.
//!
//! ```rust,ignore
//! use dynamo_eager::error::{EagerError, ErrorCode};
//!
//! let err = EagerError::not_found("Op type not registered 'NoSuchOp'");
//! assert_eq!(err.code(), ErrorCode::NotFound);
//!
//! let cause = std::io::Error::other("connection reset");
//! let err = EagerError::new(ErrorCode::Unavailable, "stream closed", Some(cause));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Completion status of an eager operation.
pub type Status = Result<(), EagerError>;

/// Result alias used throughout the crate.
pub type Result<T, E = EagerError> = std::result::Result<T, E>;

// ============================================================================
// ErrorCode Enum
// ============================================================================

/// Canonical error categories shared by the client and the remote workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The operation was cancelled, typically by the caller or a shutdown.
    Cancelled,
    /// Uncategorized or unknown error.
    Unknown,
    /// The caller supplied an argument the operation cannot accept.
    InvalidArgument,
    /// A deadline expired before the operation could complete.
    DeadlineExceeded,
    /// A requested entity (op, function, handle) does not exist.
    NotFound,
    /// The entity the caller tried to create already exists.
    AlreadyExists,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The operation was aborted, typically due to a concurrency conflict.
    Aborted,
    /// The remote or the transport is currently unavailable.
    Unavailable,
    /// An invariant expected by the runtime has been broken.
    Internal,
}

impl ErrorCode {
    /// Stable snake_case label, used for metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Unknown => "unknown",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::Aborted => "aborted",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::Unknown => "Unknown",
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::DeadlineExceeded => "DeadlineExceeded",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::AlreadyExists => "AlreadyExists",
            ErrorCode::FailedPrecondition => "FailedPrecondition",
            ErrorCode::Aborted => "Aborted",
            ErrorCode::Unavailable => "Unavailable",
            ErrorCode::Internal => "Internal",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// EagerError
// ============================================================================

/// The error type of the eager runtime.
///
/// `Display` shows only the current error (standard Rust convention); walk
/// `source()` for the cause chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EagerError {
    code: ErrorCode,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caused_by: Option<Box<EagerError>>,
}

impl EagerError {
    /// Create a new error with the given code, message, and optional cause.
    ///
    /// A cause that is already an `EagerError` is preserved as-is; anything
    /// else becomes an `Unknown` error carrying its display string.
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        cause: Option<impl std::error::Error + 'static>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            caused_by: cause
                .map(|e| Box::new(EagerError::from(&e as &(dyn std::error::Error + 'static)))),
        }
    }

    /// Create an error with a code and message and no cause.
    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            caused_by: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::FailedPrecondition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::Internal, message)
    }

    /// Returns the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wraps this error as the cause of a new error with the same code.
    pub fn context(self, message: impl Into<String>) -> Self {
        Self {
            code: self.code,
            message: message.into(),
            caused_by: Some(Box::new(self)),
        }
    }
}

impl fmt::Display for EagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for EagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.caused_by
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Convert from a reference to any `std::error::Error`.
///
/// An `EagerError` is cloned; anything else is wrapped as `ErrorCode::Unknown`
/// with its source chain converted recursively.
impl<'a> From<&'a (dyn std::error::Error + 'static)> for EagerError {
    fn from(err: &'a (dyn std::error::Error + 'static)) -> Self {
        if let Some(eager_err) = err.downcast_ref::<EagerError>() {
            return eager_err.clone();
        }

        Self {
            code: ErrorCode::Unknown,
            message: err.to_string(),
            caused_by: err.source().map(|s| Box::new(EagerError::from(s))),
        }
    }
}

impl From<anyhow::Error> for EagerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EagerError>() {
            Ok(eager_err) => eager_err,
            Err(err) => {
                let err: &(dyn std::error::Error + 'static) = err.as_ref();
                EagerError::from(err)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

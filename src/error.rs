//! Error taxonomy of a connection.
//!
//! Only [`QueryError`] is recoverable: it is caught at the per-query boundary, reported to the
//! client as a single Exception packet, and the connection returns to idle. Everything else is
//! wrapped in a [`SessionError`] that ends the connection.
use std::fmt;

use thiserror::Error;

use crate::{
    block::BlockError,
    protocol::{codec::CodecError, transport::TransportError},
};

/// Stable numeric codes reported in Exception packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Syntax,
    UnknownSetting,
    BadArguments,
    UnknownTable,
    TableAlreadyExists,
    TypeMismatch,
    TooManyRows,
    CorruptedData,
    NotAnInsert,
    UnexpectedPacket,
    UnsupportedRevision,
    Authentication,
    Internal,
}

impl ErrorCode {
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::Syntax => 62,
            ErrorCode::UnknownSetting => 115,
            ErrorCode::BadArguments => 36,
            ErrorCode::UnknownTable => 60,
            ErrorCode::TableAlreadyExists => 57,
            ErrorCode::TypeMismatch => 53,
            ErrorCode::TooManyRows => 158,
            ErrorCode::CorruptedData => 246,
            ErrorCode::NotAnInsert => 48,
            ErrorCode::UnexpectedPacket => 101,
            ErrorCode::UnsupportedRevision => 102,
            ErrorCode::Authentication => 516,
            ErrorCode::Internal => 1000,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::Syntax => "SYNTAX_ERROR",
            ErrorCode::UnknownSetting => "UNKNOWN_SETTING",
            ErrorCode::BadArguments => "BAD_ARGUMENTS",
            ErrorCode::UnknownTable => "UNKNOWN_TABLE",
            ErrorCode::TableAlreadyExists => "TABLE_ALREADY_EXISTS",
            ErrorCode::TypeMismatch => "TYPE_MISMATCH",
            ErrorCode::TooManyRows => "TOO_MANY_ROWS",
            ErrorCode::CorruptedData => "CORRUPTED_DATA",
            ErrorCode::NotAnInsert => "NOT_AN_INSERT",
            ErrorCode::UnexpectedPacket => "UNEXPECTED_PACKET_FROM_CLIENT",
            ErrorCode::UnsupportedRevision => "UNSUPPORTED_REVISION",
            ErrorCode::Authentication => "AUTHENTICATION_FAILED",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A fault raised while parsing, planning or executing a query, including insertion faults.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct QueryError {
    pub code: ErrorCode,
    pub message: String,
}

impl QueryError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<BlockError> for QueryError {
    fn from(value: BlockError) -> Self {
        QueryError::new(ErrorCode::BadArguments, value.to_string())
    }
}

impl From<CodecError> for QueryError {
    fn from(value: CodecError) -> Self {
        QueryError::new(ErrorCode::CorruptedData, value.to_string())
    }
}

/// Malformed handshake or framing. Always fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected packet from client: expected {expected}, got {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },

    #[error("client revision {client} is not supported, minimum is {minimum}")]
    UnsupportedRevision { client: u64, minimum: u64 },

    #[error("received {0} packet while a query is in flight")]
    QueryInFlight(&'static str),

    #[error("authentication failed for user '{0}'")]
    Authentication(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnexpectedPacket { .. } | ProtocolError::QueryInFlight(_) => {
                ErrorCode::UnexpectedPacket
            }
            ProtocolError::UnsupportedRevision { .. } => ErrorCode::UnsupportedRevision,
            ProtocolError::Authentication(_) => ErrorCode::Authentication,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl SessionError {
    /// Whether the connection must be closed. Only query faults are recoverable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Query(_))
    }
}

impl From<CodecError> for SessionError {
    fn from(value: CodecError) -> Self {
        SessionError::Query(value.into())
    }
}

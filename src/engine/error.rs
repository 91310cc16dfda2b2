use ulid::Ulid;

use crate::model::{Action, Status};

/// Coarse grouping used for metric labels and SQLSTATE mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Forbidden,
    NotFound,
    Conflict,
    Store,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Store => "store",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    InsufficientQuantity { available: u32 },
    IllegalTransition { from: Status, action: Action },
    Forbidden(&'static str),
    NotFound(Ulid),
    UnknownUser(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Validation(_)
            | EngineError::InsufficientQuantity { .. }
            | EngineError::IllegalTransition { .. }
            | EngineError::LimitExceeded(_) => ErrorClass::Validation,
            EngineError::Forbidden(_) => ErrorClass::Forbidden,
            EngineError::NotFound(_) | EngineError::UnknownUser(_) => ErrorClass::NotFound,
            EngineError::AlreadyExists(_) => ErrorClass::Conflict,
            EngineError::WalError(_) => ErrorClass::Store,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::InsufficientQuantity { available } => write!(
                f,
                "Only {available} units available for the requested time period."
            ),
            EngineError::IllegalTransition { from, action } => {
                write!(f, "cannot {action} a request in state {from}")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownUser(id) => write!(f, "unknown user: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

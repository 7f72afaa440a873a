use crate::registry::types::DataType;
use crate::task::MsgType;
use thiserror::Error;

/// Sandbox resource whose ceiling an invocation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxResource {
    ExecutionTime,
    Fuel,
    Memory,
    Stack,
}

impl std::fmt::Display for SandboxResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxResource::ExecutionTime => write!(f, "execution time"),
            SandboxResource::Fuel => write!(f, "fuel"),
            SandboxResource::Memory => write!(f, "memory"),
            SandboxResource::Stack => write!(f, "stack"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    InvalidOperationKind,
    InvalidTaskState,
    AlreadyExists,
    NotFound,
    NotReady,
    Store,
    QueueFull,
    Timeout,
    Unavailable,
    IntegrityError,
    CompileError,
    ArgumentTypeMismatch,
    ResourceExceeded,
    SandboxTrap,
}

impl CoordErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordErrorCode::Io => "io",
            CoordErrorCode::Encode => "encode",
            CoordErrorCode::Decode => "decode",
            CoordErrorCode::Validation => "validation",
            CoordErrorCode::InvalidConfig => "invalid_config",
            CoordErrorCode::InvalidOperationKind => "invalid_operation_kind",
            CoordErrorCode::InvalidTaskState => "invalid_task_state",
            CoordErrorCode::AlreadyExists => "already_exists",
            CoordErrorCode::NotFound => "not_found",
            CoordErrorCode::NotReady => "not_ready",
            CoordErrorCode::Store => "store_error",
            CoordErrorCode::QueueFull => "queue_full",
            CoordErrorCode::Timeout => "timeout",
            CoordErrorCode::Unavailable => "unavailable",
            CoordErrorCode::IntegrityError => "integrity_error",
            CoordErrorCode::CompileError => "compile_error",
            CoordErrorCode::ArgumentTypeMismatch => "argument_type_mismatch",
            CoordErrorCode::ResourceExceeded => "resource_exceeded",
            CoordErrorCode::SandboxTrap => "sandbox_trap",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid operation kind: expected {expected}, got {actual}")]
    InvalidOperationKind { expected: MsgType, actual: MsgType },
    #[error("invalid task state: {message}")]
    InvalidTaskState { message: String },
    #[error("function '{name}' already exists")]
    AlreadyExists { name: String },
    #[error("function '{name}' not found")]
    NotFound { name: String },
    #[error("function registry is not ready")]
    NotReady,
    #[error("metadata store error: {0}")]
    Store(String),
    #[error("mutation queue full")]
    QueueFull,
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("coordinator unavailable: {message}")]
    Unavailable { message: String },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("compile error: {0}")]
    CompileError(String),
    #[error("argument type mismatch for '{function}': expected {expected:?}, got {actual:?}")]
    ArgumentTypeMismatch {
        function: String,
        expected: Vec<DataType>,
        actual: Vec<DataType>,
    },
    #[error("sandbox {resource} limit exceeded: {detail}")]
    ResourceExceeded {
        resource: SandboxResource,
        detail: String,
    },
    #[error("sandbox trap: {0}")]
    SandboxTrap(String),
}

impl CoordError {
    pub fn code(&self) -> CoordErrorCode {
        match self {
            CoordError::Io(_) => CoordErrorCode::Io,
            CoordError::Encode(_) => CoordErrorCode::Encode,
            CoordError::Decode(_) => CoordErrorCode::Decode,
            CoordError::Validation(_) => CoordErrorCode::Validation,
            CoordError::InvalidConfig { .. } => CoordErrorCode::InvalidConfig,
            CoordError::InvalidOperationKind { .. } => CoordErrorCode::InvalidOperationKind,
            CoordError::InvalidTaskState { .. } => CoordErrorCode::InvalidTaskState,
            CoordError::AlreadyExists { .. } => CoordErrorCode::AlreadyExists,
            CoordError::NotFound { .. } => CoordErrorCode::NotFound,
            CoordError::NotReady => CoordErrorCode::NotReady,
            CoordError::Store(_) => CoordErrorCode::Store,
            CoordError::QueueFull => CoordErrorCode::QueueFull,
            CoordError::Timeout(_) => CoordErrorCode::Timeout,
            CoordError::Unavailable { .. } => CoordErrorCode::Unavailable,
            CoordError::IntegrityError { .. } => CoordErrorCode::IntegrityError,
            CoordError::CompileError(_) => CoordErrorCode::CompileError,
            CoordError::ArgumentTypeMismatch { .. } => CoordErrorCode::ArgumentTypeMismatch,
            CoordError::ResourceExceeded { .. } => CoordErrorCode::ResourceExceeded,
            CoordError::SandboxTrap(_) => CoordErrorCode::SandboxTrap,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub(crate) fn not_found(name: &str) -> Self {
        CoordError::NotFound {
            name: name.to_string(),
        }
    }

    pub(crate) fn already_exists(name: &str) -> Self {
        CoordError::AlreadyExists {
            name: name.to_string(),
        }
    }
}

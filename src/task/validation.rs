use crate::config::RequestLimits;
use crate::error::CoordError;
use crate::task::{MsgType, TaskRequest};

pub fn validate_request(request: &TaskRequest, limits: &RequestLimits) -> Result<(), CoordError> {
    check_kind(request.base().msg_type, request.expected_kind())?;
    // Lookups take any name; an unknown one is reported by the registry.
    match request {
        TaskRequest::CreateFunction(r) => {
            validate_function_name(&r.function_name, limits)?;
            validate_binary(&r.binary, limits)?;
            validate_arity(r.arg_types.len(), limits)
        }
        TaskRequest::RunFunction(r) => {
            if r.timeout.is_some_and(|t| t.is_zero()) {
                return Err(CoordError::Validation("run timeout must be > 0".into()));
            }
            Ok(())
        }
        TaskRequest::DropFunction(_) | TaskRequest::GetFunctionInfo(_) => Ok(()),
    }
}

pub fn check_kind(actual: MsgType, expected: MsgType) -> Result<(), CoordError> {
    if actual == expected {
        return Ok(());
    }
    Err(CoordError::InvalidOperationKind { expected, actual })
}

pub fn validate_function_name(name: &str, limits: &RequestLimits) -> Result<(), CoordError> {
    if name.is_empty() {
        return Err(CoordError::Validation("function name must not be empty".into()));
    }
    if name.len() > limits.max_function_name_bytes {
        return Err(CoordError::Validation(format!(
            "function name exceeds {} bytes",
            limits.max_function_name_bytes
        )));
    }
    Ok(())
}

fn validate_binary(binary: &[u8], limits: &RequestLimits) -> Result<(), CoordError> {
    if binary.is_empty() {
        return Err(CoordError::Validation("function binary must not be empty".into()));
    }
    if binary.len() > limits.max_binary_bytes {
        return Err(CoordError::Validation(format!(
            "function binary of {} bytes exceeds {} bytes",
            binary.len(),
            limits.max_binary_bytes
        )));
    }
    Ok(())
}

fn validate_arity(count: usize, limits: &RequestLimits) -> Result<(), CoordError> {
    if count > limits.max_arguments {
        return Err(CoordError::Validation(format!(
            "{count} arguments exceed the limit of {}",
            limits.max_arguments
        )));
    }
    Ok(())
}

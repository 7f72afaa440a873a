pub mod executor;
pub mod validation;

use crate::config::RequestLimits;
use crate::error::CoordError;
use crate::registry::types::{DataType, FunctionDefinition, Value};
use crate::tso::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Declared operation kind carried by every inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    CreateFunction,
    DropFunction,
    GetFunctionInfo,
    RunFunction,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::CreateFunction => "CreateFunction",
            MsgType::DropFunction => "DropFunction",
            MsgType::GetFunctionInfo => "GetFunctionInfo",
            MsgType::RunFunction => "RunFunction",
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgBase {
    pub msg_type: MsgType,
    /// Caller correlation id, only used in logs.
    pub msg_id: u64,
}

impl MsgBase {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            msg_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFunctionRequest {
    pub base: MsgBase,
    pub function_name: String,
    pub binary: Vec<u8>,
    pub arg_types: Vec<DataType>,
}

impl CreateFunctionRequest {
    pub fn new(function_name: impl Into<String>, binary: Vec<u8>, arg_types: Vec<DataType>) -> Self {
        Self {
            base: MsgBase::new(MsgType::CreateFunction),
            function_name: function_name.into(),
            binary,
            arg_types,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropFunctionRequest {
    pub base: MsgBase,
    pub function_name: String,
}

impl DropFunctionRequest {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            base: MsgBase::new(MsgType::DropFunction),
            function_name: function_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetFunctionInfoRequest {
    pub base: MsgBase,
    pub function_name: String,
}

impl GetFunctionInfoRequest {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            base: MsgBase::new(MsgType::GetFunctionInfo),
            function_name: function_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunFunctionRequest {
    pub base: MsgBase,
    pub function_name: String,
    pub args: Vec<Value>,
    /// Tightens the configured execution limit for this call only.
    pub timeout: Option<Duration>,
}

impl RunFunctionRequest {
    pub fn new(function_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            base: MsgBase::new(MsgType::RunFunction),
            function_name: function_name.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Closed set of operations handled by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    CreateFunction(CreateFunctionRequest),
    DropFunction(DropFunctionRequest),
    GetFunctionInfo(GetFunctionInfoRequest),
    RunFunction(RunFunctionRequest),
}

impl TaskRequest {
    /// Kind the handling task expects, independent of what the envelope says.
    pub fn expected_kind(&self) -> MsgType {
        match self {
            TaskRequest::CreateFunction(_) => MsgType::CreateFunction,
            TaskRequest::DropFunction(_) => MsgType::DropFunction,
            TaskRequest::GetFunctionInfo(_) => MsgType::GetFunctionInfo,
            TaskRequest::RunFunction(_) => MsgType::RunFunction,
        }
    }

    pub fn base(&self) -> &MsgBase {
        match self {
            TaskRequest::CreateFunction(r) => &r.base,
            TaskRequest::DropFunction(r) => &r.base,
            TaskRequest::GetFunctionInfo(r) => &r.base,
            TaskRequest::RunFunction(r) => &r.base,
        }
    }
}

impl From<CreateFunctionRequest> for TaskRequest {
    fn from(value: CreateFunctionRequest) -> Self {
        TaskRequest::CreateFunction(value)
    }
}

impl From<DropFunctionRequest> for TaskRequest {
    fn from(value: DropFunctionRequest) -> Self {
        TaskRequest::DropFunction(value)
    }
}

impl From<GetFunctionInfoRequest> for TaskRequest {
    fn from(value: GetFunctionInfoRequest) -> Self {
        TaskRequest::GetFunctionInfo(value)
    }
}

impl From<RunFunctionRequest> for TaskRequest {
    fn from(value: RunFunctionRequest) -> Self {
        TaskRequest::RunFunction(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Prepared,
    Executed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Executed | TaskState::Failed)
    }
}

/// One inbound operation moving through prepare and execute.
#[derive(Debug, Clone)]
pub struct Task {
    request: TaskRequest,
    ts: Option<Timestamp>,
    state: TaskState,
}

impl Task {
    pub fn new(request: impl Into<TaskRequest>) -> Self {
        Self {
            request: request.into(),
            ts: None,
            state: TaskState::New,
        }
    }

    pub fn request(&self) -> &TaskRequest {
        &self.request
    }

    pub fn ts(&self) -> Option<Timestamp> {
        self.ts
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Side-effect free validation. Preparing an already prepared task is a
    /// no-op.
    pub fn prepare(&mut self, limits: &RequestLimits) -> Result<(), CoordError> {
        match self.state {
            TaskState::Prepared => return Ok(()),
            TaskState::New => {}
            TaskState::Executed | TaskState::Failed => {
                return Err(CoordError::InvalidTaskState {
                    message: format!("cannot prepare a task in state {:?}", self.state),
                });
            }
        }
        match validation::validate_request(&self.request, limits) {
            Ok(()) => {
                self.state = TaskState::Prepared;
                Ok(())
            }
            Err(err) => {
                self.state = TaskState::Failed;
                Err(err)
            }
        }
    }

    pub(crate) fn ensure_prepared(&self) -> Result<(), CoordError> {
        if self.state == TaskState::Prepared {
            return Ok(());
        }
        Err(CoordError::InvalidTaskState {
            message: format!(
                "execute requires a prepared task, found {:?}",
                self.state
            ),
        })
    }

    pub(crate) fn assign_ts(&mut self, ts: Timestamp) -> Result<(), CoordError> {
        if let Some(existing) = self.ts {
            return Err(CoordError::InvalidTaskState {
                message: format!("timestamp already assigned ({existing})"),
            });
        }
        self.ts = Some(ts);
        Ok(())
    }

    pub(crate) fn finish(&mut self, succeeded: bool) {
        self.state = if succeeded {
            TaskState::Executed
        } else {
            TaskState::Failed
        };
    }
}

/// GetFunctionInfo response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub binary: Vec<u8>,
    pub arg_types: Vec<DataType>,
    pub registered_at: Timestamp,
}

impl From<&FunctionDefinition> for FunctionInfo {
    fn from(value: &FunctionDefinition) -> Self {
        Self {
            name: value.name.clone(),
            binary: value.binary.clone(),
            arg_types: value.arg_types.clone(),
            registered_at: value.registered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Created { ts: Timestamp },
    Dropped { ts: Timestamp },
    Info(FunctionInfo),
    Ran(Vec<Value>),
}

impl TaskOutput {
    pub fn committed_ts(&self) -> Option<Timestamp> {
        match self {
            TaskOutput::Created { ts } | TaskOutput::Dropped { ts } => Some(*ts),
            TaskOutput::Info(_) | TaskOutput::Ran(_) => None,
        }
    }
}

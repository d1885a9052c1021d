use std::error::Error;

use crate::error::{RpcError, codes};

use super::RTValue;

/// `Runtime::error` 接受的失败形态。
///
/// - `Rpc`：带码错误，原样写回；
/// - `Message`：普通错误对象，只保留消息，以 [`codes::ACTION`] 写回；
/// - `Nil`：空错误，写回 [`codes::RUNTIME_NIL_ERROR`]。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionFailure {
    Rpc(RpcError),
    Message(String),
    Nil,
}

impl ActionFailure {
    pub(crate) fn into_rpc_error(self) -> RpcError {
        match self {
            Self::Rpc(err) => err,
            Self::Message(message) => codes::ACTION.with_message(message),
            Self::Nil => codes::RUNTIME_NIL_ERROR.error(),
        }
    }
}

impl From<RpcError> for ActionFailure {
    fn from(err: RpcError) -> Self {
        Self::Rpc(err)
    }
}

impl From<Option<RpcError>> for ActionFailure {
    fn from(err: Option<RpcError>) -> Self {
        err.map_or(Self::Nil, Self::Rpc)
    }
}

/// 嵌套调用返回的上游错误直接透传；不携带错误的 `RTValue` 视为空错误。
impl From<RTValue> for ActionFailure {
    fn from(value: RTValue) -> Self {
        value.err().cloned().into()
    }
}

impl From<&RTValue> for ActionFailure {
    fn from(value: &RTValue) -> Self {
        value.err().cloned().into()
    }
}

impl From<Box<dyn Error + Send + Sync>> for ActionFailure {
    fn from(err: Box<dyn Error + Send + Sync>) -> Self {
        match err.downcast::<RpcError>() {
            Ok(err) => Self::Rpc(*err),
            Err(err) => Self::Message(err.to_string()),
        }
    }
}

impl From<String> for ActionFailure {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for ActionFailure {
    fn from(message: &str) -> Self {
        Self::Message(message.to_owned())
    }
}

use std::sync::Arc;

use crate::error::{RpcError, codes};
use crate::service::Action;
use crate::wire::Stream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrameStatus {
    Pending,
    Ok,
    Error,
}

/// 执行器调用栈上的一层，对应一次进行中的调用。
pub(crate) struct Frame {
    pub(crate) id: u64,
    pub(crate) depth: u16,
    pub(crate) from: String,
    pub(crate) action: Arc<Action>,
    pub(crate) response: Box<Stream>,
    pub(crate) status: FrameStatus,
}

impl Frame {
    /// `ok`/`error` 每次调用只允许生效一次。
    pub(crate) fn check_pending(&self) -> Result<(), RpcError> {
        let def = match self.status {
            FrameStatus::Pending => return Ok(()),
            FrameStatus::Ok => codes::RUNTIME_OK_CALLED,
            FrameStatus::Error => codes::RUNTIME_ERROR_CALLED,
        };
        Err(def.with_message(format!("{}: {}", self.action.path(), def.message())))
    }
}

/// 把响应正文改写为 `code` + 消息。
pub(crate) fn write_error_body(stream: &mut Stream, err: &RpcError) {
    stream.set_write_pos_to_body_start();
    stream.write_uint64(err.code());
    if stream.write_string(err.message()).is_err() {
        // 消息本身无法编码时只保留码值。
        stream.set_write_pos_to_body_start();
        stream.write_uint64(err.code());
        let _ = stream.write_string("");
    }
}

use crate::error::{RpcError, codes};
use crate::wire::Stream;

use super::control::{self, ConnectInfo};

/// 客户端会话状态。
///
/// # 教案式说明
/// - **意图 (Why)**：客户端负责分配 `callback_id` 并在重连时判断服务端会话是否仍可续用；
/// - **契约 (What)**：
///   - `callback_id` 从 1 开始递增，0 保留给控制帧；
///   - 每个通道同一时刻只允许一个未完成请求，通道被占用时 [`ClientSession::begin_request`] 返回 `None`；
///   - 重连时令牌与会话参数都未变化则续用全部状态；任一变化都会重置通道并返回
///     [`codes::SECURITY_CONFIG_CHANGED`]，此时新参数已经生效。
#[derive(Debug, Default)]
pub struct ClientSession {
    info: Option<ConnectInfo>,
    session_id: u64,
    next_callback: u64,
    outstanding: Vec<Option<u64>>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.token.as_str())
    }

    pub fn info(&self) -> Option<&ConnectInfo> {
        self.info.as_ref()
    }

    /// 构造握手请求，携带已持有的令牌。
    pub fn connect_request(&self) -> Result<Box<Stream>, RpcError> {
        control::connect_request(self.token())
    }

    fn adopt(&mut self, info: ConnectInfo, session_id: u64) {
        let channels = usize::try_from(info.num_of_channels).unwrap_or(1).max(1);
        self.outstanding = vec![None; channels];
        self.next_callback = 1;
        self.session_id = session_id;
        self.info = Some(info);
    }

    /// 处理握手响应。
    pub fn on_connect_response(&mut self, stream: &mut Stream) -> Result<(), RpcError> {
        let session_id = stream.session_id();
        let info = ConnectInfo::from_stream(stream)?;
        match &self.info {
            None => {
                self.adopt(info, session_id);
                Ok(())
            }
            Some(current) if current.token == info.token && current.same_config(&info) => {
                tracing::debug!(session_id, "session resumed");
                Ok(())
            }
            Some(_) => {
                tracing::warn!(session_id, "session config changed, channels reset");
                self.adopt(info, session_id);
                Err(codes::SECURITY_CONFIG_CHANGED.with_message("config changed"))
            }
        }
    }

    /// 为请求分配 `callback_id` 并写入头部；未握手或通道被占用时返回 `None`。
    pub fn begin_request(&mut self, stream: &mut Stream) -> Option<u64> {
        if self.info.is_none() || self.outstanding.is_empty() {
            return None;
        }
        let callback_id = self.next_callback.max(1);
        let len = self.outstanding.len() as u64;
        let slot = &mut self.outstanding[(callback_id % len) as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(callback_id);
        self.next_callback = callback_id + 1;
        stream.set_callback_id(callback_id);
        stream.set_session_id(self.session_id);
        Some(callback_id)
    }

    /// 收到响应后释放对应通道；编号与通道中的未完成请求不符时返回 `false`。
    pub fn complete(&mut self, callback_id: u64) -> bool {
        if self.outstanding.is_empty() {
            return false;
        }
        let len = self.outstanding.len() as u64;
        let slot = &mut self.outstanding[(callback_id % len) as usize];
        if *slot == Some(callback_id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.iter().filter(|slot| slot.is_some()).count()
    }
}

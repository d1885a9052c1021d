//! 控制帧：`callback_id == 0` 的流，不经过通道状态机。
//!
//! 正文首个值为控制种类（`int64`），其后是种类相关的字段：
//!
//! | 种类 | 值 | 字段 |
//! |---|---|---|
//! | `ConnectRequest` | 1 | 已持有的会话令牌（新会话为空串） |
//! | `ConnectResponse` | 2 | 令牌、通道数、传输上限、心跳间隔、心跳超时、请求间隔（毫秒） |
//! | `Ping` | 3 | 无 |
//! | `Pong` | 4 | 无 |

use crate::config::SessionConfig;
use crate::error::{RpcError, codes};
use crate::wire::{STREAM_BODY_POS, Stream};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ControlKind {
    ConnectRequest = 1,
    ConnectResponse = 2,
    Ping = 3,
    Pong = 4,
}

impl ControlKind {
    pub fn from_i64(raw: i64) -> Option<Self> {
        Some(match raw {
            1 => Self::ConnectRequest,
            2 => Self::ConnectResponse,
            3 => Self::Ping,
            4 => Self::Pong,
            _ => return None,
        })
    }
}

fn bad_control(reason: impl std::fmt::Display) -> RpcError {
    codes::BAD_CONTROL_STREAM.with_message(format!("control stream is illegal: {reason}"))
}

/// 从正文起点读取控制种类。
pub fn read_kind(stream: &mut Stream) -> Result<ControlKind, RpcError> {
    stream.set_read_pos_to_body_start();
    let raw = stream.read_int64().map_err(bad_control)?;
    ControlKind::from_i64(raw).ok_or_else(|| bad_control(format!("unknown kind {raw}")))
}

fn control_stream(kind: ControlKind) -> Box<Stream> {
    let mut stream = Stream::new();
    stream.set_callback_id(0);
    stream.write_int64(kind as i64);
    stream
}

/// 新建连接请求；`token` 为上一次握手得到的令牌。
pub fn connect_request(token: Option<&str>) -> Result<Box<Stream>, RpcError> {
    let mut stream = control_stream(ControlKind::ConnectRequest);
    if let Err(err) = stream.write_string(token.unwrap_or_default()) {
        stream.release();
        return Err(err.into());
    }
    Ok(stream)
}

pub fn ping() -> Box<Stream> {
    control_stream(ControlKind::Ping)
}

/// 把 `Ping` 原地改写为 `Pong`：两者都是单字节的小整数，只需替换正文首字节。
pub(crate) fn ping_to_pong(stream: &mut Stream) -> bool {
    let mut pong = Stream::new();
    pong.write_int64(ControlKind::Pong as i64);
    let byte = pong.byte_at(STREAM_BODY_POS);
    pong.release();
    match byte {
        Some(byte) => stream.put_at(STREAM_BODY_POS, &[byte]),
        None => false,
    }
}

/// 握手响应携带的会话令牌与会话参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectInfo {
    pub token: String,
    pub num_of_channels: u64,
    pub trans_limit: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub request_interval_ms: u64,
}

impl ConnectInfo {
    pub fn new(token: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            token: token.into(),
            num_of_channels: config.num_of_channels as u64,
            trans_limit: config.trans_limit as u64,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            request_interval_ms: config.request_interval_ms,
        }
    }

    /// 除令牌外的参数是否一致。
    pub fn same_config(&self, other: &Self) -> bool {
        self.num_of_channels == other.num_of_channels
            && self.trans_limit == other.trans_limit
            && self.heartbeat_interval_ms == other.heartbeat_interval_ms
            && self.heartbeat_timeout_ms == other.heartbeat_timeout_ms
            && self.request_interval_ms == other.request_interval_ms
    }

    pub fn to_stream(&self, session_id: u64) -> Result<Box<Stream>, RpcError> {
        let mut stream = control_stream(ControlKind::ConnectResponse);
        stream.set_session_id(session_id);
        if let Err(err) = stream.write_string(&self.token) {
            stream.release();
            return Err(err.into());
        }
        for field in [
            self.num_of_channels,
            self.trans_limit,
            self.heartbeat_interval_ms,
            self.heartbeat_timeout_ms,
            self.request_interval_ms,
        ] {
            stream.write_uint64(field);
        }
        Ok(stream)
    }

    pub fn from_stream(stream: &mut Stream) -> Result<Self, RpcError> {
        match read_kind(stream)? {
            ControlKind::ConnectResponse => {}
            other => return Err(bad_control(format!("expected connect response, got {other:?}"))),
        }
        let token = stream.read_string().map_err(bad_control)?;
        let mut next = || stream.read_uint64().map_err(bad_control);
        Ok(Self {
            token,
            num_of_channels: next()?,
            trans_limit: next()?,
            heartbeat_interval_ms: next()?,
            heartbeat_timeout_ms: next()?,
            request_interval_ms: next()?,
        })
    }
}

//! # transport：传输适配器契约
//!
//! ## 角色定位（Why）
//! - TCP、WebSocket 等具体适配器不在本 crate 内实现，会话层只依赖这里的两个接口；
//! - [`memory::MemoryConn`] 是进程内回环实现，供嵌入式使用与测试。
//!
//! ## 契约（What）
//! - 适配器保证按帧交付：每个 [`Stream`] 对应线上一个 `4 字节小端长度 + 流字节` 的帧，
//!   超过上限的帧在解码前被拒绝；
//! - 每条连接依次触发 `on_open`、若干 `on_read_stream` / `on_error`、最后一次 `on_close`；
//! - `write_stream_and_release` 同步写出并释放流，连接关闭后返回 [`codes::TRANSPORT_CONN`](crate::codes::TRANSPORT_CONN)。

pub mod memory;

use std::sync::Arc;

use crate::error::RpcError;
use crate::wire::Stream;

/// 一条已建立的连接。
pub trait StreamConn: Send + Sync {
    /// 进程内唯一的连接编号。
    fn conn_id(&self) -> u64;

    /// 写出一个流；无论成功与否流都已被释放。
    fn write_stream_and_release(&self, stream: Box<Stream>) -> Result<(), RpcError>;

    /// 关闭连接，随后触发一次 `on_close`。
    fn close(&self);
}

/// 连接事件的接收方，通常是会话服务端。
pub trait StreamReceiver: Send + Sync {
    fn on_open(&self, conn: &Arc<dyn StreamConn>);

    fn on_read_stream(&self, conn: &Arc<dyn StreamConn>, stream: Box<Stream>);

    fn on_error(&self, conn: &Arc<dyn StreamConn>, err: RpcError);

    fn on_close(&self, conn: &Arc<dyn StreamConn>);
}

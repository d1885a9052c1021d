//! # session：会话与通道协议
//!
//! ## 角色定位（Why）
//! - 在不可靠的连接之上为每个客户端维持长期会话：断线重连后凭令牌续用，重复请求最多执行一次；
//! - 服务端 [`SessionServer`] 实现 [`StreamReceiver`](crate::transport::StreamReceiver)，
//!   并为处理器提供返回通道；客户端 [`ClientSession`] 负责编号分配与重连判定。
//!
//! ## 协议要点（What）
//! - 令牌形如 `"<id>-<secret>"`，握手响应同时下发通道数、传输上限、心跳与请求间隔；
//! - 请求按 `callback_id % num_of_channels` 落入通道，通道只接纳严格递增的编号，
//!   同号重复请求在有缓存时重发缓存回复，否则丢弃；
//! - `callback_id == 0` 保留给控制帧（见 [`control`]），`Ping` 原地改写为 `Pong` 回送。

mod channel;
mod client;
mod context;
pub mod control;
mod server;

pub use client::ClientSession;
pub use control::{ConnectInfo, ControlKind};
pub use server::{SessionServer, SweepReport, SweeperHandle};

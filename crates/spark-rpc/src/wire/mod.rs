//! # wire：二进制流与类型化取值
//!
//! ## 角色定位（Why）
//! - 为请求、响应与控制帧提供统一的承载结构 [`Stream`]：44 字节固定头部 + 自描述值组成的消息体；
//! - 以 512 字节定长分段承载数据，扩容只追加分段而不搬移旧数据，分段与流对象均池化复用。
//!
//! ## 模块结构（How）
//! - `segment`：进程级分段池；
//! - `opcode`：操作码常量与 256 项跳读表；
//! - `pos`：`PosRecord` 带标记位置；
//! - `stream`：游标、头部、跨分段读写原语；
//! - `write` / `read`：类型化写入与原子读取、跳读、拼接；
//! - `value`：动态值 [`Value`]；
//! - `framing`：传输层 4 字节小端长度前缀帧编解码。
//!
//! ## 契约（What）
//! - 所有多字节整数均为小端；
//! - 读取要么恰好消费一个值并推进游标，要么游标保持不变并返回 [`StreamError`]；
//! - 嵌套写入失败时写游标回滚到调用前位置。

mod error;
mod framing;
pub(crate) mod opcode;
mod pos;
mod read;
mod segment;
mod stream;
mod value;
mod write;

pub use error::StreamError;
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FRAME_PREFIX_SIZE, FrameCodec};
pub use opcode::{MAX_NESTING_DEPTH, opcode_type_name};
pub use pos::PosRecord;
pub use read::{BytesView, StrView};
pub use segment::SEGMENT_SIZE;
pub use stream::{STREAM_BODY_POS, STREAM_HEAD_SIZE, Stream, StreamHeader};
pub use value::{Array, Map, Value};

pub(crate) use read::ContainerHeader;
pub(crate) use write::{DetachedRuntime, RuntimeWriter};

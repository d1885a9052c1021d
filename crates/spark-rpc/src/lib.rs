#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-rpc: 基于工作线程池与会话通道的高吞吐二进制 RPC 处理器。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "1. wire: 分段流、十五种类型化取值、4 字节小端长度前缀帧；"]
#![doc = "2. service: 服务树挂载、处理函数签名匹配与派发缓存；"]
#![doc = "3. runtime: 处理函数可见的调用句柄与竞技场视图；"]
#![doc = "4. executor / processor: 执行器池、求值流程与处理器门面；"]
#![doc = "5. session / transport: 会话令牌、通道去重重发与传输适配器契约。"]
#![doc = ""]
#![doc = "== 请求数据流 =="]
#![doc = "传输层 → 会话 → 通道准入 → 空闲执行器 → 缓存或默认派发 → 处理函数 → 响应写入栈帧 → 通道缓存回复 → 传输层。"]

/// 处理器与会话配置。
pub mod config;
pub mod error;
pub mod panic_hub;
pub mod runtime;
pub mod service;
pub mod session;
pub mod transport;
pub mod wire;

mod executor;
mod processor;

pub use config::{ConfigError, ProcessorConfig, ServerConfig, SessionConfig};
pub use error::{ErrorDef, ErrorKind, ErrorLevel, RpcError, codes};
pub use processor::{Processor, ReturnSink, StreamSubmitter};
pub use runtime::{ActionFailure, RTArray, RTMap, RTValue, Return, Runtime};
pub use service::{
    ActionArg, ActionStats, ArgKind, DispatchCache, DispatchFn, IntoHandler, PERF_BUCKET_LIMITS_MS,
    PerfSnapshot, Service, ServiceData, ServiceMeta, dispatch,
};
pub use session::{ClientSession, ConnectInfo, ControlKind, SessionServer, SweepReport, SweeperHandle};
pub use transport::{StreamConn, StreamReceiver};
pub use wire::{Array, FrameCodec, Map, PosRecord, Stream, StreamError, StreamHeader, Value};

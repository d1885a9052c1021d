//! # service：服务树、处理函数签名与派发
//!
//! ## 角色定位（Why）
//! - 应用代码以 [`Service`] 构建器声明动作与子服务，以 [`ServiceMeta`] 挂到根服务 `#` 下；
//! - 注册阶段把闭包的参数类型归约为 kind-string，调用阶段据此选择缓存派发或默认派发。
//!
//! ## 结构（What）
//! - `builder`：构建器与注册位置记录；
//! - `signature`：参数类型集合、kind-string 与默认（类型擦除）派发；
//! - [`dispatch`]：单态派发函数与 [`DispatchCache`]；
//! - `registry`：挂载、卸载与无锁读取的动作表；
//! - `data` / `perf`：服务数据与耗时统计。

mod builder;
mod data;
pub mod dispatch;
mod perf;
pub(crate) mod registry;
mod signature;

pub use builder::{Service, ServiceMeta};
pub use data::ServiceData;
pub use dispatch::{ActionArg, DispatchCache, DispatchFn};
pub use perf::{PERF_BUCKET_LIMITS_MS, PerfSnapshot};
pub use registry::ActionStats;
#[doc(hidden)]
pub use signature::HandlerEntry;
pub use signature::{ArgKind, IntoHandler};

pub(crate) use dispatch::{DISPATCH_MISMATCH, render_cache_module};
pub(crate) use registry::{Action, LifecycleRunner, ON_UPDATE_CONFIG, Registry};
pub(crate) use signature::ordinal;

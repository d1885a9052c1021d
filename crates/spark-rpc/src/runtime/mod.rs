//! # runtime：处理函数可见的调用句柄
//!
//! ## 角色定位（Why）
//! - [`Runtime`] 是执行器交给处理函数的能力令牌：写回结果、报告错误、发起嵌套调用、访问服务数据；
//! - [`RTValue`]、[`RTArray`]、[`RTMap`] 是竞技场中编码值的惰性视图，只记录位置，按需解码。
//!
//! ## 令牌纪律（What）
//! - 每次调用分配唯一的偶数 `id`，执行器当前令牌等于 `id` 时，句柄上的任何操作先以
//!   CAS 把令牌改为 `id + 1` 加锁，结束后再恢复为 `id`；
//! - 调用结束后令牌被推进到一个从未分配过的新值，先前调用遗留的句柄永远无法再加锁，
//!   此时操作返回 `Runtime is illegal in current thread`；
//! - 视图的有效期与所属调用一致；竞技场在最外层调用结束时整体复位。

mod arena;
mod failure;
mod handle;
mod rt_array;
mod rt_map;
mod rt_value;

pub(crate) use arena::{Arena, ArenaWriter};
pub use failure::ActionFailure;
pub use handle::{Return, Runtime};
pub use rt_array::RTArray;
pub use rt_map::RTMap;
pub use rt_value::RTValue;

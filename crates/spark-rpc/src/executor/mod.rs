//! # executor：求值核心与工作执行器池
//!
//! ## 角色定位（Why）
//! - `eval`：单次请求的求值流程，负责查找动作、校验深度、管理调用栈与令牌；
//! - `pool`：分片空闲队列 + 每执行器一个线程，请求经容量为 1 的输入通道投递；
//! - `system`：不进入空闲队列的系统执行器，只用于生命周期动作。
//!
//! ## 令牌纪律（What）
//! - 求值开始时为调用分配新的偶数 `id` 并写入令牌；
//! - 处理函数返回后以 CAS 把令牌从 `id` 推进到新分配的值，失败说明仍有句柄持锁，
//!   每 10ms 重试一次；
//! - 嵌套调用在同一线程上重入 `eval`，返回后由外层句柄恢复自己的 `id`。

mod eval;
mod frame;
mod pool;
mod system;

pub(crate) use eval::{ExecutorCore, ExecutorState};
pub(crate) use frame::{Frame, FrameStatus, write_error_body};
pub(crate) use pool::ExecutorPool;
pub(crate) use system::SystemExecutor;

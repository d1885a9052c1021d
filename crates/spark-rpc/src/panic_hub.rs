//! 进程级内核错误订阅。
//!
//! 投递响应时发生的二次 panic、关闭阶段的异常以及 `Runtime` 的越权使用无法写回原请求，
//! 统一经由 [`publish`] 广播；每个处理器在构建时 [`subscribe`]，并把报告转发给自己的返回通道。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::RpcError;

type Handler = Arc<dyn Fn(&RpcError) + Send + Sync>;

static SUBSCRIBERS: Mutex<Vec<(u64, Handler)>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 订阅句柄，析构时自动退订。
#[must_use = "dropping the subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct PanicSubscription {
    id: u64,
}

impl Drop for PanicSubscription {
    fn drop(&mut self) {
        SUBSCRIBERS.lock().retain(|(id, _)| *id != self.id);
    }
}

pub fn subscribe(handler: impl Fn(&RpcError) + Send + Sync + 'static) -> PanicSubscription {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    SUBSCRIBERS.lock().push((id, Arc::new(handler)));
    PanicSubscription { id }
}

/// 广播一条内核级错误；回调在锁外执行，允许其中再次订阅或退订。
pub fn publish(err: &RpcError) {
    tracing::error!(code = err.code(), error = %err, "kernel level error published");
    let handlers: Vec<Handler> = SUBSCRIBERS
        .lock()
        .iter()
        .map(|(_, handler)| Arc::clone(handler))
        .collect();
    for handler in handlers {
        handler(err);
    }
}

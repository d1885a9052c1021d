//! # processor：处理器门面
//!
//! ## 角色定位（Why）
//! - 把服务树、执行器池、系统执行器与配置更新定时器组装为一个对象，对外只暴露
//!   `submit`、`build_cache`、`close` 等少量入口；
//! - 会话层通过 [`StreamSubmitter`] 投递请求，响应经由构建时传入的 [`ReturnSink`] 返回。
//!
//! ## 生命周期（What）
//! 1. [`Processor::new`]：校验配置、启动执行器池、逐个挂载服务（失败则关闭池并返回错误）、
//!    启动 `$onUpdateConfig` 定时器、订阅内核错误广播；
//! 2. 运行期：`submit` 投递请求，响应与内核错误都以流的形式交给返回通道；
//! 3. [`Processor::close`]：停止定时器、关闭执行器池、卸载全部服务；析构时自动关闭。

use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::ProcessorConfig;
use crate::error::{RpcError, codes};
use crate::executor::{ExecutorCore, ExecutorPool, SystemExecutor, write_error_body};
use crate::panic_hub::{self, PanicSubscription};
use crate::service::{
    ActionStats, DispatchCache, LifecycleRunner, ON_UPDATE_CONFIG, Registry, ServiceMeta,
    render_cache_module,
};
use crate::wire::Stream;

/// 响应与内核错误的出口，通常由会话层提供。
pub type ReturnSink = Arc<dyn Fn(Box<Stream>) + Send + Sync>;

/// 请求入口的抽象，会话层只依赖这一接口。
pub trait StreamSubmitter: Send + Sync {
    /// 投递一个请求；返回 `false` 时请求已被释放。
    fn submit(&self, stream: Box<Stream>) -> bool;
}

struct Ticker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Ticker {
    fn start(
        registry: Arc<Registry>,
        system: Arc<SystemExecutor>,
        config: &ProcessorConfig,
    ) -> Result<Self, RpcError> {
        let interval = config.update_config_interval();
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("spark-rpc-config-ticker".to_owned())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    for target in registry.lifecycle_targets(ON_UPDATE_CONFIG) {
                        // 失败已在系统执行器中记录，定时器继续运行。
                        let _ = system.run_lifecycle(&target);
                    }
                }
            })
            .map_err(|err| codes::KERNEL.with_message(format!("failed to spawn config ticker: {err}")))?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::error!("config ticker panicked");
        }
    }
}

/// RPC 处理器。
///
/// # 教案式说明
/// - **意图 (Why)**：应用代码只需提供服务定义与一个返回通道即可获得完整的请求处理能力；
/// - **契约 (What)**：
///   - 构建失败（配置非法、服务注册失败、线程无法创建）时返回 [`RpcError`]，已启动的执行器被关闭；
///   - `submit` 在处理器关闭后返回 `false` 并释放请求；
///   - `close` 幂等，首次调用的返回值表示是否所有处理函数都在期限内返回；
/// - **风险 (Trade-offs)**：`submit` 在全部执行器忙碌时让出时间片轮询等待，而不是立即失败。
pub struct Processor {
    config: ProcessorConfig,
    registry: Arc<Registry>,
    system: Arc<SystemExecutor>,
    pool: ExecutorPool,
    sink: ReturnSink,
    ticker: Mutex<Option<Ticker>>,
    running: AtomicBool,
    _panics: PanicSubscription,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        services: Vec<ServiceMeta>,
        dispatch_cache: Option<DispatchCache>,
        sink: ReturnSink,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let registry = Arc::new(Registry::new(config.max_node_depth, dispatch_cache)?);
        let system = Arc::new(SystemExecutor::new(ExecutorCore::new(
            usize::MAX,
            true,
            Arc::clone(&registry),
            config.max_call_depth,
            config.thread_buffer_size,
            config.debug,
        )));
        let pool = ExecutorPool::start(&config, &registry, &sink)?;

        for meta in services {
            let name = meta.name().to_owned();
            if let Err(err) = registry.mount(meta, system.as_ref()) {
                tracing::error!(service = %name, error = %err, "service registration failed");
                pool.close(config.close_timeout(), &sink);
                registry.unmount("#", system.as_ref());
                return Err(err);
            }
        }

        let ticker = match Ticker::start(Arc::clone(&registry), Arc::clone(&system), &config) {
            Ok(ticker) => ticker,
            Err(err) => {
                pool.close(config.close_timeout(), &sink);
                registry.unmount("#", system.as_ref());
                return Err(err);
            }
        };

        let panic_sink = Arc::clone(&sink);
        let panics = panic_hub::subscribe(move |err| {
            let mut report = Stream::new();
            write_error_body(&mut report, err);
            // 返回通道在此处 panic 时只记录日志，不再广播。
            if catch_unwind(AssertUnwindSafe(|| panic_sink(report))).is_err() {
                tracing::error!(code = err.code(), "return sink panicked on kernel report");
            }
        });

        tracing::info!(
            executors = pool.len(),
            services = registry.service_paths().len(),
            cached_kinds = registry.kinds().len(),
            "processor started"
        );
        Ok(Self {
            config,
            registry,
            system,
            pool,
            sink,
            ticker: Mutex::new(Some(ticker)),
            running: AtomicBool::new(true),
            _panics: panics,
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 投递请求；处理器已关闭时释放请求并返回 `false`。
    pub fn submit(&self, stream: Box<Stream>) -> bool {
        if !self.is_running() {
            stream.release();
            return false;
        }
        match self.pool.submit(stream) {
            Ok(()) => true,
            Err(stream) => {
                stream.release();
                false
            }
        }
    }

    /// 把当前动作表中出现过的全部 kind-string 生成为派发缓存源码，写入 `path`。
    ///
    /// 生成的模块导出 `dispatch_cache()`，其返回值可作为下一次构建处理器时的 `dispatch_cache` 参数。
    pub fn build_cache(&self, module: &str, path: impl AsRef<Path>) -> Result<(), RpcError> {
        let path = path.as_ref();
        let kinds = self.registry.kinds();
        let source = render_cache_module(module, &kinds);
        fs::write(path, source).map_err(|err| {
            codes::KERNEL.with_message(format!(
                "failed to write dispatch cache {}: {err}",
                path.display()
            ))
        })?;
        tracing::info!(module, path = %path.display(), kinds = kinds.len(), "dispatch cache written");
        Ok(())
    }

    /// 当前动作表中出现过的全部 kind-string，按字典序排列。
    pub fn kinds(&self) -> Vec<String> {
        self.registry.kinds()
    }

    pub fn action_stats(&self, path: &str) -> Option<ActionStats> {
        self.registry.stats(path)
    }

    /// 已挂载的服务路径，按字典序排列。
    pub fn service_paths(&self) -> Vec<String> {
        self.registry.service_paths()
    }

    /// 卸载 `prefix`（如 `#.user`）及其子服务，返回移除的服务数；`#` 卸载全部服务。
    pub fn unmount(&self, prefix: &str) -> usize {
        self.registry.unmount(prefix, self.system.as_ref())
    }

    /// 关闭处理器；有处理函数在关闭期限内未返回时返回 `false`，聚合报告已交给返回通道。
    pub fn close(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        let clean = self.pool.close(self.config.close_timeout(), &self.sink);
        let removed = self.registry.unmount("#", self.system.as_ref());
        tracing::info!(clean, removed, "processor closed");
        clean
    }
}

impl StreamSubmitter for Processor {
    fn submit(&self, stream: Box<Stream>) -> bool {
        Processor::submit(self, stream)
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if self.is_running() {
            self.close();
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("executors", &self.pool.len())
            .field("running", &self.is_running())
            .field("registry", &self.registry)
            .finish()
    }
}

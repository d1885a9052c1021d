use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::config::ProcessorConfig;
use crate::error::{RpcError, codes};
use crate::panic_hub;
use crate::processor::ReturnSink;
use crate::service::Registry;
use crate::wire::Stream;

use super::eval::{ExecutorCore, panic_message};
use super::frame::write_error_body;

/// 等待空闲执行器时的复查周期。
const IDLE_RECHECK: Duration = Duration::from_millis(50);

/// 分片的空闲执行器队列。
///
/// 取出时从 `read` 计数器指向的分片开始轮询，归还时放入 `write` 计数器指向的分片；
/// 分片已满则顺延到下一个分片，总容量等于执行器总数，因此归还总能成功。
/// 所有执行器都忙时，提交方在 `idle` 上睡眠，归还或关闭时被唤醒。
struct FreeQueues {
    groups: Vec<ArrayQueue<usize>>,
    read: AtomicUsize,
    write: AtomicUsize,
    gate: Mutex<()>,
    idle: Condvar,
}

impl FreeQueues {
    fn new(groups: usize, executors: usize) -> Self {
        let per_group = executors / groups;
        let queues: Vec<ArrayQueue<usize>> =
            (0..groups).map(|_| ArrayQueue::new(per_group)).collect();
        for index in 0..executors {
            let _ = queues[index % groups].push(index);
        }
        Self {
            groups: queues,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            gate: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    fn acquire(&self) -> Option<usize> {
        let start = self.read.fetch_add(1, Ordering::Relaxed);
        (0..self.groups.len()).find_map(|offset| self.groups[(start + offset) % self.groups.len()].pop())
    }

    /// 取出一个空闲执行器，必要时阻塞等待；`open()` 变为 `false` 后返回 `None`。
    fn acquire_blocking(&self, open: impl Fn() -> bool) -> Option<usize> {
        loop {
            if !open() {
                return None;
            }
            if let Some(index) = self.acquire() {
                return Some(index);
            }
            let mut guard = self.gate.lock();
            // 持锁复查：归还方先入队再取锁通知，通知不会落在复查与睡眠之间。
            if !open() {
                return None;
            }
            if let Some(index) = self.acquire() {
                return Some(index);
            }
            self.idle.wait_for(&mut guard, IDLE_RECHECK);
        }
    }

    fn release(&self, index: usize) {
        let mut slot = self.write.fetch_add(1, Ordering::Relaxed);
        let mut value = index;
        for _ in 0..self.groups.len() {
            match self.groups[slot % self.groups.len()].push(value) {
                Ok(()) => {
                    let _guard = self.gate.lock();
                    self.idle.notify_one();
                    return;
                }
                Err(rejected) => {
                    value = rejected;
                    slot += 1;
                }
            }
        }
        tracing::error!(executor = index, "free executor queues overflowed");
    }

    /// 唤醒全部等待者，让它们重新检查池是否仍在运行。
    fn wake_all(&self) {
        let _guard = self.gate.lock();
        self.idle.notify_all();
    }
}

struct Worker {
    core: Arc<ExecutorCore>,
    busy: Arc<AtomicBool>,
    input: Mutex<Option<SyncSender<Box<Stream>>>>,
    done: Mutex<Option<Receiver<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// 把响应交给返回通道；通道内部 panic 时转为内核错误广播。
fn deliver(sink: &ReturnSink, stream: Box<Stream>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink(stream))) {
        let err = codes::KERNEL_PANIC.with_message(format!(
            "panic while delivering response: {}",
            panic_message(payload.as_ref())
        ));
        panic_hub::publish(&err);
    }
}

/// 工作执行器池。
///
/// # 教案式说明
/// - **意图 (Why)**：每个执行器独占一个线程与一个竞技场，请求之间不共享可变状态；
/// - **契约 (What)**：
///   - 执行器数量为 [`ProcessorConfig::effective_threads`]，平均分布在 `free_groups` 个分片中；
///   - 每个执行器的输入通道容量为 1，只有空闲执行器会被选中，因此投递不会阻塞；
///   - 全部执行器都忙时 [`ExecutorPool::submit`] 在条件变量上等待，直到有执行器归还或池被关闭；
///   - 执行器完成一次求值后先投递响应，再把自己放回空闲队列；
/// - **执行 (How)**：关闭时丢弃所有输入端，工作线程处理完手头请求后退出并在完成通道上报到；
///   超过期限仍未报到、且手头确有请求的执行器按正在执行的动作路径聚合计数。
pub(crate) struct ExecutorPool {
    workers: Vec<Worker>,
    free: Arc<FreeQueues>,
    running: AtomicBool,
}

impl ExecutorPool {
    pub(crate) fn start(
        config: &ProcessorConfig,
        registry: &Arc<Registry>,
        sink: &ReturnSink,
    ) -> Result<Self, RpcError> {
        let executors = config.effective_threads();
        let free = Arc::new(FreeQueues::new(config.free_groups, executors));
        let mut workers = Vec::with_capacity(executors);
        for index in 0..executors {
            let core = Arc::new(ExecutorCore::new(
                index,
                false,
                Arc::clone(registry),
                config.max_call_depth,
                config.thread_buffer_size,
                config.debug,
            ));
            let (input_tx, input_rx) = mpsc::sync_channel::<Box<Stream>>(1);
            let (done_tx, done_rx) = mpsc::channel();
            let busy = Arc::new(AtomicBool::new(false));
            let worker_busy = Arc::clone(&busy);
            let worker_core = Arc::clone(&core);
            let worker_free = Arc::clone(&free);
            let worker_sink = Arc::clone(sink);
            let handle = thread::Builder::new()
                .name(format!("spark-rpc-worker-{index}"))
                .spawn(move || {
                    while let Ok(request) = input_rx.recv() {
                        worker_busy.store(true, Ordering::Release);
                        match catch_unwind(AssertUnwindSafe(|| worker_core.eval(request))) {
                            Ok(response) => deliver(&worker_sink, response),
                            Err(payload) => panic_hub::publish(&codes::KERNEL_PANIC.with_message(
                                format!("executor {index} panicked: {}", panic_message(payload.as_ref())),
                            )),
                        }
                        worker_busy.store(false, Ordering::Release);
                        worker_free.release(index);
                    }
                    let _ = done_tx.send(());
                })
                .map_err(|err| {
                    codes::KERNEL.with_message(format!("failed to spawn executor {index}: {err}"))
                })?;
            workers.push(Worker {
                core,
                busy,
                input: Mutex::new(Some(input_tx)),
                done: Mutex::new(Some(done_rx)),
                handle: Mutex::new(Some(handle)),
            });
        }
        tracing::debug!(executors, groups = config.free_groups, "executor pool started");
        Ok(Self {
            workers,
            free,
            running: AtomicBool::new(true),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// 把请求交给一个空闲执行器，全部忙碌时阻塞等待；池已关闭时原样退回请求。
    pub(crate) fn submit(&self, request: Box<Stream>) -> Result<(), Box<Stream>> {
        let Some(index) = self
            .free
            .acquire_blocking(|| self.running.load(Ordering::Acquire))
        else {
            return Err(request);
        };
        let input = self.workers[index].input.lock();
        let rejected = match input.as_ref() {
            Some(tx) => match tx.try_send(request) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(request) | TrySendError::Disconnected(request)) => request,
            },
            None => request,
        };
        drop(input);
        self.free.release(index);
        Err(rejected)
    }

    /// 关闭全部执行器；有处理函数在 `timeout` 内未返回时，把聚合报告交给 `sink` 并返回 `false`。
    pub(crate) fn close(&self, timeout: Duration, sink: &ReturnSink) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }
        self.free.wake_all();
        for worker in &self.workers {
            worker.input.lock().take();
        }

        let deadline = Instant::now() + timeout;
        let mut stuck: BTreeMap<String, usize> = BTreeMap::new();
        for worker in &self.workers {
            let Some(done) = worker.done.lock().take() else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if let Some(handle) = worker.handle.lock().take() {
                        let _ = handle.join();
                    }
                }
                // 空闲执行器的输入端已关闭，只是还没来得及报到，不计入未返回的动作。
                Err(RecvTimeoutError::Timeout) if !worker.busy.load(Ordering::Acquire) => {}
                Err(RecvTimeoutError::Timeout) => {
                    let path = worker
                        .core
                        .current_action()
                        .unwrap_or_else(|| "<unknown>".to_owned());
                    *stuck.entry(path).or_default() += 1;
                }
            }
        }
        if stuck.is_empty() {
            return true;
        }

        let detail = stuck
            .iter()
            .map(|(path, count)| format!("{path} ({count})"))
            .collect::<Vec<_>>()
            .join(", ");
        let err = codes::CLOSE_TIMEOUT
            .with_message(format!("{}: {detail}", codes::CLOSE_TIMEOUT.message()));
        tracing::error!(stuck = stuck.values().sum::<usize>(), error = %err, "executors stuck on close");
        let mut report = Stream::new();
        write_error_body(&mut report, &err);
        deliver(sink, report);
        false
    }
}

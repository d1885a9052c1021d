use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{RpcError, codes};
use crate::runtime::{Arena, Runtime};
use crate::service::{Action, DISPATCH_MISMATCH, Registry, ordinal};
use crate::wire::Stream;

use super::frame::{Frame, FrameStatus, write_error_body};

/// 令牌仍被旧句柄持有时，每轮等待的时长。
const PARK_RETRY: Duration = Duration::from_millis(10);

/// 执行器的可变状态：调用栈与竞技场。
pub(crate) struct ExecutorState {
    pub(crate) frames: Vec<Frame>,
    pub(crate) arena: Arena,
}

/// 单个执行器的求值核心。
///
/// # 教案式说明
/// - **意图 (Why)**：工作线程与系统执行器共用同一套求值逻辑，区别只在于能否调用 `$` 系统动作；
/// - **契约 (What)**：
///   - 同一时刻只有一个线程在某个核心上求值，嵌套调用在同一线程上重入；
///   - `token` 是调用句柄的锁字：等于某次调用的 `id` 时空闲，等于 `id + 1` 时被持有；
///   - `seq` 每次调用前进 2，分配出的 `id` 全部为偶数且互不相同；
/// - **执行 (How)**：请求解析、查找、深度校验之后压栈，派发在 `catch_unwind` 内进行，
///   结束时先把令牌推进到新值再出栈，保证旧句柄永久失效；
/// - **风险 (Trade-offs)**：处理函数把句柄交给其他线程并在返回后仍持有锁时，出栈会以
///   10ms 为周期等待其释放。
pub(crate) struct ExecutorCore {
    index: usize,
    system: bool,
    token: AtomicU64,
    seq: AtomicU64,
    registry: Arc<Registry>,
    max_call_depth: usize,
    debug: bool,
    state: Mutex<ExecutorState>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

impl ExecutorCore {
    pub(crate) fn new(
        index: usize,
        system: bool,
        registry: Arc<Registry>,
        max_call_depth: usize,
        buffer_size: usize,
        debug: bool,
    ) -> Self {
        Self {
            index,
            system,
            token: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            registry,
            max_call_depth,
            debug,
            state: Mutex::new(ExecutorState {
                frames: Vec::new(),
                arena: Arena::new(buffer_size),
            }),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock()
    }

    pub(crate) fn try_lock_token(&self, id: u64) -> bool {
        self.token
            .compare_exchange(id, id + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn store_token(&self, value: u64) {
        self.token.store(value, Ordering::Release);
    }

    fn next_id(&self) -> u64 {
        self.seq.fetch_add(2, Ordering::AcqRel) + 2
    }

    /// 正在执行的最内层动作路径；状态锁被占用时返回 `None`。
    pub(crate) fn current_action(&self) -> Option<String> {
        self.state
            .try_lock()
            .and_then(|state| state.frames.last().map(|frame| frame.action.path().to_owned()))
    }

    fn fail(&self, mut response: Box<Stream>, request: Box<Stream>, err: RpcError) -> Box<Stream> {
        tracing::debug!(executor = self.index, code = err.code(), error = %err, "request rejected");
        write_error_body(&mut response, &err);
        request.release();
        response
    }

    /// 求值一个请求，返回响应流；请求流在此被释放。
    pub(crate) fn eval(self: &Arc<Self>, mut request: Box<Stream>) -> Box<Stream> {
        let started = Instant::now();
        let mut response = Stream::new();
        response.copy_header_from(&request);
        request.set_read_pos_to_body_start();

        let path = match request.read_string() {
            Ok(path) => path,
            Err(err) => return self.fail(response, request, err.prefixed("target").into()),
        };
        let action = match self.registry.lookup(&path) {
            Some(action) if self.system || !action.is_system() => action,
            _ => {
                let err = codes::TARGET_NOT_EXIST.with_message(format!("target {path} does not exist"));
                return self.fail(response, request, err);
            }
        };
        let depth = request.depth();
        if usize::from(depth) >= self.max_call_depth {
            let err = codes::CALL_OVERFLOW.with_message(format!("call {path} level({depth}) overflows"));
            return self.fail(response, request, err);
        }
        let from = match request.read_string() {
            Ok(from) => from,
            Err(err) => return self.fail(response, request, err.prefixed("from").into()),
        };

        let id = self.next_id();
        self.store_token(id);
        self.state.lock().frames.push(Frame {
            id,
            depth,
            from,
            action: Arc::clone(&action),
            response,
            status: FrameStatus::Pending,
        });

        let rt = Runtime::new(id, Arc::clone(self));
        let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(&action, &rt, &mut request)));
        drop(rt);
        let synthesized = match outcome {
            Ok(0) => None,
            Ok(-1) => Some(codes::STREAM.with_message("stream error")),
            Ok(DISPATCH_MISMATCH) => Some(
                codes::KERNEL.with_message(format!("{path} handler does not match its signature")),
            ),
            Ok(index) => Some(self.mismatch_error(&action, index, &request)),
            Err(payload) => Some(self.panic_error(&action, payload.as_ref())),
        };
        request.release();

        self.park(id);
        let (mut response, status) = {
            let mut state = self.state.lock();
            let frame = match state.frames.iter().rposition(|frame| frame.id == id) {
                Some(at) => state.frames.remove(at),
                None => {
                    // 栈帧只会由本函数弹出。
                    drop(state);
                    let err = codes::KERNEL.with_message(format!("frame of {path} is lost"));
                    crate::panic_hub::publish(&err);
                    let mut response = Stream::new();
                    write_error_body(&mut response, &err);
                    return response;
                }
            };
            if state.frames.is_empty() {
                state.arena.reset();
            }
            let Frame {
                response, status, ..
            } = frame;
            (response, status)
        };

        let success = match (synthesized, status) {
            (Some(err), _) => {
                write_error_body(&mut response, &err);
                false
            }
            (None, FrameStatus::Pending) => {
                let mut err = codes::RUNTIME_EXTERNAL_RETURN
                    .with_message(format!("{path}: {}", codes::RUNTIME_EXTERNAL_RETURN.message()));
                if self.debug {
                    err = err.add_debug(action.site());
                }
                write_error_body(&mut response, &err);
                false
            }
            (None, status) => status == FrameStatus::Ok,
        };

        let elapsed = started.elapsed();
        action.perf().record(elapsed, success);
        tracing::trace!(
            executor = self.index,
            action = %path,
            elapsed_ms = elapsed.as_millis() as u64,
            success,
            "action evaluated"
        );
        response
    }

    /// 把令牌从 `id` 推进到一个从未分配过的值；旧句柄仍持锁时循环等待。
    fn park(&self, id: u64) {
        let fresh = self.next_id();
        while self
            .token
            .compare_exchange(id, fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(executor = self.index, "runtime handle still locked after return, waiting");
            thread::sleep(PARK_RETRY);
        }
    }

    fn mismatch_error(&self, action: &Action, index: i32, request: &Stream) -> RpcError {
        // 第 n 个业务参数；`Runtime` 计为第 1 个参数。
        let n = usize::try_from(index).unwrap_or_default().max(1);
        let expected = action
            .handler()
            .arg_kinds()
            .get(n - 1)
            .map_or("<none>", |kind| kind.type_name());
        let position = n + 1;
        let mut err = codes::ARGUMENTS_NOT_MATCH.with_message(format!(
            "{} {} argument does not match: want {expected}, got {}",
            action.path(),
            ordinal(position),
            request.peek_type_name()
        ));
        if self.debug {
            err = err.add_debug(action.site());
        }
        err
    }

    fn panic_error(&self, action: &Action, payload: &(dyn Any + Send)) -> RpcError {
        let message = panic_message(payload);
        tracing::error!(executor = self.index, action = %action.path(), panic = %message, "action panicked");
        let mut err = codes::ACTION_PANIC.with_message(format!("{} panic: {message}", action.path()));
        if self.debug {
            err = err
                .add_debug(action.site())
                .add_debug(Backtrace::force_capture());
        }
        err
    }
}

/// 优先走缓存派发；缓存函数与处理函数类型不符时回退到默认路径。
fn dispatch(action: &Action, rt: &Runtime, request: &mut Stream) -> i32 {
    let handler = action.handler();
    if let Some(cached) = action.cached() {
        let code = cached(rt, request, handler.typed());
        if code != DISPATCH_MISMATCH {
            return code;
        }
    }
    handler.invoke_reflective(rt, request)
}

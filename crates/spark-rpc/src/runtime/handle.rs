use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::error::{RpcError, codes};
use crate::executor::{ExecutorCore, ExecutorState, Frame, FrameStatus, write_error_body};
use crate::panic_hub;
use crate::service::ServiceData;
use crate::wire::{Stream, Value};

use super::{ActionFailure, Arena, ArenaWriter, RTArray, RTMap, RTValue};

/// 处理函数的返回标记。
///
/// 只能由 [`Runtime::ok`] 或 [`Runtime::error`] 产生，处理函数的签名因此强制要求二者之一被调用过；
/// 真正的结果已经写进响应流，标记本身不携带数据。
#[must_use = "return the value produced by Runtime::ok or Runtime::error from the handler"]
#[derive(Debug)]
pub struct Return {
    _sealed: (),
}

impl Return {
    fn new() -> Self {
        Self { _sealed: () }
    }
}

/// 绑定到某个执行器上某一次调用的能力令牌。
///
/// # 教案式说明
/// - **意图 (Why)**：处理函数不直接接触执行器，所有副作用都经由令牌校验后的句柄完成；
/// - **契约 (What)**：
///   - 克隆得到的句柄共享同一个调用 `id`，调用结束后全部失效；
///   - 失效句柄上的 `ok`/`error` 只记录误用并经由 [`panic_hub`] 广播，其余操作返回
///     [`codes::RUNTIME_ILLEGAL`]；
/// - **执行 (How)**：加锁为一次 `token: id → id + 1` 的 CAS，守卫析构时写回 `id`；
///   嵌套调用期间令牌先被子调用占用，返回后再由本句柄恢复。
#[derive(Clone)]
pub struct Runtime {
    id: u64,
    core: Arc<ExecutorCore>,
}

struct TokenGuard<'a> {
    core: &'a ExecutorCore,
    id: u64,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.core.store_token(self.id);
    }
}

fn illegal() -> RpcError {
    codes::RUNTIME_ILLEGAL.error()
}

impl Runtime {
    pub(crate) fn new(id: u64, core: Arc<ExecutorCore>) -> Self {
        Self { id, core }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn core(&self) -> &Arc<ExecutorCore> {
        &self.core
    }

    fn lock(&self) -> Option<TokenGuard<'_>> {
        self.core.try_lock_token(self.id).then(|| TokenGuard {
            core: &self.core,
            id: self.id,
        })
    }

    /// 持有令牌锁与执行器状态锁执行 `f`。
    pub(crate) fn with_state<T>(
        &self,
        f: impl FnOnce(&mut ExecutorState) -> Result<T, RpcError>,
    ) -> Result<T, RpcError> {
        let _guard = self.lock().ok_or_else(illegal)?;
        let mut state = self.core.state();
        f(&mut state)
    }

    pub(crate) fn with_arena<T>(
        &self,
        f: impl FnOnce(&mut Arena) -> Result<T, RpcError>,
    ) -> Result<T, RpcError> {
        self.with_state(|state| f(&mut state.arena))
    }

    fn with_frame<T>(
        &self,
        f: impl FnOnce(&mut Frame, &mut Arena) -> Result<T, RpcError>,
    ) -> Result<T, RpcError> {
        self.with_state(|state| {
            let ExecutorState { frames, arena } = state;
            let frame = frames
                .iter_mut()
                .rev()
                .find(|frame| frame.id == self.id)
                .ok_or_else(illegal)?;
            f(frame, arena)
        })
    }

    fn report_misuse(&self, err: RpcError) {
        tracing::error!(
            executor = self.core.index(),
            code = err.code(),
            error = %err,
            "runtime handle misused"
        );
        panic_hub::publish(&err);
    }

    /// 以成功结果结束本次调用：响应体写入 `0` 与 `value`。
    ///
    /// `value` 无法编码（例如引用了其他调用的运行时视图）时，响应改写为
    /// [`codes::UNSUPPORTED_VALUE`] 错误。
    pub fn ok(&self, value: impl Into<Value>) -> Return {
        let value = value.into();
        let result = self.with_frame(|frame, arena| {
            frame.check_pending()?;
            frame.response.set_write_pos_to_body_start();
            frame.response.write_uint64(0);
            let writer = ArenaWriter::new(arena, self);
            match frame.response.write_value_with(&value, &writer) {
                Ok(()) => frame.status = FrameStatus::Ok,
                Err(err) => {
                    write_error_body(&mut frame.response, &RpcError::from(err));
                    frame.status = FrameStatus::Error;
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            self.report_misuse(err);
        }
        Return::new()
    }

    /// 以错误结束本次调用。调试模式下消息末尾追加调用位置。
    #[track_caller]
    pub fn error(&self, failure: impl Into<ActionFailure>) -> Return {
        let location = Location::caller();
        let mut err = failure.into().into_rpc_error();
        if self.core.is_debug() {
            err = err.add_debug(format_args!("{}:{}", location.file(), location.line()));
        }
        let result = self.with_frame(|frame, _| {
            frame.check_pending()?;
            write_error_body(&mut frame.response, &err);
            frame.status = FrameStatus::Error;
            Ok(())
        });
        if let Err(misuse) = result {
            self.report_misuse(misuse);
        }
        Return::new()
    }

    /// 在当前执行器上同步调用另一个动作。
    ///
    /// 子请求的深度为当前深度加一，`from` 为当前动作路径；子调用的错误以
    /// [`RTValue::err`] 返回，成功值被搬进竞技场。
    pub fn call(&self, target: &str, args: &[Value]) -> RTValue {
        let request = self.with_frame(|frame, arena| {
            let mut request = Stream::new();
            request.copy_header_from(&frame.response);
            request.set_depth(frame.depth.saturating_add(1));
            let writer = ArenaWriter::new(arena, self);
            let written = request
                .write_string(target)
                .and_then(|()| request.write_string(frame.action.path()))
                .and_then(|()| {
                    for (index, arg) in args.iter().enumerate() {
                        request
                            .write_value_with(arg, &writer)
                            .map_err(|err| err.prefixed(&format!("[{index}]")))?;
                    }
                    Ok(())
                });
            match written {
                Ok(()) => Ok(request),
                Err(err) => {
                    request.release();
                    Err(RpcError::from(err))
                }
            }
        });
        let request = match request {
            Ok(request) => request,
            Err(err) => return RTValue::failed(self.clone(), err),
        };

        let mut response = self.core.eval(request);

        // 子调用已把令牌推进到新值，这里直接以加锁态接管，解析完毕再释放。
        self.core.store_token(self.id + 1);
        let _guard = TokenGuard {
            core: &self.core,
            id: self.id,
        };
        let result = self.parse_response(&mut response);
        response.release();
        result
    }

    fn parse_response(&self, response: &mut Stream) -> RTValue {
        response.set_read_pos_to_body_start();
        let code = match response.read_uint64() {
            Ok(code) => code,
            Err(err) => return RTValue::failed(self.clone(), err.into()),
        };
        if code != 0 {
            let message = response.read_string().unwrap_or_default();
            return RTValue::failed(self.clone(), RpcError::new(code, message));
        }
        let imported = self.core.state().arena.import_next(response);
        match imported {
            Ok(pos) => RTValue::new(self.clone(), pos),
            Err(err) => RTValue::failed(self.clone(), err.into()),
        }
    }

    /// 当前动作所属服务的数据句柄。
    pub fn service_data(&self) -> Result<ServiceData, RpcError> {
        self.with_frame(|frame, _| Ok(frame.action.service_data().clone()))
    }

    /// 在竞技场中创建空数组，`cap` 为预留槽位数。
    pub fn new_rt_array(&self, cap: usize) -> Result<RTArray, RpcError> {
        let index = self.with_arena(|arena| Ok(arena.new_array(cap)))?;
        Ok(RTArray::new(self.clone(), index))
    }

    pub fn new_rt_map(&self, cap: usize) -> Result<RTMap, RpcError> {
        let index = self.with_arena(|arena| Ok(arena.new_map(cap)))?;
        Ok(RTMap::new(self.clone(), index))
    }

    /// 发起本次调用的动作路径；顶层请求为客户端填写的调用链标记。
    pub fn caller(&self) -> Result<String, RpcError> {
        self.with_frame(|frame, _| Ok(frame.from.clone()))
    }

    pub fn depth(&self) -> Result<u16, RpcError> {
        self.with_frame(|frame, _| Ok(frame.depth))
    }

    pub fn action_path(&self) -> Result<String, RpcError> {
        self.with_frame(|frame, _| Ok(frame.action.path().to_owned()))
    }
}

impl PartialEq for Runtime {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.core, &other.core)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("executor", &self.core.index())
            .finish()
    }
}

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RpcError;
use crate::service::LifecycleRunner;
use crate::wire::Stream;

use super::eval::ExecutorCore;

/// 系统动作的调用方标记。
const SYSTEM_CALLER: &str = "#";

/// 专用于 `$onMount`/`$onUnmount`/`$onUpdateConfig` 的系统执行器，不进入空闲队列。
///
/// 挂载线程与配置更新线程都可能触发生命周期动作，`serial` 保证同一时刻只有一个求值在进行。
pub(crate) struct SystemExecutor {
    core: Arc<ExecutorCore>,
    serial: Mutex<()>,
}

impl SystemExecutor {
    pub(crate) fn new(core: ExecutorCore) -> Self {
        Self {
            core: Arc::new(core),
            serial: Mutex::new(()),
        }
    }
}

impl LifecycleRunner for SystemExecutor {
    fn run_lifecycle(&self, path: &str) -> Result<(), RpcError> {
        let mut request = Stream::new();
        let written = request
            .write_string(path)
            .and_then(|()| request.write_string(SYSTEM_CALLER));
        if let Err(err) = written {
            request.release();
            return Err(err.into());
        }

        let mut response = {
            let _serial = self.serial.lock();
            self.core.eval(request)
        };
        response.set_read_pos_to_body_start();
        let result = match response.read_uint64() {
            Ok(0) => Ok(()),
            Ok(code) => Err(RpcError::new(code, response.read_string().unwrap_or_default())),
            Err(err) => Err(err.into()),
        };
        response.release();
        if let Err(err) = &result {
            tracing::warn!(action = %path, error = %err, "lifecycle action failed");
        }
        result
    }
}

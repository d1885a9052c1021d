//! 集成测试共用的处理器夹具。
//!
//! ## 设计意图（Why）
//! - 处理器的响应经由返回通道异步送达，测试需要按 `callback_id` 取回对应响应；
//! - 内核错误广播是进程级的，同一测试二进制中的其他处理器也会收到 `callback_id == 0` 的报告，
//!   因此取响应时必须按编号或错误码过滤，未命中的流暂存起来留给后续断言。
#![allow(dead_code)]

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use spark_rpc::{
    DispatchCache, ErrorDef, Processor, ProcessorConfig, ReturnSink, RpcError, ServiceMeta, Stream,
    Value,
};

/// 单次等待的上限；超时说明响应丢失。
pub const WAIT: Duration = Duration::from_secs(5);

/// 小规模配置：两个执行器、两个空闲分组，足以覆盖嵌套与并发场景。
pub fn small_config() -> ProcessorConfig {
    ProcessorConfig {
        num_of_threads: 2,
        free_groups: 2,
        max_call_depth: 8,
        max_node_depth: 8,
        close_timeout_ms: 1_000,
        update_config_interval_ms: 60_000,
        ..ProcessorConfig::default()
    }
}

/// 解码后的响应正文。
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ok(Value),
    Err { code: u64, message: String },
}

impl Reply {
    pub fn value(self) -> Value {
        match self {
            Reply::Ok(value) => value,
            Reply::Err { code, message } => panic!("期望成功响应，实际为错误 {code}: {message}"),
        }
    }

    pub fn error(self) -> (u64, String) {
        match self {
            Reply::Err { code, message } => (code, message),
            Reply::Ok(value) => panic!("期望错误响应，实际为成功值 {value:?}"),
        }
    }
}

/// 从正文起点解码 `code` 与后续值或消息。
pub fn decode_reply(stream: &mut Stream) -> Reply {
    stream.set_read_pos_to_body_start();
    let code = stream.read_uint64().expect("响应正文应以码值开头");
    if code == 0 {
        Reply::Ok(stream.read_value().expect("成功响应应携带一个值"))
    } else {
        Reply::Err {
            code,
            message: stream.read_string().expect("错误响应应携带消息"),
        }
    }
}

/// 构造请求：目标路径、调用链标记与参数依次写入正文。
pub fn request(callback_id: u64, target: &str, args: &[Value]) -> Box<Stream> {
    let mut stream = Stream::new();
    stream.set_callback_id(callback_id);
    stream.write_string(target).expect("目标路径应当可编码");
    stream.write_string("").expect("调用链标记应当可编码");
    for arg in args {
        stream.write_value(arg).expect("参数应当可编码");
    }
    stream
}

/// 构造参数区为原始字节的请求，用于投递编码器写不出来的残缺值。
pub fn raw_request(callback_id: u64, target: &str, raw_args: &[u8]) -> Box<Stream> {
    let head = request(callback_id, target, &[]);
    let mut frame = head.to_bytes();
    head.release();
    frame.extend_from_slice(raw_args);
    Stream::from_frame(&frame).expect("帧应当包含完整头部")
}

/// 把返回通道接到一个 mpsc 通道上，按需取回响应与内核报告。
pub struct Responses {
    rx: Receiver<Box<Stream>>,
    backlog: RefCell<Vec<Box<Stream>>>,
}

impl Responses {
    pub fn sink() -> (ReturnSink, Self) {
        let (tx, rx) = mpsc::channel::<Box<Stream>>();
        let sink: ReturnSink = Arc::new(move |stream: Box<Stream>| {
            if let Err(mpsc::SendError(stream)) = tx.send(stream) {
                stream.release();
            }
        });
        let responses = Self {
            rx,
            backlog: RefCell::new(Vec::new()),
        };
        (sink, responses)
    }

    fn take_matching(&self, mut pred: impl FnMut(&mut Stream) -> bool) -> Option<Box<Stream>> {
        let mut backlog = self.backlog.borrow_mut();
        let at = backlog.iter_mut().position(|stream| pred(stream))?;
        Some(backlog.remove(at))
    }

    fn wait_for(&self, mut pred: impl FnMut(&mut Stream) -> bool) -> Box<Stream> {
        if let Some(found) = self.take_matching(&mut pred) {
            return found;
        }
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut stream = self.rx.recv_timeout(remaining).expect("等待响应超时");
            if pred(&mut stream) {
                return stream;
            }
            self.backlog.borrow_mut().push(stream);
        }
    }

    /// 等待 `callback_id` 对应的原始响应流，调用方负责释放。
    pub fn stream(&self, callback_id: u64) -> Box<Stream> {
        self.wait_for(|stream| stream.callback_id() == callback_id)
    }

    /// 等待 `callback_id` 对应的响应并解码。
    pub fn reply(&self, callback_id: u64) -> Reply {
        let mut stream = self.stream(callback_id);
        let reply = decode_reply(&mut stream);
        stream.release();
        reply
    }

    /// 等待一条错误码为 `def`、消息包含 `needle` 的内核报告。
    ///
    /// 报告是进程级广播，并行运行的其他测试也会产生同码报告，因此同时按消息过滤。
    pub fn report(&self, def: &ErrorDef, needle: &str) -> RpcError {
        let mut stream = self.wait_for(|stream| {
            stream.callback_id() == 0
                && matches!(
                    decode_reply(stream),
                    Reply::Err { code, message } if code == def.code() && message.contains(needle)
                )
        });
        let (code, message) = decode_reply(&mut stream).error();
        stream.release();
        RpcError::new(code, message)
    }
}

/// 处理器与其返回通道的组合。
pub struct Harness {
    pub processor: Processor,
    pub responses: Responses,
}

impl Harness {
    pub fn start(services: Vec<ServiceMeta>) -> Self {
        Self::start_with(small_config(), services, None).expect("处理器应当启动")
    }

    pub fn start_with(
        config: ProcessorConfig,
        services: Vec<ServiceMeta>,
        cache: Option<DispatchCache>,
    ) -> Result<Self, RpcError> {
        let (sink, responses) = Responses::sink();
        let processor = Processor::new(config, services, cache, sink)?;
        Ok(Self {
            processor,
            responses,
        })
    }

    /// 提交请求并同步等待其响应。
    pub fn call(&self, callback_id: u64, target: &str, args: &[Value]) -> Reply {
        assert!(
            self.processor.submit(request(callback_id, target, args)),
            "处理器运行中应当接受请求"
        );
        self.responses.reply(callback_id)
    }
}

//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 定义线上唯一可见的错误形态 [`RpcError`]：一个打包的 `u64` 错误码加一段消息；
//! - 在 [`codes`] 中集中登记所有稳定的错误定义，调用方与日志检索都以此为准。
//!
//! ## 编码约定（What）
//! - `code = kind << 40 | level << 32 | number`，任何错误码都非零，响应中 `0` 专指成功；
//! - `kind` 对应错误类别（流、协议、运行时、动作、内核、配置……），`level` 为 Warn/Error/Fatal；
//! - 调试模式下消息末尾追加 `\n<file>:<line>`，发布模式只传输码与消息。
//!
//! ## 扩展建议（How）
//! - 新增错误时在 [`codes`] 中追加常量，`number` 全局唯一且不复用；
//! - 下层错误（如 [`StreamError`]、[`ConfigError`](crate::config::ConfigError)）通过 `From` 转换后用 `?` 传播。

use std::fmt;

use thiserror::Error;

use crate::wire::StreamError;

/// 错误类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    Protocol = 1,
    Transport = 2,
    Action = 3,
    ActionPanic = 4,
    Runtime = 5,
    Kernel = 6,
    KernelPanic = 7,
    Config = 8,
    Stream = 9,
    Security = 10,
}

impl ErrorKind {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Protocol,
            2 => Self::Transport,
            3 => Self::Action,
            4 => Self::ActionPanic,
            5 => Self::Runtime,
            6 => Self::Kernel,
            7 => Self::KernelPanic,
            8 => Self::Config,
            9 => Self::Stream,
            10 => Self::Security,
            _ => return None,
        })
    }
}

/// 错误严重级别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ErrorLevel {
    Warn = 1,
    Error = 2,
    Fatal = 3,
}

impl ErrorLevel {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Warn,
            2 => Self::Error,
            3 => Self::Fatal,
            _ => return None,
        })
    }
}

/// 一条稳定的错误定义。
///
/// # 教案式说明
/// - **意图 (Why)**：让同一类错误在任何模块中产生相同的码值，便于客户端按码分支；
/// - **契约 (What)**：`number` 在进程内唯一；`message` 为默认消息，
///   具体场景可通过 [`ErrorDef::with_message`] 替换为带上下文的描述。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorDef {
    number: u32,
    kind: ErrorKind,
    level: ErrorLevel,
    message: &'static str,
}

impl ErrorDef {
    pub const fn new(number: u32, kind: ErrorKind, level: ErrorLevel, message: &'static str) -> Self {
        Self {
            number,
            kind,
            level,
            message,
        }
    }

    pub const fn code(&self) -> u64 {
        ((self.kind as u64) << 40) | ((self.level as u64) << 32) | self.number as u64
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub const fn level(&self) -> ErrorLevel {
        self.level
    }

    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 以默认消息构造错误。
    pub fn error(&self) -> RpcError {
        RpcError::new(self.code(), self.message)
    }

    pub fn with_message(&self, message: impl Into<String>) -> RpcError {
        RpcError::new(self.code(), message)
    }
}

/// 线上可见的错误：打包错误码 + 消息。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct RpcError {
    code: u64,
    message: String,
}

impl RpcError {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u64 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_u8((self.code >> 40) as u8)
    }

    pub fn level(&self) -> Option<ErrorLevel> {
        ErrorLevel::from_u8((self.code >> 32) as u8)
    }

    pub fn number(&self) -> u32 {
        self.code as u32
    }

    /// 判断是否由某条错误定义产生。
    pub fn is(&self, def: &ErrorDef) -> bool {
        self.code == def.code()
    }

    /// 在消息末尾追加一行调试信息（通常是 `file:line` 或调用栈）。
    pub fn add_debug(mut self, debug: impl fmt::Display) -> Self {
        use fmt::Write as _;
        let _ = write!(self.message, "\n{debug}");
        self
    }
}

impl From<StreamError> for RpcError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Unsupported { .. } => codes::UNSUPPORTED_VALUE.with_message(err.to_string()),
            StreamError::FrameTooLarge { .. } => codes::TRANSPORT_LIMIT.with_message(err.to_string()),
            other => codes::STREAM.with_message(format!("stream error: {other}")),
        }
    }
}

/// 稳定错误定义表。
///
/// 码值按类别分段登记：1x 流与传输、2x 协议、3x 运行时、4x 动作、5x 内核、6x 配置、7x 安全。
pub mod codes {
    use super::{ErrorDef, ErrorKind::*, ErrorLevel::*};

    /// 流格式错误；尾部存在多余字节时也使用该定义。
    pub const STREAM: ErrorDef = ErrorDef::new(10, Stream, Fatal, "stream error");
    /// 值无法写入流（类型不受支持或运行时视图越权）。
    pub const UNSUPPORTED_VALUE: ErrorDef = ErrorDef::new(11, Stream, Error, "unsupported value");
    /// 帧长度超过协商的传输上限。
    pub const TRANSPORT_LIMIT: ErrorDef =
        ErrorDef::new(12, Transport, Warn, "stream length exceeds transport limit");
    /// 适配器回报的连接错误。
    pub const TRANSPORT_CONN: ErrorDef = ErrorDef::new(13, Transport, Warn, "connection error");

    pub const TARGET_NOT_EXIST: ErrorDef =
        ErrorDef::new(20, Protocol, Warn, "target does not exist");
    pub const CALL_OVERFLOW: ErrorDef = ErrorDef::new(21, Protocol, Warn, "call level overflows");
    pub const ARGUMENTS_NOT_MATCH: ErrorDef =
        ErrorDef::new(22, Protocol, Warn, "arguments do not match");
    /// 控制帧种类未知或字段缺失。
    pub const BAD_CONTROL_STREAM: ErrorDef =
        ErrorDef::new(23, Protocol, Warn, "control stream is illegal");
    /// 处理器已关闭，请求无法投递。
    pub const PROCESSOR_CLOSED: ErrorDef = ErrorDef::new(24, Protocol, Warn, "processor is closed");

    pub const RUNTIME_ILLEGAL: ErrorDef =
        ErrorDef::new(30, Runtime, Fatal, "Runtime is illegal in current thread");
    pub const RUNTIME_NIL_ERROR: ErrorDef =
        ErrorDef::new(31, Runtime, Error, "nil error argument");
    pub const RUNTIME_OK_CALLED: ErrorDef =
        ErrorDef::new(32, Runtime, Error, "Runtime.ok has been called before");
    pub const RUNTIME_ERROR_CALLED: ErrorDef =
        ErrorDef::new(33, Runtime, Error, "Runtime.error has been called before");
    pub const RUNTIME_EXTERNAL_RETURN: ErrorDef = ErrorDef::new(
        34,
        Runtime,
        Error,
        "action returned without calling Runtime.ok or Runtime.error",
    );
    pub const RUNTIME_ARRAY_INDEX: ErrorDef =
        ErrorDef::new(35, Runtime, Warn, "RTArray index is out of range");
    pub const RUNTIME_MAP_KEY: ErrorDef =
        ErrorDef::new(36, Runtime, Warn, "RTMap key does not exist");
    pub const RUNTIME_TYPE_MISMATCH: ErrorDef =
        ErrorDef::new(37, Runtime, Warn, "RTValue type does not match");

    /// 处理函数通过普通错误对象报告的失败。
    pub const ACTION: ErrorDef = ErrorDef::new(40, Action, Warn, "action error");
    pub const ACTION_PANIC: ErrorDef = ErrorDef::new(41, ActionPanic, Fatal, "action panic");

    pub const KERNEL: ErrorDef = ErrorDef::new(50, Kernel, Fatal, "kernel error");
    pub const KERNEL_PANIC: ErrorDef = ErrorDef::new(51, KernelPanic, Fatal, "kernel panic");
    /// 关闭时仍有处理函数未返回。
    pub const CLOSE_TIMEOUT: ErrorDef =
        ErrorDef::new(52, Kernel, Fatal, "actions did not return before close timeout");

    /// 服务注册失败：名称、深度、重复定义、签名等。
    pub const SERVICE_CONFIG: ErrorDef = ErrorDef::new(60, Config, Error, "service config error");
    /// 配置文件解析或校验失败。
    pub const CONFIG_INVALID: ErrorDef = ErrorDef::new(61, Config, Error, "config is invalid");

    pub const SECURITY_CONFIG_CHANGED: ErrorDef =
        ErrorDef::new(70, Security, Warn, "config changed");
    pub const SECURITY_ILLEGAL_SESSION: ErrorDef =
        ErrorDef::new(71, Security, Warn, "session token is illegal");
}

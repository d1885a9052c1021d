use thiserror::Error;

/// 流编解码错误。
///
/// # 教案式说明
/// - **意图 (Why)**：区分截断、非法操作码、UTF-8 校验失败等原因，供评估器决定合成何种响应；
/// - **契约 (What)**：写入类变体携带失败路径（如 `[3]`、`["k"]`），嵌套写入逐层回溯时通过
///   [`StreamError::prefixed`] 在路径前补齐外层下标；
/// - **风险 (Trade-offs)**：路径以 `String` 保存，仅在失败路径上分配。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is truncated")]
    Truncated,

    #[error("opcode {0} is invalid")]
    InvalidOpcode(u8),

    #[error("type mismatch: want {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("string is not valid utf-8")]
    InvalidUtf8,

    #[error("string is not terminated by NUL")]
    MissingNul,

    #[error("length field is malformed")]
    BadLength,

    #[error("nesting depth exceeds {0}")]
    ReadOverflow(usize),

    #[error("position {0} is out of range")]
    OutOfRange(usize),

    #[error("write overflow at value{path}")]
    WriteOverflow { path: String },

    #[error("length {len} at value{path} does not fit in 32 bits")]
    LengthOverflow { path: String, len: usize },

    #[error("value{path} is not supported: {reason}")]
    Unsupported { path: String, reason: String },

    #[error("frame size {size} exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("frame size {0} is shorter than the stream header")]
    FrameTooShort(usize),
}

impl StreamError {
    /// 在写入路径前补一段外层下标；读取类错误原样返回。
    pub(crate) fn prefixed(self, segment: &str) -> Self {
        match self {
            Self::WriteOverflow { path } => Self::WriteOverflow {
                path: format!("{segment}{path}"),
            },
            Self::LengthOverflow { path, len } => Self::LengthOverflow {
                path: format!("{segment}{path}"),
                len,
            },
            Self::Unsupported { path, reason } => Self::Unsupported {
                path: format!("{segment}{path}"),
                reason,
            },
            other => other,
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            path: String::new(),
            reason: reason.into(),
        }
    }

    /// 写入失败时指向的值路径；读取类错误返回 `None`。
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::WriteOverflow { path }
            | Self::LengthOverflow { path, .. }
            | Self::Unsupported { path, .. } => Some(path),
            _ => None,
        }
    }
}

//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 处理器与会话层的全部可调参数集中在此，既可在代码中构造，也可从 TOML 文件加载；
//! - 所有字段均带默认值，配置文件只需写出与默认值不同的部分。
//!
//! ## 契约（What）
//! - 时间类参数以毫秒配置（`*_ms` 字段），通过同名访问器以 [`Duration`] 暴露；
//! - [`ServerConfig::validate`] 拒绝零线程、零通道、零调用深度、零空闲分组等无法运行的组合；
//! - 文件格式：
//!
//! ```toml
//! [processor]
//! num_of_threads = 64
//! free_groups = 16
//!
//! [session]
//! num_of_channels = 32
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{RpcError, codes};

/// 配置加载与校验错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("config field `{field}` is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<ConfigError> for RpcError {
    fn from(err: ConfigError) -> Self {
        codes::CONFIG_INVALID.with_message(err.to_string())
    }
}

/// 执行器池与服务树参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// 工作执行器数量，构建时向上取整到 `free_groups` 的整数倍。
    pub num_of_threads: usize,
    /// 空闲执行器队列的分片数。
    pub free_groups: usize,
    /// 服务树最大深度（根节点 `#` 为 0）。
    pub max_node_depth: usize,
    /// 最大嵌套调用层数。
    pub max_call_depth: usize,
    /// 每个执行器竞技场流的预估字节数，槽位容量为其 1/16。
    pub thread_buffer_size: usize,
    pub close_timeout_ms: u64,
    /// 向所有服务派发 `$onUpdateConfig` 的周期。
    pub update_config_interval_ms: u64,
    /// 调试模式：错误消息附带源码位置与调用栈。
    pub debug: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            num_of_threads: 1024,
            free_groups: 1024,
            max_node_depth: 128,
            max_call_depth: 128,
            thread_buffer_size: 64 * 1024,
            close_timeout_ms: 5_000,
            update_config_interval_ms: 1_000,
            debug: false,
        }
    }
}

impl ProcessorConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn update_config_interval(&self) -> Duration {
        Duration::from_millis(self.update_config_interval_ms)
    }

    /// 向上取整后的实际执行器数量。
    pub fn effective_threads(&self) -> usize {
        self.num_of_threads.div_ceil(self.free_groups) * self.free_groups
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_of_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "num_of_threads",
                reason: "must be greater than 0",
            });
        }
        if self.free_groups == 0 {
            return Err(ConfigError::Invalid {
                field: "free_groups",
                reason: "must be greater than 0",
            });
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_call_depth",
                reason: "must be greater than 0",
            });
        }
        if self.max_node_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_node_depth",
                reason: "must be greater than 0",
            });
        }
        if self.update_config_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "update_config_interval_ms",
                reason: "must be greater than 0",
            });
        }
        Ok(())
    }
}

/// 会话与通道参数，连接握手时原样下发给客户端。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub num_of_channels: usize,
    /// 单帧最大字节数（含头部）。
    pub trans_limit: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub request_interval_ms: u64,
    /// 通道缓存回复的存活时间。
    pub cache_timeout_ms: u64,
    /// 断线会话保留多久后被清除。
    pub session_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_of_channels: 32,
            trans_limit: 4 * 1024 * 1024,
            heartbeat_interval_ms: 4_000,
            heartbeat_timeout_ms: 8_000,
            request_interval_ms: 2_000,
            cache_timeout_ms: 10_000,
            session_timeout_ms: 120_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_of_channels == 0 {
            return Err(ConfigError::Invalid {
                field: "num_of_channels",
                reason: "must be greater than 0",
            });
        }
        if self.trans_limit < crate::wire::STREAM_HEAD_SIZE {
            return Err(ConfigError::Invalid {
                field: "trans_limit",
                reason: "must hold at least the stream header",
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sweep_interval_ms",
                reason: "must be greater than 0",
            });
        }
        Ok(())
    }
}

/// 服务端整体配置：`[processor]` 与 `[session]` 两张表。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub processor: ProcessorConfig,
    pub session: SessionConfig,
}

impl ServerConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.processor.validate()?;
        self.session.validate()
    }
}

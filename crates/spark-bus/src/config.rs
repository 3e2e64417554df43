//! 子系统配置。
//!
//! ## 契约（What）
//! - [`BusConfig`] 可由 TOML 文本或文件加载，缺省字段取默认值，未知字段直接拒绝；
//! - [`BusConfig::validate`] 在加载后执行一次越界检查，构造 [`crate::Subsystem`] 前必须通过。
//!
//! ```toml
//! first_connection_id = 1
//!
//! [queue]
//! max_pending = 1024
//!
//! [names]
//! max_length = 255
//!
//! [timer]
//! thread_name_prefix = "spark-bus-timer"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// 子系统的完整配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// 新总线分配的第一个连接 id；0 保留给总线自身（内核来源的通知）。
    pub first_connection_id: u64,
    pub queue: QueueConfig,
    pub names: NameConfig,
    pub timer: TimerConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            first_connection_id: 1,
            queue: QueueConfig::default(),
            names: NameConfig::default(),
            timer: TimerConfig::default(),
        }
    }
}

/// 每个连接的消息队列配额。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// 队列中允许同时待投递的消息数；超出时入队返回 *out-of-memory*。
    pub max_pending: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_pending: 1024 }
    }
}

/// 知名名称注册表的约束。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NameConfig {
    pub max_length: usize,
}

impl Default for NameConfig {
    fn default() -> Self {
        Self { max_length: 255 }
    }
}

/// 超时扫描线程的参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    /// 扫描线程名前缀，完整线程名为 `<prefix>-<bus>-<id>`。
    pub thread_name_prefix: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "spark-bus-timer".to_owned(),
        }
    }
}

impl BusConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件解析并校验。
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 越界检查。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.first_connection_id == 0 {
            return Err(ConfigError::Invalid {
                key: "first_connection_id",
                detail: "id 0 is reserved for the bus itself".to_owned(),
            });
        }
        if self.queue.max_pending == 0 {
            return Err(ConfigError::Invalid {
                key: "queue.max_pending",
                detail: "must allow at least one pending message".to_owned(),
            });
        }
        if self.names.max_length == 0 {
            return Err(ConfigError::Invalid {
                key: "names.max_length",
                detail: "must be positive".to_owned(),
            });
        }
        if self.timer.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                key: "timer.thread_name_prefix",
                detail: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BusConfig::from_toml_str("").expect("空文档应使用默认值");
        assert_eq!(config, BusConfig::default());
    }

    #[test]
    fn partial_sections_override_only_named_keys() {
        let config = BusConfig::from_toml_str(
            r#"
            first_connection_id = 100

            [queue]
            max_pending = 8
            "#,
        )
        .expect("合法配置");
        assert_eq!(config.first_connection_id, 100);
        assert_eq!(config.queue.max_pending, 8);
        assert_eq!(config.names.max_length, 255);
    }

    #[test]
    fn unknown_keys_and_zero_quota_are_rejected() {
        assert!(matches!(
            BusConfig::from_toml_str("[queue]\nmax_pendingg = 3"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BusConfig::from_toml_str("[queue]\nmax_pending = 0"),
            Err(ConfigError::Invalid {
                key: "queue.max_pending",
                ..
            })
        ));
        assert!(matches!(
            BusConfig::from_toml_str("first_connection_id = 0"),
            Err(ConfigError::Invalid {
                key: "first_connection_id",
                ..
            })
        ));
    }
}

//! 应用配置模块
//!
//! 配置文件为 `<config_dir>/config.json`，每个小节可选，缺失的字段使用默认值。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::executor::RetryPolicy;
use crate::logging::LogConfig;

/// 从配置文件读取一个小节，文件或小节不存在、格式错误时返回 None
pub(crate) fn load_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    let section = config.get(key)?;
    match serde_json::from_value::<T>(section.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("配置小节 {} 格式错误，使用默认值: {}", key, e);
            None
        }
    }
}

/// 存储目录配置，三个目录必须在同一分区
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// 已完成文件
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,
    /// 下载中的文件
    #[serde(default = "default_sync_path")]
    pub sync_path: PathBuf,
    /// 下载中文件的元数据
    #[serde(default = "default_info_path")]
    pub info_path: PathBuf,
}

fn default_save_path() -> PathBuf {
    PathBuf::from("/var/lib/filesync-save")
}

fn default_sync_path() -> PathBuf {
    PathBuf::from("/var/lib/filesync-sync")
}

fn default_info_path() -> PathBuf {
    PathBuf::from("/var/lib/filesync-info")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            save_path: default_save_path(),
            sync_path: default_sync_path(),
            info_path: default_info_path(),
        }
    }
}

impl StoreConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "store").unwrap_or_default()
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 首次尝试之外的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单次读取超时（秒），传输总时长不设上限
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    60
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl TransferConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "transfer").unwrap_or_default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    /// 构造出站 HTTP 客户端：只限制连接和读取，不限制总时长
    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .build()
    }
}

/// 全部配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            store: StoreConfig::load(config_dir),
            transfer: TransferConfig::load(config_dir),
            log: LogConfig::load(config_dir),
        }
    }
}

use anyhow::Context;
use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::AppConfig;
pub use crate::core::{CoordinatorHandle, DownloadExecutor, StagingStore, TransferStateResolver};

/// 应用状态，在 HTTP 处理函数之间共享
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<StagingStore>,
    pub resolver: TransferStateResolver,
    pub coordinator: CoordinatorHandle,
    pub client: reqwest::Client,
}

impl AppState {
    /// 创建应用状态并启动请求协调器，必须在 tokio 运行时中调用
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = Arc::new(StagingStore::new(
            &config.store.save_path,
            &config.store.sync_path,
            &config.store.info_path,
        ));

        std::fs::create_dir_all(store.save_root()).with_context(|| {
            format!("failed to create save directory {:?}", store.save_root())
        })?;

        let client = config
            .transfer
            .build_client()
            .context("failed to build HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            resolver: TransferStateResolver::new(store.clone()),
            store,
            coordinator: CoordinatorHandle::spawn(),
            client,
        })
    }
}

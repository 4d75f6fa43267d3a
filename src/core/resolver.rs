//! 目标状态解析 - 把完成区、暂存区、元数据区合并成一个一致的状态

use std::sync::Arc;
use tracing::{debug, info};

use super::staging::{FileRecord, StagingStore, SyncMetadata};
use super::SyncError;

/// 可续传的暂存数据：暂存文件和元数据总是同时存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialTransfer {
    pub staging: FileRecord,
    pub metadata: SyncMetadata,
}

/// 一个路径在磁盘上的状态，只能由 [`TransferStateResolver`] 构造
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    Absent,
    Partial(PartialTransfer),
    Synced(FileRecord),
    /// 已有完成版本，同时有一个更新版本正在下载
    SyncedWithPartial {
        synced: FileRecord,
        partial: PartialTransfer,
    },
}

impl TargetState {
    fn from_parts(synced: Option<FileRecord>, partial: Option<PartialTransfer>) -> Self {
        match (synced, partial) {
            (None, None) => TargetState::Absent,
            (None, Some(partial)) => TargetState::Partial(partial),
            (Some(synced), None) => TargetState::Synced(synced),
            (Some(synced), Some(partial)) => TargetState::SyncedWithPartial { synced, partial },
        }
    }

    pub fn partial(&self) -> Option<&PartialTransfer> {
        match self {
            TargetState::Partial(partial) | TargetState::SyncedWithPartial { partial, .. } => {
                Some(partial)
            }
            _ => None,
        }
    }

    pub fn synced(&self) -> Option<&FileRecord> {
        match self {
            TargetState::Synced(synced) | TargetState::SyncedWithPartial { synced, .. } => {
                Some(synced)
            }
            _ => None,
        }
    }
}

/// 目标状态解析器
#[derive(Debug, Clone)]
pub struct TransferStateResolver {
    store: Arc<StagingStore>,
}

impl TransferStateResolver {
    pub fn new(store: Arc<StagingStore>) -> Self {
        Self { store }
    }

    /// 解析路径状态，顺带修复不一致的暂存数据
    ///
    /// 只有与"不存在"无关的文件系统错误才会返回 Err。
    pub async fn resolve(&self, file: &str) -> Result<TargetState, SyncError> {
        let synced = StagingStore::stat(&self.store.final_path(file)).await?;
        let staging = StagingStore::stat(&self.store.staging_path(file)).await?;
        let metadata = self.store.read_sidecar(file).await;

        let mut partial = match (staging, metadata) {
            (Some(staging), Some(metadata)) => Some(PartialTransfer { staging, metadata }),
            (None, None) => None,
            (Some(_), None) | (None, Some(_)) => {
                debug!("暂存文件与元数据不成对，清理: {}", file);
                self.store.purge_temp(file).await?;
                None
            }
        };

        if let (Some(record), Some(p)) = (&synced, &partial) {
            if p.metadata.last_modified < record.modify_time {
                info!(
                    "暂存数据对应的版本已过期 ({} < {})，清理: {}",
                    p.metadata.last_modified, record.modify_time, file
                );
                self.store.purge_temp(file).await?;
                partial = None;
            }
        }

        Ok(TargetState::from_parts(synced, partial))
    }
}

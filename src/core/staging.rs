//! 暂存区管理 - 三棵目录树（完成区 / 暂存区 / 元数据区）上的文件操作
//!
//! 三个根目录必须位于同一分区，否则 rename 无法保证原子性。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

use super::SyncError;

/// 文件快照（来自一次 stat 调用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modify_time: DateTime<Utc>,
}

/// 元数据文件内容，描述暂存文件所属的完整传输
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncMetadata {
    pub content_length: u64,
    /// UTC
    pub last_modified: DateTime<Utc>,
}

/// 暂存区
#[derive(Debug, Clone)]
pub struct StagingStore {
    save_root: PathBuf,
    sync_root: PathBuf,
    info_root: PathBuf,
}

impl StagingStore {
    pub fn new(
        save_root: impl Into<PathBuf>,
        sync_root: impl Into<PathBuf>,
        info_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            save_root: save_root.into(),
            sync_root: sync_root.into(),
            info_root: info_root.into(),
        }
    }

    pub fn save_root(&self) -> &Path {
        &self.save_root
    }

    /// 完成区中的文件路径
    pub fn final_path(&self, file: &str) -> PathBuf {
        Self::resolve_path(&self.save_root, file)
    }

    /// 暂存区中的文件路径
    pub fn staging_path(&self, file: &str) -> PathBuf {
        Self::resolve_path(&self.sync_root, file)
    }

    /// 元数据文件路径
    pub fn sidecar_path(&self, file: &str) -> PathBuf {
        Self::resolve_path(&self.info_root, file)
    }

    fn resolve_path(root: &Path, file: &str) -> PathBuf {
        let file = file.trim_start_matches('/');
        if file.is_empty() {
            root.to_path_buf()
        } else {
            root.join(file)
        }
    }

    /// 获取文件信息，不存在时返回 None
    pub async fn stat(path: &Path) -> Result<Option<FileRecord>, SyncError> {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => Err(SyncError::io(
                path,
                io::Error::new(io::ErrorKind::Other, "is a directory"),
            )),
            Ok(metadata) => {
                let modified = metadata.modified().map_err(|e| SyncError::io(path, e))?;
                Ok(Some(FileRecord {
                    path: path.to_path_buf(),
                    size: metadata.len(),
                    modify_time: DateTime::<Utc>::from(modified),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    /// 读取元数据文件，任何读取或解析失败都视为不存在
    pub async fn read_sidecar(&self, file: &str) -> Option<SyncMetadata> {
        let path = self.sidecar_path(file);
        let data = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!("元数据文件无法解析，视为不存在: {:?} - {}", path, e);
                None
            }
        }
    }

    /// 写入元数据文件
    pub async fn write_sidecar(&self, file: &str, meta: &SyncMetadata) -> Result<(), SyncError> {
        let path = self.sidecar_path(file);
        ensure_parent(&path).await?;
        let data = serde_json::to_vec(meta)
            .map_err(|e| SyncError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(&path, data)
            .await
            .map_err(|e| SyncError::io(&path, e))
    }

    /// 删除暂存文件和元数据文件
    pub async fn purge_temp(&self, file: &str) -> Result<(), SyncError> {
        Self::purge(&self.sync_root, &self.staging_path(file)).await?;
        Self::purge(&self.info_root, &self.sidecar_path(file)).await
    }

    /// 删除文件，并向上清理变空的父目录（不包括根目录本身）
    pub async fn purge(root: &Path, path: &Path) -> Result<(), SyncError> {
        match fs::remove_file(path).await {
            Ok(()) => debug!("已删除: {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io(path, e)),
        }

        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) {
                break;
            }
            // 非空目录删除会失败，正好作为停止条件
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }

        Ok(())
    }

    /// 提交：把暂存文件移到完成区，设置修改时间，清理暂存和元数据
    pub async fn commit(&self, file: &str, last_modified: DateTime<Utc>) -> Result<(), SyncError> {
        let from = self.staging_path(file);
        let to = self.final_path(file);

        if cfg!(windows) {
            // Windows 上 rename 不能覆盖已存在的文件
            Self::purge(&self.save_root, &to).await?;
        }

        ensure_parent(&to).await?;
        fs::rename(&from, &to)
            .await
            .map_err(|e| SyncError::io(&from, e))?;

        set_modify_time(&to, last_modified).await?;

        if let Err(e) = self.purge_temp(file).await {
            warn!("提交后清理临时文件失败: {}", e);
        }

        Ok(())
    }
}

async fn ensure_parent(path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;
    }
    Ok(())
}

async fn set_modify_time(path: &Path, time: DateTime<Utc>) -> Result<(), SyncError> {
    let target = path.to_path_buf();
    let modified = SystemTime::from(time);
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&target)?
            .set_modified(modified)
    })
    .await
    .map_err(|e| SyncError::io(path, io::Error::new(io::ErrorKind::Other, e)))?
    .map_err(|e| SyncError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store(dir: &Path) -> StagingStore {
        StagingStore::new(dir.join("save"), dir.join("sync"), dir.join("info"))
    }

    #[tokio::test]
    async fn test_sidecar_missing_or_corrupt_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(store.read_sidecar("/a.bin").await.is_none());

        std::fs::create_dir_all(dir.path().join("info")).unwrap();
        std::fs::write(store.sidecar_path("/a.bin"), b"{not json").unwrap();
        assert!(store.read_sidecar("/a.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_sidecar_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let meta = SyncMetadata {
            content_length: 10,
            last_modified: Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap(),
        };

        store.write_sidecar("/nested/dir/a.bin", &meta).await.unwrap();

        let raw = std::fs::read_to_string(store.sidecar_path("/nested/dir/a.bin")).unwrap();
        assert!(raw.contains("\"ContentLength\":10"));
        assert_eq!(store.read_sidecar("/nested/dir/a.bin").await, Some(meta));
    }

    #[tokio::test]
    async fn test_purge_prunes_empty_parents_but_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sync");
        let file = root.join("x/y/z.bin");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"data").unwrap();
        std::fs::write(root.join("x/keep.bin"), b"keep").unwrap();

        StagingStore::purge(&root, &file).await.unwrap();

        assert!(!file.exists());
        assert!(!root.join("x/y").exists());
        assert!(root.join("x").exists());
        assert!(root.exists());

        // 已经不存在的文件
        StagingStore::purge(&root, &file).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_moves_and_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let modified = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();

        store
            .write_sidecar("/d/a.bin", &SyncMetadata { content_length: 3, last_modified: modified })
            .await
            .unwrap();
        ensure_parent(&store.staging_path("/d/a.bin")).await.unwrap();
        std::fs::write(store.staging_path("/d/a.bin"), b"abc").unwrap();

        store.commit("/d/a.bin", modified).await.unwrap();

        let record = StagingStore::stat(&store.final_path("/d/a.bin"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.size, 3);
        assert_eq!(record.modify_time, modified);
        assert!(!store.staging_path("/d/a.bin").exists());
        assert!(!store.sidecar_path("/d/a.bin").exists());
        assert!(!dir.path().join("sync/d").exists());
    }

    #[tokio::test]
    async fn test_stat_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StagingStore::stat(dir.path()).await.is_err());
        assert!(StagingStore::stat(&dir.path().join("missing")).await.unwrap().is_none());
    }
}

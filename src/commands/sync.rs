//! 同步请求处理

use axum::extract::State;
use axum::Form;
use serde::Deserialize;
use tracing::{info, warn};

use crate::core::{Admission, DownloadExecutor};
use crate::AppState;

const DOWNLOADING_STARTED: &str = "Downloading started.";
const DENIED: &str = "For some reason, the file is denied to synchronize.";

/// `POST /sync` 表单
#[derive(Debug, Deserialize)]
pub struct SyncForm {
    pub file: Option<String>,
    pub remote: Option<String>,
}

/// 请求参数错误，直接以文本返回给调用方
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SyncRequestError {
    #[error("Please set remote file: -d file=path/to/file")]
    MissingFile,
    #[error("Please set remote server: -d remote=remote_server")]
    MissingRemote,
    #[error("Invalid file path: {0}")]
    InvalidPath(String),
}

/// 规范化文件路径：补全开头的 `/`，拒绝 `.`、`..` 和空路径段
pub fn validate_file_path(raw: Option<&str>) -> Result<String, SyncRequestError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(SyncRequestError::MissingFile);
    }

    let file = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    };

    let valid = file[1..]
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != ".." && !segment.contains('\\'));
    if !valid {
        return Err(SyncRequestError::InvalidPath(raw.to_string()));
    }

    Ok(file)
}

/// 远端地址 `host[:port]`，去掉末尾的 `/`
pub fn validate_remote(raw: Option<&str>) -> Result<String, SyncRequestError> {
    let remote = raw.map(str::trim).unwrap_or_default().trim_end_matches('/');
    if remote.is_empty() {
        return Err(SyncRequestError::MissingRemote);
    }
    Ok(remote.to_string())
}

/// `POST /sync`
pub async fn sync_file(State(state): State<AppState>, Form(form): Form<SyncForm>) -> String {
    match start_sync(&state, form).await {
        Ok(message) | Err(message) => message,
    }
}

async fn start_sync(state: &AppState, form: SyncForm) -> Result<String, String> {
    let file = validate_file_path(form.file.as_deref()).map_err(|e| e.to_string())?;

    // 已经在同步中，返回当前进度
    if let Some(progress) = state
        .coordinator
        .progress(&file)
        .await
        .map_err(|e| e.to_string())?
    {
        return Ok(progress);
    }

    let remote = validate_remote(form.remote.as_deref()).map_err(|e| e.to_string())?;

    let progress = match state
        .coordinator
        .admit(&file, &remote)
        .await
        .map_err(|e| e.to_string())?
    {
        Admission::Accepted(progress) => progress,
        Admission::Rejected => {
            warn!("同步请求被拒绝: {}", file);
            return Ok(DENIED.to_string());
        }
    };

    // 准入之后才解析状态，此时该路径的暂存数据只归本次请求所有
    let target = match state.resolver.resolve(&file).await {
        Ok(target) => target,
        Err(e) => {
            state.coordinator.done(&file);
            return Err(format!("Error to get target info: {}", e));
        }
    };

    info!("同步请求已接受: {} <- {} ({:?})", file, remote, target);

    DownloadExecutor::new(
        state.client.clone(),
        state.store.clone(),
        &file,
        &remote,
        progress,
        state.config.transfer.retry_policy(),
    )
    .spawn(target, state.coordinator.clone());

    Ok(DOWNLOADING_STARTED.to_string())
}

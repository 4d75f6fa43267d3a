//! 下载执行器 - 支持断点续传的单文件拉取
//!
//! 每次尝试根据磁盘状态构造请求：有可续传的暂存数据时发送 Range + If-Range，
//! 只有完成文件时发送 If-Modified-Since，否则从头下载。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderName, CONTENT_RANGE, IF_MODIFIED_SINCE, IF_RANGE, LAST_MODIFIED, RANGE,
};
use reqwest::{Response, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::coordinator::{CoordinatorHandle, TransferProgress};
use super::error::{ErrorKind, SyncError};
use super::resolver::{TargetState, TransferStateResolver};
use super::staging::{StagingStore, SyncMetadata};

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 首次尝试之外的最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟，按指数退避
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// 传输的最终结果
#[derive(Debug)]
pub enum TransferOutcome {
    /// 下载完成并已提交到完成区
    Committed { bytes: u64 },
    /// 对端返回未修改，完成文件已是最新
    Unchanged,
    Failed(SyncError),
}

/// 单次尝试的结果
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Committed,
    Unchanged,
    /// 数据未下载完整，需要重试
    Incomplete,
}

/// 本次响应允许写入的字节范围
#[derive(Debug, Clone, Copy)]
struct Budget {
    /// 响应声明的长度
    declared: u64,
    /// 写入前暂存文件的大小
    start: u64,
    /// 元数据记录的完整文件大小
    total: u64,
}

/// Content-Range: bytes <start>-<end>/<total|*>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    end: u64,
    total: Option<u64>,
}

impl ContentRange {
    fn parse(value: &str) -> Option<Self> {
        let range = value.trim().strip_prefix("bytes ")?;
        let (span, total) = range.split_once('/')?;
        let (start, end) = span.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self { start, end, total })
    }

    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// 下载执行器
pub struct DownloadExecutor {
    client: reqwest::Client,
    store: Arc<StagingStore>,
    resolver: TransferStateResolver,
    file: String,
    remote: String,
    progress: TransferProgress,
    policy: RetryPolicy,
}

impl DownloadExecutor {
    pub fn new(
        client: reqwest::Client,
        store: Arc<StagingStore>,
        file: &str,
        remote: &str,
        progress: TransferProgress,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            resolver: TransferStateResolver::new(store.clone()),
            store,
            file: file.to_string(),
            remote: remote.to_string(),
            progress,
            policy,
        }
    }

    /// 在独立任务中运行，无论以何种方式结束都只向协调器报告一次
    pub fn spawn(
        self,
        state: TargetState,
        coordinator: CoordinatorHandle,
    ) -> JoinHandle<TransferOutcome> {
        tokio::spawn(async move {
            let file = self.file.clone();
            let _done =
                scopeguard::guard(coordinator, move |coordinator| coordinator.done(&file));
            self.run(state).await
        })
    }

    /// 逐次尝试直到成功、致命错误或重试次数用尽
    pub async fn run(&self, initial: TargetState) -> TransferOutcome {
        let mut state = initial;
        let mut retries = 0u32;

        loop {
            match self.attempt(&state).await {
                Ok(Step::Committed) => {
                    let bytes = self.progress.new_downloaded();
                    info!("文件同步完成: {}，新下载 {} 字节", self.file, bytes);
                    return TransferOutcome::Committed { bytes };
                }
                Ok(Step::Unchanged) => {
                    info!("文件未变化，停止同步: {}", self.file);
                    return TransferOutcome::Unchanged;
                }
                Ok(Step::Incomplete) => {
                    debug!("数据未下载完整: {}", self.file);
                }
                Err(e) => match e.kind() {
                    ErrorKind::Retryable => {
                        warn!("同步文件出错: {} - {}", self.file, e);
                    }
                    ErrorKind::Fatal => {
                        error!(
                            "同步文件数据损坏，删除暂存数据: {} - {}，新下载 {} 字节",
                            self.file,
                            e,
                            self.progress.new_downloaded()
                        );
                        if let Err(cleanup) = self.store.purge_temp(&self.file).await {
                            warn!("删除暂存数据失败: {}", cleanup);
                        }
                        return TransferOutcome::Failed(e);
                    }
                    ErrorKind::Unsupported | ErrorKind::Terminal => {
                        error!("同步文件失败: {} - {}", self.file, e);
                        return TransferOutcome::Failed(e);
                    }
                },
            }

            if retries >= self.policy.max_retries {
                let e = SyncError::RetriesExhausted {
                    attempts: retries + 1,
                };
                error!(
                    "同步文件失败: {} - {}，暂存数据已保留，新下载 {} 字节",
                    self.file,
                    e,
                    self.progress.new_downloaded()
                );
                return TransferOutcome::Failed(e);
            }

            let delay = self.policy.base_delay * 2_u32.saturating_pow(retries);
            retries += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // 重新从磁盘解析，捕获外部变化
            state = match self.resolver.resolve(&self.file).await {
                Ok(state) => state,
                Err(e) => {
                    error!("重试前解析状态失败 ({}): {} - {}", retries, self.file, e);
                    return TransferOutcome::Failed(e);
                }
            };
            info!("重试 ({}/{}) 下载文件: {}", retries, self.policy.max_retries, self.file);
        }
    }

    fn url(&self) -> String {
        let path: Vec<String> = self
            .file
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("http://{}{}", self.remote, path.join("/"))
    }

    async fn attempt(&self, state: &TargetState) -> Result<Step, SyncError> {
        let mut request = self.client.post(self.url());

        if let Some(partial) = state.partial() {
            request = request
                .header(RANGE, format!("bytes={}-", partial.staging.size))
                .header(IF_RANGE, http_date(partial.metadata.last_modified));
        } else if let Some(synced) = state.synced() {
            request = request.header(IF_MODIFIED_SINCE, http_date(synced.modify_time));
        }

        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                info!("响应: 文件未变化 {}", self.file);
                self.store.purge_temp(&self.file).await?;
                Ok(Step::Unchanged)
            }
            StatusCode::PARTIAL_CONTENT => {
                info!("响应: 继续下载 {}", self.file);
                self.resume(state, response).await
            }
            StatusCode::OK | StatusCode::RANGE_NOT_SATISFIABLE => {
                info!("响应: 从头下载 {}", self.file);
                self.fetch_from_scratch(response).await
            }
            status => Err(SyncError::UnsupportedStatus(status)),
        }
    }

    /// 206：把响应追加到暂存文件
    async fn resume(&self, state: &TargetState, response: Response) -> Result<Step, SyncError> {
        let partial = state.partial().ok_or(SyncError::UnexpectedPartial)?;
        let size = partial.staging.size;
        let total = partial.metadata.content_length;
        self.progress.begin(total, size);

        let header = header_str(response.headers(), CONTENT_RANGE);
        let range = header
            .and_then(ContentRange::parse)
            .ok_or_else(|| SyncError::invalid_header("Content-Range", header))?;

        if range.start != size {
            return Err(SyncError::RangeMismatch {
                start: range.start,
                size,
            });
        }

        let declared = response.content_length().unwrap_or_else(|| range.len());

        let path = self.store.staging_path(&self.file);
        let mut out = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| SyncError::io(&path, e))?;

        let budget = Budget {
            declared,
            start: size,
            total,
        };
        let written =
            copy_body(&mut out, response.bytes_stream(), budget, &self.progress, &path).await?;

        if written == declared && size + written == total {
            self.store
                .commit(&self.file, partial.metadata.last_modified)
                .await?;
            Ok(Step::Committed)
        } else {
            Ok(Step::Incomplete)
        }
    }

    /// 200 / 416：丢弃旧的暂存数据，先写元数据再写文件内容
    async fn fetch_from_scratch(&self, response: Response) -> Result<Step, SyncError> {
        self.store.purge_temp(&self.file).await?;

        let content_length = response.content_length().ok_or_else(|| {
            SyncError::invalid_header(
                "Content-Length",
                header_str(response.headers(), reqwest::header::CONTENT_LENGTH),
            )
        })?;
        let header = header_str(response.headers(), LAST_MODIFIED);
        let last_modified = header
            .and_then(parse_http_date)
            .ok_or_else(|| SyncError::invalid_header("Last-Modified", header))?;

        self.progress.begin(content_length, 0);

        let metadata = SyncMetadata {
            content_length,
            last_modified,
        };
        self.store.write_sidecar(&self.file, &metadata).await?;

        let path = self.store.staging_path(&self.file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(parent, e))?;
        }
        let mut out = File::create(&path)
            .await
            .map_err(|e| SyncError::io(&path, e))?;

        let budget = Budget {
            declared: content_length,
            start: 0,
            total: content_length,
        };
        let written =
            copy_body(&mut out, response.bytes_stream(), budget, &self.progress, &path).await?;

        if written == content_length {
            self.store.commit(&self.file, last_modified).await?;
            Ok(Step::Committed)
        } else {
            Ok(Step::Incomplete)
        }
    }
}

/// 把响应体写入文件，每个数据块写入前检查长度约束
///
/// 出错时已写入的数据仍会落盘，供下一次续传使用。
async fn copy_body<S, E>(
    out: &mut File,
    body: S,
    budget: Budget,
    progress: &TransferProgress,
    path: &Path,
) -> Result<u64, SyncError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut body = std::pin::pin!(body);
    let mut written = 0u64;

    let pumped = async {
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| SyncError::Body(Box::new(e)))?;
            let received = written + chunk.len() as u64;
            if received > budget.declared {
                return Err(SyncError::Overrun {
                    received,
                    declared: budget.declared,
                });
            }
            if budget.start + received > budget.total {
                return Err(SyncError::Oversize {
                    size: budget.start + received,
                    expected: budget.total,
                });
            }
            out.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io(path, e))?;
            written = received;
            progress.add(chunk.len() as u64);
        }
        Ok::<(), SyncError>(())
    }
    .await;

    let flushed = match out.flush().await {
        Ok(()) => out.sync_data().await,
        Err(e) => Err(e),
    };

    pumped?;
    flushed.map_err(|e| SyncError::io(path, e))?;
    Ok(written)
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// HTTP-date（RFC 7231 IMF-fixdate）
fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coordinator::Admission;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use std::time::SystemTime;

    const LAST_MODIFIED_STR: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

    fn last_modified() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap()
    }

    fn store(dir: &Path) -> Arc<StagingStore> {
        Arc::new(StagingStore::new(
            dir.join("save"),
            dir.join("sync"),
            dir.join("info"),
        ))
    }

    fn executor(store: &Arc<StagingStore>, server: &MockServer, file: &str) -> DownloadExecutor {
        DownloadExecutor::new(
            reqwest::Client::new(),
            store.clone(),
            file,
            &server.address().to_string(),
            TransferProgress::default(),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::ZERO,
            },
        )
    }

    fn write(path: &Path, data: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    async fn stage(store: &StagingStore, file: &str, data: &[u8], content_length: u64) {
        write(&store.staging_path(file), data);
        store
            .write_sidecar(
                file,
                &SyncMetadata {
                    content_length,
                    last_modified: last_modified(),
                },
            )
            .await
            .unwrap();
    }

    async fn resolve(store: &Arc<StagingStore>, file: &str) -> TargetState {
        TransferStateResolver::new(store.clone())
            .resolve(file)
            .await
            .unwrap()
    }

    #[test]
    fn test_content_range_parse() {
        assert_eq!(
            ContentRange::parse("bytes 4-9/10"),
            Some(ContentRange {
                start: 4,
                end: 9,
                total: Some(10)
            })
        );
        assert_eq!(ContentRange::parse("bytes 0-0/*").map(|r| r.len()), Some(1));
        assert_eq!(ContentRange::parse("bytes 9-4/10"), None);
        assert_eq!(ContentRange::parse("items 0-9/10"), None);
        assert_eq!(ContentRange::parse("bytes 4-/10"), None);
    }

    #[test]
    fn test_http_date_roundtrip() {
        assert_eq!(http_date(last_modified()), LAST_MODIFIED_STR);
        assert_eq!(parse_http_date(LAST_MODIFIED_STR), Some(last_modified()));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[tokio::test]
    async fn test_url_encodes_segments() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(&store(dir.path()), &server, "/dir/a b#1.bin");
        assert_eq!(
            executor.url(),
            format!("http://{}/dir/a%20b%231.bin", server.address())
        );
    }

    #[tokio::test]
    async fn test_copy_body_rejects_overrun() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.bin");
        let mut out = File::create(&path).await.unwrap();
        let body = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]);
        let budget = Budget {
            declared: 5,
            start: 0,
            total: 100,
        };

        let result = copy_body(&mut out, body, budget, &TransferProgress::default(), &path).await;

        assert!(matches!(
            result,
            Err(SyncError::Overrun {
                received: 6,
                declared: 5
            })
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_copy_body_surfaces_stream_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.bin");
        let mut out = File::create(&path).await.unwrap();
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let budget = Budget {
            declared: 10,
            start: 0,
            total: 10,
        };

        let result = copy_body(&mut out, body, budget, &TransferProgress::default(), &path).await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Retryable);
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_fresh_download_commits() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/a.bin");
                then.status(200)
                    .header("last-modified", LAST_MODIFIED_STR)
                    .body("0123456789");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let outcome = executor(&store, &server, "/a.bin")
            .run(TargetState::Absent)
            .await;

        mock.assert_async().await;
        assert!(matches!(outcome, TransferOutcome::Committed { bytes: 10 }));
        assert_eq!(std::fs::read(store.final_path("/a.bin")).unwrap(), b"0123456789");
        let modified = std::fs::metadata(store.final_path("/a.bin"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(modified, SystemTime::from(last_modified()));
        assert!(!store.staging_path("/a.bin").exists());
        assert!(!store.sidecar_path("/a.bin").exists());
    }

    #[tokio::test]
    async fn test_resume_appends_and_commits() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/a.bin")
                    .header("range", "bytes=4-")
                    .header("if-range", LAST_MODIFIED_STR);
                then.status(206)
                    .header("content-range", "bytes 4-9/10")
                    .body("efghij");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        stage(&store, "/a.bin", b"abcd", 10).await;
        let state = resolve(&store, "/a.bin").await;

        let executor = executor(&store, &server, "/a.bin");
        let outcome = executor.run(state).await;

        mock.assert_async().await;
        assert!(matches!(outcome, TransferOutcome::Committed { bytes: 6 }));
        assert_eq!(std::fs::read(store.final_path("/a.bin")).unwrap(), b"abcdefghij");
        let record = StagingStore::stat(&store.final_path("/a.bin"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.size, 10);
        assert_eq!(record.modify_time, last_modified());
        assert!(!store.staging_path("/a.bin").exists());
        assert!(!store.sidecar_path("/a.bin").exists());
        assert_eq!(executor.progress.downloaded(), 10);
    }

    #[tokio::test]
    async fn test_not_modified_keeps_final_file() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/a.bin")
                    .header("if-modified-since", LAST_MODIFIED_STR);
                then.status(304);
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        write(&store.final_path("/a.bin"), b"current");
        std::fs::OpenOptions::new()
            .write(true)
            .open(store.final_path("/a.bin"))
            .unwrap()
            .set_modified(SystemTime::from(last_modified()))
            .unwrap();
        let state = resolve(&store, "/a.bin").await;

        let executor = executor(&store, &server, "/a.bin");
        let outcome = executor.run(state).await;

        mock.assert_async().await;
        assert!(matches!(outcome, TransferOutcome::Unchanged));
        assert_eq!(executor.progress.new_downloaded(), 0);
        assert_eq!(std::fs::read(store.final_path("/a.bin")).unwrap(), b"current");
    }

    #[tokio::test]
    async fn test_oversize_is_fatal_and_purges() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/a.bin");
                then.status(206)
                    .header("content-range", "bytes 4-9/10")
                    .body("efghij");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        stage(&store, "/a.bin", b"abcd", 6).await;
        let state = resolve(&store, "/a.bin").await;

        let outcome = executor(&store, &server, "/a.bin").run(state).await;

        let TransferOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(matches!(err, SyncError::Oversize { expected: 6, .. }));
        assert!(!store.staging_path("/a.bin").exists());
        assert!(!store.sidecar_path("/a.bin").exists());
        assert!(!store.final_path("/a.bin").exists());
    }

    #[tokio::test]
    async fn test_unsupported_status_keeps_staging() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/a.bin");
                then.status(404);
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        stage(&store, "/a.bin", b"abcd", 10).await;
        let state = resolve(&store, "/a.bin").await;

        let outcome = executor(&store, &server, "/a.bin").run(state).await;

        mock.assert_hits_async(1).await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed(SyncError::UnsupportedStatus(StatusCode::NOT_FOUND))
        ));
        assert!(store.staging_path("/a.bin").exists());
        assert!(store.sidecar_path("/a.bin").exists());
    }

    #[tokio::test]
    async fn test_range_mismatch_retries_then_preserves_staging() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/a.bin");
                then.status(206)
                    .header("content-range", "bytes 0-9/10")
                    .body("0123456789");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        stage(&store, "/a.bin", b"abcd", 10).await;
        let state = resolve(&store, "/a.bin").await;

        let outcome = executor(&store, &server, "/a.bin").run(state).await;

        mock.assert_hits_async(4).await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed(SyncError::RetriesExhausted { attempts: 4 })
        ));
        assert_eq!(std::fs::read(store.staging_path("/a.bin")).unwrap(), b"abcd");
        assert!(store.sidecar_path("/a.bin").exists());
    }

    #[tokio::test]
    async fn test_spawn_reports_done_to_coordinator() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/a.bin");
                then.status(500);
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let coordinator = CoordinatorHandle::spawn();

        let Admission::Accepted(progress) = coordinator
            .admit("/a.bin", &server.address().to_string())
            .await
            .unwrap()
        else {
            panic!("expected admission");
        };
        let executor = DownloadExecutor::new(
            reqwest::Client::new(),
            store.clone(),
            "/a.bin",
            &server.address().to_string(),
            progress,
            RetryPolicy::default(),
        );

        let outcome = executor
            .spawn(TargetState::Absent, coordinator.clone())
            .await
            .unwrap();

        assert!(matches!(outcome, TransferOutcome::Failed(_)));
        assert_eq!(coordinator.progress("/a.bin").await.unwrap(), None);
        assert!(matches!(
            coordinator.admit("/a.bin", "h:80").await.unwrap(),
            Admission::Accepted(_)
        ));
    }
}

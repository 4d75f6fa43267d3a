//! 请求协调器 - 活动传输表的唯一持有者
//!
//! 所有对活动传输表的读写都通过消息串行进入同一个任务完成，
//! 因此同一路径在任意时刻最多只有一个下载执行器在运行。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// 传输字节计数，执行器写入，协调器读取
#[derive(Debug, Default)]
struct TransferCounters {
    file_size: AtomicU64,
    downloaded: AtomicU64,
    new_downloaded: AtomicU64,
}

/// 传输进度句柄
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    counters: Arc<TransferCounters>,
}

impl TransferProgress {
    /// 开始一段新的数据：声明总大小和已有字节数
    pub fn begin(&self, file_size: u64, downloaded: u64) {
        self.counters.file_size.store(file_size, Ordering::Relaxed);
        self.counters.downloaded.store(downloaded, Ordering::Relaxed);
    }

    pub fn add(&self, bytes: u64) {
        self.counters.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.counters.new_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn file_size(&self) -> u64 {
        self.counters.file_size.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.counters.downloaded.load(Ordering::Relaxed)
    }

    /// 本次调用新下载的字节数
    pub fn new_downloaded(&self) -> u64 {
        self.counters.new_downloaded.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        let file_size = self.file_size();
        if file_size == 0 {
            return "0% downloaded".to_string();
        }
        let downloaded = self.downloaded().min(file_size);
        format!(
            "{:.2}% downloaded ({} of {} bytes)",
            downloaded as f64 * 100.0 / file_size as f64,
            downloaded,
            file_size
        )
    }
}

/// 活动传输记录
#[derive(Debug)]
struct ActiveTransfer {
    remote: String,
    progress: TransferProgress,
    admitted_at: chrono::DateTime<chrono::Utc>,
}

/// 准入结果
#[derive(Debug)]
pub enum Admission {
    Accepted(TransferProgress),
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("request coordinator is not running")]
    Closed,
}

#[derive(Debug)]
enum Command {
    Admit {
        path: String,
        remote: String,
        reply: oneshot::Sender<Admission>,
    },
    Done {
        path: String,
    },
    Progress {
        path: String,
        reply: oneshot::Sender<Option<String>>,
    },
}

/// 协调器句柄
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    /// 启动协调器任务，必须在 tokio 运行时中调用
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// 申请准入，路径已在传输时拒绝
    pub async fn admit(&self, path: &str, remote: &str) -> Result<Admission, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Admit {
                path: path.to_string(),
                remote: remote.to_string(),
                reply,
            })
            .map_err(|_| CoordinatorError::Closed)?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    /// 报告传输结束，未知路径忽略
    pub fn done(&self, path: &str) {
        let _ = self.tx.send(Command::Done {
            path: path.to_string(),
        });
    }

    /// 查询进度，路径不在传输中时返回 None
    pub async fn progress(&self, path: &str) -> Result<Option<String>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Progress {
                path: path.to_string(),
                reply,
            })
            .map_err(|_| CoordinatorError::Closed)?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut active: HashMap<String, ActiveTransfer> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Admit {
                path,
                remote,
                reply,
            } => {
                let admission = if active.contains_key(&path) {
                    debug!("拒绝重复的同步请求: {}", path);
                    Admission::Rejected
                } else {
                    let progress = TransferProgress::default();
                    info!("开始同步文件: {} <- {}", path, remote);
                    active.insert(
                        path,
                        ActiveTransfer {
                            remote,
                            progress: progress.clone(),
                            admitted_at: chrono::Utc::now(),
                        },
                    );
                    Admission::Accepted(progress)
                };
                let _ = reply.send(admission);
            }
            Command::Done { path } => {
                if let Some(transfer) = active.remove(&path) {
                    let elapsed = chrono::Utc::now() - transfer.admitted_at;
                    debug!(
                        "同步结束: {} <- {} (耗时 {}s, 新下载 {} 字节)",
                        path,
                        transfer.remote,
                        elapsed.num_seconds(),
                        transfer.progress.new_downloaded()
                    );
                }
            }
            Command::Progress { path, reply } => {
                let _ = reply.send(active.get(&path).map(|t| t.progress.describe()));
            }
        }
    }

    debug!("请求协调器已退出");
}

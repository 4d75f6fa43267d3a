use clap::Parser;
use filesync_lib::logging::init_logging;
use filesync_lib::{commands, AppConfig, AppState};
use std::path::PathBuf;

/// 基于 HTTP 拉取的文件同步服务
#[derive(Debug, Parser)]
#[command(name = "filesync", version, about)]
struct Args {
    /// 监听端口
    #[arg(long, env = "FILESYNC_PORT", default_value_t = 80)]
    port: u16,

    /// 配置目录，读取其中的 config.json
    #[arg(long, env = "FILESYNC_CONFIG_DIR", default_value = "/etc/filesync")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config_dir);

    // guard 需要持有到进程退出
    let _guard = init_logging(&config.log);

    tracing::info!("配置目录: {:?}", args.config_dir);
    tracing::info!(
        "完成区: {:?}, 暂存区: {:?}, 元数据: {:?}",
        config.store.save_path,
        config.store.sync_path,
        config.store.info_path
    );

    let state = AppState::new(config)?;
    commands::serve(state, args.port).await
}

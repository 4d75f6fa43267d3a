//! HTTP 接口
//!
//! - `POST /sync`：作为接收方，从远端拉取文件
//! - `GET /pull/<path>`：作为发送方，直接提供完成区中的文件，供其他节点链式同步

pub mod sync;

use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    let pull = ServeDir::new(state.store.save_root());

    Router::new()
        .route("/sync", post(sync::sync_file))
        .nest_service("/pull", pull)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 监听端口并一直运行，只有绑定失败或服务异常退出时返回错误
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("服务正在监听 {} ...", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

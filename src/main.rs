//! ProjectWise CLI
//!
//! 入口：加载配置、初始化日志、连接工具服务器，然后逐行读取标准输入作为查询。
//! 命令：/connect /disconnect /status /quit

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use projectwise::config::load_config;
use projectwise::core::{SessionCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use projectwise::{observability, ProjectWiseClient};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let client = ProjectWiseClient::from_config(&cfg);
    if !client.connect().await {
        tracing::warn!(endpoint = %cfg.mcp.server_url, "MCP server unreachable, continuing without tools");
    }

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(shutdown.clone())
        .with_timeout(Duration::from_secs(cfg.mcp.request_timeout_secs.max(1)));
    coordinator.register(SessionCleanup::new(client.session().clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            shutdown.shutdown(ShutdownReason::InputClosed);
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => {
                shutdown.shutdown(ShutdownReason::UserInitiated);
                break;
            }
            "/connect" => {
                let ok = client.connect_manual().await;
                println!("{}", if ok { "Terhubung." } else { "Gagal terhubung ke MCP server." });
            }
            "/disconnect" => {
                client.disconnect_manual().await;
                println!("Terputus.");
            }
            "/status" => {
                let status = client.status().await;
                println!("{}", serde_json::to_string_pretty(&status).context("Failed to render status")?);
            }
            query => {
                let answer = tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    answer = client.process_query(query, "default", None) => answer,
                };
                println!("{answer}");
            }
        }
    }

    coordinator.run_cleanup().await;
    Ok(())
}

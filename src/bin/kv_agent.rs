//! kv-agent - 演示用 Agent 宿主进程
//!
//! 用内存存储托管实例：
//! - `kv-agent` 单实例模式
//! - `kv-agent user app` 多实例模式，每个参数一个命名实例

use std::sync::Arc;

use anyhow::Result;
use kv_inspect_bridge::{Agent, AgentConfig, MemoryStore, StoreSet};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("kv_inspect_bridge=debug".parse()?))
        .init();

    tracing::info!("🚀 kv-agent v{}", env!("CARGO_PKG_VERSION"));

    let names: Vec<String> = std::env::args().skip(1).collect();
    let stores = if names.is_empty() {
        StoreSet::single(MemoryStore::new())
    } else {
        names
            .iter()
            .fold(StoreSet::new(), |set, name| set.with_instance(name, MemoryStore::new()))
    };

    let agent = Arc::new(Agent::new(AgentConfig::default(), stores)?);

    let agent_for_signal = agent.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到中断信号，准备退出...");
            agent_for_signal.shutdown();
        }
    });

    agent.run().await?;

    tracing::info!("👋 kv-agent exiting");
    Ok(())
}

//! kv-mirror - 无界面 Inspector
//!
//! 连接 Agent，每次镜像变化后打印当前实例的所有行。
//! `kv-mirror` 连接单实例 Agent，`kv-mirror <instance>` 连接多实例 Agent 并选中该实例。

use anyhow::Result;
use kv_inspect_bridge::{MirrorClient, MirrorConfig, Variant};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("kv_inspect_bridge=info".parse()?))
        .init();

    let instance = std::env::args().nth(1);
    let variant = if instance.is_some() {
        Variant::Multi
    } else {
        Variant::Single
    };

    let config = MirrorConfig::new("kv-mirror").with_variant(variant);
    let mut client = MirrorClient::connect(config).await?;

    let mut last_version = client.state().version();
    while client.recv().await.is_some() {
        if let Some(name) = instance.as_deref() {
            if client.state().selected_instance() != Some(name) {
                client.select_instance(name);
            }
        }

        let state = client.state();
        if state.version() == last_version {
            continue;
        }
        last_version = state.version();

        println!("--- v{} ({} instances) ---", last_version, state.instance_names().len());
        for row in state.rows() {
            println!("{} = {}", row.key, row.value_json());
        }
    }

    tracing::info!("👋 Agent disconnected");
    Ok(())
}

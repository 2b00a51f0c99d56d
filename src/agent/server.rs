//! Agent 服务器
//!
//! Unix Socket 服务，嵌入目标进程运行。生命周期：
//! `Agent::new(stores)`（初始化）→ `run()`（活跃）→ `shutdown()`（拆除）

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use super::broadcaster::{Broadcaster, SessionInfo};
use super::handler::{Flow, Handler};
use super::snapshot;
use crate::config::BridgeConfig;
use crate::error::Error;
use crate::protocol::decode_command;
use crate::store::{ListenerId, StoreSet};

/// Agent 配置
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// 连接配置
    pub bridge: BridgeConfig,
}

impl AgentConfig {
    pub fn new(bridge: BridgeConfig) -> Self {
        Self { bridge }
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.bridge.socket_path()
    }
}

/// Agent 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// 已初始化，listener 已安装
    Initialized,
    /// 正在接受连接
    Active,
    /// 已拆除
    TornDown,
}

/// Agent 服务
pub struct Agent {
    config: AgentConfig,
    stores: StoreSet,
    broadcaster: Arc<Broadcaster>,
    handler: Arc<Handler>,
    /// 已安装的变更 listener：实例名 → listener ID
    listeners: Mutex<Vec<(String, ListenerId)>>,
    phase: RwLock<AgentPhase>,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    /// 创建 Agent 并为每个实例安装变更 listener
    pub fn new(config: AgentConfig, stores: StoreSet) -> crate::Result<Self> {
        stores.ensure_available()?;

        let broadcaster = Broadcaster::new(stores.variant());
        let handler = Arc::new(Handler::new(
            stores.clone(),
            broadcaster.clone(),
            &config.bridge.plugin_id,
        ));

        let mut listeners = Vec::with_capacity(stores.len());
        for (name, store) in stores.iter() {
            // listener 存放在 store 内部，只能持有弱引用
            let weak = Arc::downgrade(store);
            let broadcaster = broadcaster.clone();
            let instance = name.clone();
            let id = store.add_listener(Arc::new(move |key: &str| {
                if let Some(store) = weak.upgrade() {
                    snapshot::emit_change(&broadcaster, &instance, store.as_ref(), key);
                }
            }));
            listeners.push((name.clone(), id));
        }

        tracing::debug!("Agent initialized: instances={:?}", stores.names());

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            stores,
            broadcaster,
            handler,
            listeners: Mutex::new(listeners),
            phase: RwLock::new(AgentPhase::Initialized),
            shutdown,
        })
    }

    /// 运行 Agent，直到 [`Agent::shutdown`] 被调用
    pub async fn run(self: Arc<Self>) -> Result<()> {
        {
            let mut phase = self.phase.write();
            match *phase {
                AgentPhase::Initialized => *phase = AgentPhase::Active,
                AgentPhase::Active => {
                    return Err(Error::Lifecycle("agent is already running".to_string()).into())
                }
                AgentPhase::TornDown => {
                    return Err(Error::Lifecycle("agent has been torn down".to_string()).into())
                }
            }
        }

        fs::create_dir_all(&self.config.bridge.data_dir).context("创建数据目录失败")?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;

        // 设置 socket 权限为 0600
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!(
            "🚀 Agent 启动: {:?}, instances={:?}",
            socket_path,
            self.stores.names()
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let agent = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = agent.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        self.cleanup();
        Ok(())
    }

    /// 处理单个连接（一个会话）
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let conn_id = self.broadcaster.register(tx);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 发送任务：按入队顺序写出（每个连接 FIFO）
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut line = String::new();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            line.clear();
            let read = tokio::select! {
                read = reader.read_line(&mut line) => read,
                _ = shutdown_rx.changed() => break,
            };

            match read {
                Ok(0) => break,
                Ok(_) => {
                    // 不合法的命令在这里被拒绝，单向通道不回复错误
                    let command = match decode_command(&line) {
                        Ok(command) => command,
                        Err(e) => {
                            tracing::warn!("Dropping command from conn_id={}: {}", conn_id, e);
                            continue;
                        }
                    };

                    tracing::debug!("📨 {} from conn_id={}", command.kind(), conn_id);
                    if self.handler.handle(conn_id, command).await == Flow::Close {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        self.broadcaster.unregister(conn_id);
        write_handle.abort();
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// 拆除 Agent：移除 listener，停止接受连接，关闭所有会话
    pub fn shutdown(&self) {
        {
            let mut phase = self.phase.write();
            if *phase == AgentPhase::TornDown {
                return;
            }
            *phase = AgentPhase::TornDown;
        }

        self.remove_listeners();
        self.broadcaster.close_all();
        self.shutdown.send_replace(true);
        tracing::info!("🛑 Agent shutting down");
    }

    /// 当前阶段
    pub fn phase(&self) -> AgentPhase {
        *self.phase.read()
    }

    /// 托管的实例
    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    /// 当前会话列表
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.broadcaster.sessions()
    }

    /// 手动触发变更通知
    ///
    /// 用于不支持原生变更通知的存储引擎：宿主在写入后自行调用。
    pub fn on_value_changed(&self, instance: &str, key: &str) {
        match self.stores.get(instance) {
            Some(store) => snapshot::emit_change(&self.broadcaster, instance, store.as_ref(), key),
            None => tracing::debug!("Ignoring change of unknown instance {}", instance),
        }
    }

    fn remove_listeners(&self) {
        let listeners: Vec<(String, ListenerId)> = self.listeners.lock().drain(..).collect();
        for (name, id) in listeners {
            if let Some(store) = self.stores.get(&name) {
                store.remove_listener(id);
            }
        }
    }

    /// 清理资源
    fn cleanup(&self) {
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        tracing::info!("🧹 Agent 清理完成");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.remove_listeners();
    }
}

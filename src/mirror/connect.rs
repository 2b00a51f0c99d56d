//! Mirror 客户端
//!
//! 连接 Agent、握手、接收消息并维护 [`MirrorState`]，
//! 本地编辑先乐观应用再发送命令。

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::state::{EntryRef, MirrorState};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::protocol::{decode_agent_message, encode_line, AgentMessage, MirrorCommand, Variant};

/// Mirror 配置
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// 连接配置
    pub bridge: BridgeConfig,
    /// 组件名称
    pub component: String,
    /// 组件版本
    pub version: String,
    /// Agent 的实例模式
    pub variant: Variant,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            component: "unknown".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            variant: Variant::Multi,
            connect_retries: 3,
            retry_interval_ms: 500,
        }
    }
}

impl MirrorConfig {
    /// 创建新的配置
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Default::default()
        }
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }
}

/// Mirror 客户端
pub struct MirrorClient {
    config: MirrorConfig,
    state: MirrorState,
    /// 写入端
    writer: OwnedWriteHalf,
    /// 已解码的 Agent 消息
    inbox: mpsc::Receiver<AgentMessage>,
}

impl MirrorClient {
    /// 连接 Agent 并握手，快照随后异步到达
    pub async fn connect(config: MirrorConfig) -> Result<Self> {
        let (writer, inbox) = open(&config).await?;
        let state = MirrorState::new(config.variant);
        Ok(Self {
            config,
            state,
            writer,
            inbox,
        })
    }

    /// 重新连接
    ///
    /// 保留当前镜像状态，新会话的快照以增量方式合并进来。
    pub async fn reconnect(&mut self) -> Result<()> {
        // 先应用旧连接上已到达的消息
        self.drain();

        let (writer, inbox) = open(&self.config).await?;
        self.writer = writer;
        self.inbox = inbox;
        tracing::info!("🔄 Mirror reconnected");
        Ok(())
    }

    /// 等待下一条消息并应用，连接关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        let message = self.inbox.recv().await?;
        self.state.apply_message(message.clone());
        Some(message)
    }

    /// 应用所有已到达的消息（不等待），返回应用的消息数
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.inbox.try_recv() {
            self.state.apply_message(message);
            applied += 1;
        }
        applied
    }

    /// 乐观写入并发送 set-value，返回是否发送了命令
    pub async fn set_value(&mut self, instance: &str, key: &str, value: &str) -> Result<bool> {
        let command = self.state.optimistic_set(instance, key, value);
        self.send(command).await
    }

    /// 乐观删除并发送 remove-key
    pub async fn remove_key(&mut self, instance: &str, key: &str) -> Result<bool> {
        let command = self.state.optimistic_delete_key(instance, key);
        self.send(command).await
    }

    /// 乐观清空并发送 remove-all
    pub async fn remove_all(&mut self, instance: &str) -> Result<bool> {
        let command = self.state.optimistic_clear_instance(instance);
        self.send(command).await
    }

    pub fn select_instance(&mut self, name: &str) -> bool {
        self.state.select_instance(name)
    }

    pub fn select_entry(&mut self, entry: Option<EntryRef>) -> bool {
        self.state.select_entry(entry)
    }

    /// 当前镜像状态
    pub fn state(&self) -> &MirrorState {
        &self.state
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// 发送命令（无确认，发送失败只意味着连接已断开）
    async fn send(&mut self, command: Option<MirrorCommand>) -> Result<bool> {
        let Some(command) = command else {
            return Ok(false);
        };

        let line = encode_line(&command)?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Connection(format!("failed to send {}: {}", command.kind(), e)))?;

        tracing::debug!("📤 Sent {}", command.kind());
        Ok(true)
    }
}

/// 建立连接：重试连接 → 发送 hello → 启动读取任务
async fn open(config: &MirrorConfig) -> Result<(OwnedWriteHalf, mpsc::Receiver<AgentMessage>)> {
    let socket_path = config.bridge.socket_path();
    let retries = config.connect_retries.max(1);

    let mut stream = None;
    for attempt in 1..=retries {
        match UnixStream::connect(&socket_path).await {
            Ok(s) => {
                tracing::debug!("连接 Agent 成功 (attempt={})", attempt);
                stream = Some(s);
                break;
            }
            Err(e) => {
                tracing::debug!("连接 Agent 失败 (attempt={}): {}", attempt, e);
                if attempt < retries {
                    sleep(Duration::from_millis(config.retry_interval_ms)).await;
                }
            }
        }
    }

    let stream = stream.ok_or_else(|| {
        Error::Connection(format!("Agent 不可达: {:?} ({} attempts)", socket_path, retries))
    })?;

    let (reader, mut writer) = stream.into_split();

    let hello = MirrorCommand::Hello {
        plugin_id: config.bridge.plugin_id.clone(),
        component: config.component.clone(),
        version: config.version.clone(),
    };
    writer.write_all(encode_line(&hello)?.as_bytes()).await?;

    let (tx, rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // 连接关闭
                Ok(_) => match decode_agent_message(&line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping agent message: {}", e);
                    }
                },
                Err(e) => {
                    tracing::debug!("读取失败: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("Mirror reader finished");
    });

    tracing::info!("🤝 Mirror connected: {:?}", socket_path);
    Ok((writer, rx))
}

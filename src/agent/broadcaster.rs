//! 会话广播器
//!
//! 维护连接会话列表，将存储变化推送给已完成握手的会话。
//!
//! 每个会话的发送队列不设上限：增量一旦丢失，镜像就无法自行修正。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{encode_line, KeyChange, Variant};

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::UnboundedSender<String>;

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// 已连接，等待 hello
    Pending,
    /// 正在生成快照，期间的增量暂存
    Bootstrapping,
    /// 已握手，接收快照与增量
    Active,
}

impl SessionPhase {
    /// 是否需要接收增量（直接发送或暂存）
    pub fn receives_changes(self) -> bool {
        matches!(self, SessionPhase::Bootstrapping | SessionPhase::Active)
    }
}

/// 会话信息（诊断用）
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub conn_id: ConnId,
    pub session_id: Uuid,
    pub phase: SessionPhase,
    pub component: Option<String>,
    pub connected_at: DateTime<Utc>,
}

struct Session {
    session_id: Uuid,
    sender: MessageSender,
    phase: SessionPhase,
    component: Option<String>,
    connected_at: DateTime<Utc>,
    /// 快照生成期间到达的增量，快照入队后按序补发
    backlog: Vec<String>,
}

/// 会话广播器
pub struct Broadcaster {
    /// 实例模式（决定增量消息是否携带 instanceName）
    variant: Variant,
    /// ConnId → 会话
    sessions: RwLock<HashMap<ConnId, Session>>,
    /// 下一个连接 ID
    next_conn_id: RwLock<ConnId>,
    /// 串行化「读取当前值 → 入队」，保证队列顺序与读取顺序一致
    delivery: Mutex<()>,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new(variant: Variant) -> Arc<Self> {
        Arc::new(Self {
            variant,
            sessions: RwLock::new(HashMap::new()),
            next_conn_id: RwLock::new(1),
            delivery: Mutex::new(()),
        })
    }

    /// 注册新连接，返回连接 ID
    pub fn register(&self, sender: MessageSender) -> ConnId {
        let mut next_id = self.next_conn_id.write();
        let conn_id = *next_id;
        *next_id += 1;

        let session_id = Uuid::new_v4();
        self.sessions.write().insert(
            conn_id,
            Session {
                session_id,
                sender,
                phase: SessionPhase::Pending,
                component: None,
                connected_at: Utc::now(),
                backlog: Vec::new(),
            },
        );

        tracing::debug!("📡 Session registered: conn_id={}, session_id={}", conn_id, session_id);
        conn_id
    }

    /// 握手开始：此后的增量先暂存，直到快照入队
    ///
    /// 必须在读取快照之前调用，这样读取期间发生的写入不会漏掉。
    pub fn begin_bootstrap(&self, conn_id: ConnId, component: &str) -> bool {
        match self.sessions.write().get_mut(&conn_id) {
            Some(session) => {
                session.phase = SessionPhase::Bootstrapping;
                session.component = Some(component.to_string());
                tracing::debug!("📡 Session bootstrapping: conn_id={}, component={}", conn_id, component);
                true
            }
            None => false,
        }
    }

    /// 握手完成：快照入队，补发暂存的增量，会话转为活跃
    ///
    /// 三步在同一把写锁内完成，广播无法插到快照前面。
    pub fn complete_bootstrap(&self, conn_id: ConnId, snapshot: String) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(&conn_id) else {
            return false;
        };
        if session.phase != SessionPhase::Bootstrapping {
            tracing::warn!("📡 Unexpected snapshot for conn_id={} in {:?}", conn_id, session.phase);
            return false;
        }

        let backlog = std::mem::take(&mut session.backlog);
        let flushed = backlog.len();
        let delivered = session.sender.send(snapshot).is_ok()
            && backlog.into_iter().all(|line| session.sender.send(line).is_ok());
        session.phase = SessionPhase::Active;

        tracing::debug!("📡 Session active: conn_id={}, backlog={}", conn_id, flushed);
        delivered
    }

    /// 测试辅助：跳过快照直接激活
    #[cfg(test)]
    pub(crate) fn activate(&self, conn_id: ConnId, component: &str) -> bool {
        match self.sessions.write().get_mut(&conn_id) {
            Some(session) => {
                session.phase = SessionPhase::Active;
                session.component = Some(component.to_string());
                true
            }
            None => false,
        }
    }

    /// 注销连接
    pub fn unregister(&self, conn_id: ConnId) {
        if self.sessions.write().remove(&conn_id).is_some() {
            tracing::debug!("📡 Session unregistered: conn_id={}", conn_id);
        }
    }

    /// 关闭所有会话（丢弃发送通道，写任务随之结束）
    pub fn close_all(&self) {
        let count = {
            let mut sessions = self.sessions.write();
            let count = sessions.len();
            sessions.clear();
            count
        };
        if count > 0 {
            tracing::debug!("📡 Closed {} sessions", count);
        }
    }

    /// 读取一次变化并广播
    ///
    /// `read` 在投递锁内执行：同一个 key 被并发写入时，
    /// 最后入队的增量一定携带最后读到的值。
    pub fn deliver_with<F>(&self, read: F)
    where
        F: FnOnce() -> Option<KeyChange>,
    {
        let _gate = self.delivery.lock();
        if let Some(change) = read() {
            self.broadcast(&change);
        }
    }

    /// 广播变化：活跃会话直接入队，握手中的会话暂存
    pub fn broadcast(&self, change: &KeyChange) {
        let message = match encode_line(&change.to_message(self.variant)) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize change: {}", e);
                return;
            }
        };

        let mut sessions = self.sessions.write();
        let mut delivered = 0;
        for (conn_id, session) in sessions.iter_mut() {
            match session.phase {
                SessionPhase::Pending => continue,
                SessionPhase::Bootstrapping => session.backlog.push(message.clone()),
                SessionPhase::Active => {
                    if session.sender.send(message.clone()).is_err() {
                        tracing::debug!("📡 Channel closed: conn_id={}", conn_id);
                        continue;
                    }
                }
            }
            delivered += 1;
        }

        if delivered == 0 {
            tracing::trace!("📡 No active session: key={}", change.key);
            return;
        }

        tracing::debug!(
            "📡 Broadcasting change: instance={}, key={}, deleted={}, sessions={}",
            change.instance,
            change.key,
            change.value.is_none(),
            delivered
        );
    }

    /// 当前连接数
    pub fn connection_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// 已握手的会话数
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.phase == SessionPhase::Active)
            .count()
    }

    /// 是否有会话需要接收增量
    pub fn has_receivers(&self) -> bool {
        self.sessions
            .read()
            .values()
            .any(|s| s.phase.receives_changes())
    }

    /// 指定连接的会话阶段
    pub fn phase(&self, conn_id: ConnId) -> Option<SessionPhase> {
        self.sessions.read().get(&conn_id).map(|s| s.phase)
    }

    /// 会话列表
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .iter()
            .map(|(conn_id, s)| SessionInfo {
                conn_id: *conn_id,
                session_id: s.session_id,
                phase: s.phase,
                component: s.component.clone(),
                connected_at: s.connected_at,
            })
            .collect();
        infos.sort_by_key(|info| info.conn_id);
        infos
    }
}

//! 桥接配置

use std::path::PathBuf;

/// 默认插件 ID（Agent 与 Mirror 握手时必须一致）
pub const DEFAULT_PLUGIN_ID: &str = "kv-inspector";

/// Socket 文件名
const SOCKET_FILE: &str = "kv-bridge.sock";

/// Agent 与 Mirror 共享的连接配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// 数据目录（socket 所在目录，默认 ~/.kv-bridge）
    pub data_dir: PathBuf,
    /// 插件 ID
    pub plugin_id: String,
}

impl BridgeConfig {
    /// 使用指定数据目录创建配置
    pub fn at<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            plugin_id: DEFAULT_PLUGIN_ID.to_string(),
        }
    }

    /// 从环境变量或默认路径创建配置
    ///
    /// - `KV_BRIDGE_DIR`: 数据目录
    /// - `KV_BRIDGE_PLUGIN_ID`: 插件 ID
    pub fn from_env() -> Self {
        let data_dir = match std::env::var("KV_BRIDGE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".kv-bridge"),
        };

        let plugin_id = std::env::var("KV_BRIDGE_PLUGIN_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_PLUGIN_ID.to_string());

        Self { data_dir, plugin_id }
    }

    /// 设置插件 ID
    pub fn with_plugin_id(mut self, plugin_id: &str) -> Self {
        self.plugin_id = plugin_id.to_string();
        self
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join(SOCKET_FILE)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

//! 設定モジュール（YAML 読み込み + 環境変数オーバーライド）
//!
//! `GatewayConfig` は環境変数が指すYAMLファイルを読み込み、
//! 未設定の項目には組み込みのデフォルト値を適用します。
//! `PORT` はファイル設定より優先されます。
mod error;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub use error::ConfigError;

/// 設定ファイルのパスを指す環境変数名
pub const CONFIG_PATH_ENV: &str = "TRANSCRIBE_GATEWAY_CONFIG";

/// 待ち受けポートを上書きする環境変数名
pub const PORT_ENV: &str = "PORT";

/// すべての設定をひとまとめにした構造体
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub transcriber: TranscriberConfig,
    pub usage: UsageConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 待ち受けポート（例: 3000）
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// 全ユーザー横断の同時実行タスク数上限
    pub max_concurrent: usize,
    /// 1パケットあたりの処理期限（ミリ秒）
    pub task_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// 1ワードとみなすペイロードのバイト数
    pub bytes_per_word: usize,
    /// 1ワードあたりの処理コスト（ミリ秒）
    pub ms_per_word: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// 既知ユーザーに割り当てる初期予算（ミリ秒）
    pub initial_budget_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearerトークン → ユーザーID の静的マッピング
    pub tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            task_timeout_ms: 60_000,
        }
    }
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            bytes_per_word: 16_000,
            ms_per_word: 250,
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            initial_budget_ms: 1_000,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        // 開発用の組み込みマッピング。運用では設定ファイルで差し替える。
        let mut tokens = HashMap::new();
        tokens.insert("a".to_string(), "1".to_string());
        tokens.insert("b".to_string(), "2".to_string());
        Self { tokens }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            dispatch: DispatchConfig::default(),
            transcriber: TranscriberConfig::default(),
            usage: UsageConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// YAMLファイルから設定を読み込み
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse { path, source })
    }

    /// 環境変数（未設定時は組み込みデフォルト）から設定を読み込み
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(PathBuf::from(path))?,
            Err(_) => Self::default(),
        };

        if let Ok(raw) = std::env::var(PORT_ENV) {
            config.server.port = raw
                .parse()
                .map_err(|_| ConfigError::InvalidPort { value: raw })?;
        }

        Ok(config)
    }

    /// トークンマップに登場する全ユーザーID
    pub fn known_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.auth.tokens.values().cloned().collect();
        users.sort();
        users.dedup();
        users
    }
}

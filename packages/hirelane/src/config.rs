use anyhow::{Context, Result};
use hirelane_realtime::{ChatConfig, RealtimeConfig, ReconnectPolicy};
use hirelane_session::{SessionClient, TokenStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [api]
//                    base_url = "https://hirelane.example/api"
//
//   env var:         HIRELANE_API__BASE_URL=https://hirelane.example/api
//
//   (single underscore stays within field names: HIRELANE_CHAT__PAGE_SIZE)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
    #[serde(default)]
    pub chat: ChatFileConfig,
}

/// REST API settings (lives under `[api]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Login route the user is sent to when the session cannot be renewed.
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            login_path: default_login_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Credential handling (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Refresh proactively once the token expires within this many seconds.
    #[serde(default = "default_refresh_lookahead_secs")]
    pub refresh_lookahead_secs: u64,
    /// Keep the token in the data directory between runs.
    #[serde(default = "default_persist_token")]
    pub persist_token: bool,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            refresh_lookahead_secs: default_refresh_lookahead_secs(),
            persist_token: default_persist_token(),
        }
    }
}

/// Realtime socket settings (lives under `[realtime]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    #[serde(default = "default_realtime_url")]
    pub url: String,
    /// 0 disables automatic reconnection.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            url: default_realtime_url(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

/// Chat view settings (lives under `[chat]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatFileConfig {
    #[serde(default = "default_typing_idle_ms")]
    pub typing_idle_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ChatFileConfig {
    fn default() -> Self {
        Self {
            typing_idle_ms: default_typing_idle_ms(),
            page_size: default_page_size(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}
fn default_login_path() -> String {
    "/login".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_refresh_lookahead_secs() -> u64 {
    300
}
fn default_persist_token() -> bool {
    true
}
fn default_realtime_url() -> String {
    "ws://127.0.0.1:8000/socket".to_string()
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    5000
}
fn default_typing_idle_ms() -> u64 {
    3000
}
fn default_page_size() -> u32 {
    50
}

/// Build a figment that layers: defaults → config.toml → HIRELANE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HIRELANE_API__BASE_URL=...`  →  `api.base_url = ...`
///   `HIRELANE_REALTIME__RECONNECT_ATTEMPTS=0`  →  `realtime.reconnect_attempts = 0`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("HIRELANE_").split("__"))
}

impl FileConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let rt = &self.realtime;
        if rt.reconnect_attempts == 0 {
            return ReconnectPolicy::disabled();
        }
        ReconnectPolicy {
            max_attempts: rt.reconnect_attempts,
            initial_delay: Duration::from_millis(rt.reconnect_delay_ms),
            max_delay: Duration::from_millis(rt.reconnect_max_delay_ms.max(rt.reconnect_delay_ms)),
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig::new(&self.realtime.url).with_reconnect(self.reconnect_policy())
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            typing_idle: Duration::from_millis(self.chat.typing_idle_ms),
            ..ChatConfig::default()
        }
    }

    fn refresh_lookahead(&self) -> chrono::Duration {
        let secs = self.session.refresh_lookahead_secs.min(86_400);
        chrono::Duration::seconds(secs as i64)
    }
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HirelaneConfig {
    pub data_dir: PathBuf,
    pub file: FileConfig,
}

impl HirelaneConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".hirelane"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let file: FileConfig = load_config(&data_dir)
            .extract()
            .context("Invalid configuration")?;

        debug!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, file })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn session_token_path(&self) -> PathBuf {
        self.data_dir.join("session.token")
    }

    pub fn token_store(&self) -> TokenStore {
        let path = self
            .file
            .session
            .persist_token
            .then(|| self.session_token_path());
        TokenStore::new(path, self.file.refresh_lookahead())
    }

    pub fn session_client(&self) -> Result<SessionClient> {
        let api = &self.file.api;
        SessionClient::builder(&api.base_url)
            .token_store(self.token_store())
            .login_path(&api.login_path)
            .timeout(Duration::from_secs(api.request_timeout_secs))
            .build()
            .with_context(|| format!("Failed to build HTTP client for {}", api.base_url))
    }
}

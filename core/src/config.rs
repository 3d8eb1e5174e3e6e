//! Configuration for RideChat Core

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ws_path: String,
    pub inbound_destination: String,
    pub send_destination: String,
    pub read_destination: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Publishes queued while offline; the oldest is dropped past this.
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub page_size: u32,
    pub unread_poll_secs: u64,
    pub directory_refresh_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_path: "/ws".to_string(),
            inbound_destination: "/user/queue/messages".to_string(),
            send_destination: "/app/chat.send".to_string(),
            read_destination: "/app/chat.read".to_string(),
            reconnect_delay_ms: 5000,
            handshake_timeout_ms: 10_000,
            max_pending: 100,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            unread_poll_secs: 30,
            directory_refresh_secs: 60,
        }
    }
}

impl ChatConfig {
    pub fn unread_poll_interval(&self) -> Duration {
        Duration::from_secs(self.unread_poll_secs.max(1))
    }

    pub fn directory_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.directory_refresh_secs.max(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 8080,
                use_tls: false,
            },
            transport: TransportConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server: ServerConfig {
                host: host.to_string(),
                port,
                use_tls,
            },
            ..Self::default()
        }
    }

    /// Load from a JSON file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn http_url(&self) -> Result<Url> {
        let scheme = if self.server.use_tls { "https" } else { "http" };
        Ok(Url::parse(&format!(
            "{}://{}:{}",
            scheme, self.server.host, self.server.port
        ))?)
    }

    pub fn ws_url(&self) -> Result<Url> {
        let scheme = if self.server.use_tls { "wss" } else { "ws" };
        Ok(Url::parse(&format!(
            "{}://{}:{}{}",
            scheme, self.server.host, self.server.port, self.transport.ws_path
        ))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_follow_tls_flag() {
        let plain = ClientConfig::new("chat.local", 8080, false);
        assert_eq!(plain.http_url().unwrap().as_str(), "http://chat.local:8080/");
        assert_eq!(plain.ws_url().unwrap().as_str(), "ws://chat.local:8080/ws");

        let tls = ClientConfig::new("chat.local", 8443, true);
        assert_eq!(tls.ws_url().unwrap().scheme(), "wss");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"server":{"host":"h","port":1,"use_tls":false},"chat":{"page_size":20}}"#,
        )
        .unwrap();
        assert_eq!(config.chat.page_size, 20);
        assert_eq!(config.chat.unread_poll_secs, 30);
        assert_eq!(config.transport.send_destination, "/app/chat.send");
        assert_eq!(config.transport.reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_gives_defaults_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ridechat").join("config.json");

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 8080);

        let mut changed = loaded.clone();
        changed.server.host = "rides.example.com".to_string();
        changed.save(&path).unwrap();
        assert_eq!(ClientConfig::load(&path).unwrap().server.host, "rides.example.com");
    }
}

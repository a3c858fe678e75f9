use serde::Deserialize;
use std::path::PathBuf;

use crate::events::DEFAULT_QUEUE_LIMIT;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub computer: ComputerConfig,
    pub filesystem: FilesystemConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ComputerConfig {
    #[serde(default)]
    pub id: u32,
    pub label: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConfig {
    /// Host directory backing the sandbox root. Supports ${ENV_VAR} substitution
    pub root: PathBuf,
    /// Byte limit for the root mount; absent means unlimited
    pub capacity: Option<u64>,
    /// Host directory mounted read-only at "rom"
    pub rom: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClockConfig {
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_limit: default_queue_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebsocketConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Simultaneous open websockets; 0 means no limit
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Host patterns scripts may connect to
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_connections: default_max_connections(),
            allowed_hosts: default_allowed_hosts(),
        }
    }
}

fn default_tick_millis() -> u64 {
    50
}

fn default_queue_limit() -> usize {
    DEFAULT_QUEUE_LIMIT
}

fn default_enabled() -> bool {
    true
}

fn default_max_connections() -> usize {
    4
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["*".to_string()]
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${BRIDGE_DATA}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

impl WebsocketConfig {
    /// Checks if scripts may open a websocket to `host`.
    ///
    /// Patterns are exact host names (case-insensitive), `*` for any
    /// host, or `*.suffix` for any subdomain of `suffix`.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_hosts.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            if pattern == "*" {
                true
            } else if let Some(suffix) = pattern.strip_prefix("*.") {
                host.ends_with(&format!(".{suffix}"))
            } else {
                pattern == host
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to build a WebsocketConfig with specific allowed_hosts
    fn config_with_hosts(hosts: Vec<&str>) -> WebsocketConfig {
        WebsocketConfig {
            allowed_hosts: hosts.into_iter().map(String::from).collect(),
            ..WebsocketConfig::default()
        }
    }

    #[test]
    fn test_is_allowed_exact_host() {
        let config = config_with_hosts(vec!["example.com"]);
        assert!(config.is_allowed("example.com"));
        assert!(config.is_allowed("EXAMPLE.com"));
    }

    #[test]
    fn test_is_allowed_rejects_unlisted() {
        let config = config_with_hosts(vec!["example.com"]);
        assert!(!config.is_allowed("evil.com"));
        assert!(!config.is_allowed("sub.example.com"));
    }

    #[test]
    fn test_is_allowed_wildcard() {
        let config = config_with_hosts(vec!["*"]);
        assert!(config.is_allowed("anything.org"));
        assert!(config.is_allowed("127.0.0.1"));
    }

    #[test]
    fn test_is_allowed_subdomain_wildcard() {
        let config = config_with_hosts(vec!["*.example.com"]);
        assert!(config.is_allowed("ws.example.com"));
        assert!(!config.is_allowed("example.com"));
        assert!(!config.is_allowed("badexample.com"));
    }

    #[test]
    fn test_is_allowed_empty_list_rejects_all() {
        let config = config_with_hosts(vec![]);
        assert!(!config.is_allowed("example.com"));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [filesystem]
            root = "./data/computer/0"
            "#,
        )
        .unwrap();
        assert_eq!(config.computer.id, 0);
        assert_eq!(config.computer.label, None);
        assert_eq!(config.filesystem.capacity, None);
        assert_eq!(config.clock.tick_millis, 50);
        assert_eq!(config.events.queue_limit, 256);
        assert!(config.websocket.enabled);
        assert_eq!(config.websocket.max_connections, 4);
        assert_eq!(config.websocket.allowed_hosts, vec!["*"]);
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [computer]
            id = 7
            label = "turtle"

            [filesystem]
            root = "/srv/computer/7"
            capacity = 1000000
            rom = "/srv/rom"

            [clock]
            tick_millis = 100

            [events]
            queue_limit = 32

            [websocket]
            enabled = false
            max_connections = 1
            allowed_hosts = ["*.example.com"]
            "#,
        )
        .unwrap();
        assert_eq!(config.computer.id, 7);
        assert_eq!(config.computer.label.as_deref(), Some("turtle"));
        assert_eq!(config.filesystem.capacity, Some(1_000_000));
        assert_eq!(config.filesystem.rom, Some(PathBuf::from("/srv/rom")));
        assert_eq!(config.clock.tick_millis, 100);
        assert_eq!(config.events.queue_limit, 32);
        assert!(!config.websocket.enabled);
        assert!(config.websocket.is_allowed("a.example.com"));
    }

    #[test]
    fn test_missing_filesystem_is_an_error() {
        assert!(toml::from_str::<Config>("[computer]\nid = 1\n").is_err());
    }

    #[test]
    fn test_load_expands_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::env::set_var("COMPUTER_BRIDGE_TEST_ROOT", "/tmp/bridge-root");
        std::fs::write(&path, "[filesystem]\nroot = \"${COMPUTER_BRIDGE_TEST_ROOT}/0\"\n").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.filesystem.root, PathBuf::from("/tmp/bridge-root/0"));
    }
}

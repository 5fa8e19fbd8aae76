//! Process configuration for the two roles.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Fallback for every name-like default.
pub fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "outpost".to_owned())
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/tmp/outpost/storage")
}

/// Configuration of the cloud-side server.
#[derive(Args, Clone, Debug)]
pub struct ServerConfig {
    /// Port the HTTP API listens on.
    #[arg(long, env = "OUTPOST_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Instance name echoed to clients for proxy pinning. Defaults to the
    /// hostname.
    #[arg(long, env = "OUTPOST_INSTANCE")]
    pub instance: Option<String>,

    /// Directory of the embedded storage.
    #[arg(long, env = "OUTPOST_STORAGE", default_value = "/tmp/outpost/storage")]
    pub storage: PathBuf,

    /// Ids per server-sent-event message on the data stream.
    #[arg(long, env = "OUTPOST_PAGE_SIZE", default_value_t = 11)]
    pub page_size: usize,

    /// Ids per manifest page.
    #[arg(long, env = "OUTPOST_MANIFEST_LIMIT", default_value_t = 100)]
    pub manifest_limit: usize,

    /// Seconds between dataset compaction passes.
    #[arg(long, env = "OUTPOST_GC_INTERVAL_SECS", default_value_t = 1800)]
    pub gc_interval_secs: u64,

    /// Seconds between resource discovery passes.
    #[arg(long, env = "OUTPOST_SCHED_INTERVAL_SECS", default_value_t = 60)]
    pub sched_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 3000,
            instance: None,
            storage: default_storage_path(),
            page_size: 11,
            manifest_limit: 100,
            gc_interval_secs: 1800,
            sched_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn instance_name(&self) -> String {
        self.instance.clone().unwrap_or_else(default_hostname)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn sched_interval(&self) -> Duration {
        Duration::from_secs(self.sched_interval_secs)
    }
}

/// Configuration of an edge agent.
#[derive(Args, Clone, Debug)]
pub struct AgentConfig {
    /// Agent name; must match the node object the server authorises
    /// against. Defaults to the hostname.
    #[arg(long, env = "OUTPOST_NAME")]
    pub name: Option<String>,

    /// Base URL of the server, e.g. `http://cloud:3000`.
    #[arg(long, env = "OUTPOST_SERVER")]
    pub server: String,

    /// Directory of the embedded storage.
    #[arg(long, env = "OUTPOST_STORAGE", default_value = "/tmp/outpost/storage")]
    pub storage: PathBuf,

    /// Seconds to wait between polls when fully caught up.
    #[arg(long, env = "OUTPOST_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,
}

impl AgentConfig {
    pub fn agent_name(&self) -> String {
        self.name.clone().unwrap_or_else(default_hostname)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_the_documented_surface() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.page_size, 11);
        assert_eq!(config.manifest_limit, 100);
        assert_eq!(config.gc_interval(), Duration::from_secs(1800));
        assert_eq!(config.storage, PathBuf::from("/tmp/outpost/storage"));
    }

    #[test]
    fn names_fall_back_to_the_hostname() {
        let config = ServerConfig::default();
        assert!(!config.instance_name().is_empty());
    }
}

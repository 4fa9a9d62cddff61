use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use lxp_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7878))
}

/// Server settings, usually loaded from a TOML file:
///
/// ```toml
/// bind_addr = "127.0.0.1:7878"
///
/// [store]
/// root = "/var/lib/lxp"
/// sync = "every-write"
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    pub store: StoreConfig,
}

impl ServerConfig {
    /// Serve the store at `root` on the default address.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store: StoreConfig::new(root),
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn from_toml(source: &str) -> ServerResult<Self> {
        toml::from_str(source).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> ServerResult<Self> {
        let source = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxp_store::SyncMode;

    #[test]
    fn defaults() {
        let c = ServerConfig::new("/tmp/lxp");
        assert_eq!(c.bind_addr, "127.0.0.1:7878".parse::<SocketAddr>().unwrap());
        assert_eq!(c.store.root, PathBuf::from("/tmp/lxp"));
        assert_eq!(c.store.sync, SyncMode::OsDefault);
    }

    #[test]
    fn parse_toml() {
        let c = ServerConfig::from_toml(
            r#"
            bind_addr = "0.0.0.0:9000"

            [store]
            root = "/data"
            sync = "every-write"
            "#,
        )
        .unwrap();
        assert_eq!(c.bind_addr.port(), 9000);
        assert_eq!(c.store.sync, SyncMode::EveryWrite);
    }

    #[test]
    fn store_section_is_required() {
        assert!(matches!(
            ServerConfig::from_toml(r#"bind_addr = "0.0.0.0:9000""#),
            Err(ServerError::Config(_))
        ));
    }
}

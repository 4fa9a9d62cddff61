use lxp_store::Store;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::AppState;
use crate::router::build_router;

/// LXP store server.
pub struct LxpServer {
    config: ServerConfig,
    store: Store,
}

impl LxpServer {
    /// Serve an already opened store.
    pub fn new(config: ServerConfig, store: Store) -> Self {
        Self { config, store }
    }

    /// Open the store named by `config.store` and serve it.
    pub fn open(config: ServerConfig) -> ServerResult<Self> {
        let store = Store::open(config.store.clone())?;
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(AppState {
            store: self.store.clone(),
        })
    }

    /// Start serving requests.
    pub async fn serve(self) -> ServerResult<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!(
            addr = %self.config.bind_addr,
            root = %self.store.root().display(),
            "LXP server listening"
        );
        axum::serve(listener, app)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }
}

//! Collaborators of a director process

use crate::config::DirectorConfig;
use armada_infra::{AgentFactory, Cloud, NoopTicker, RetryingAgentFactory, Ticker};
use armada_lock::{LeaseStore, LockManager};
use armada_store::Store;
use armada_update::UpdateContext;
use std::sync::Arc;

/// Store, cloud, agents, locks and settings, threaded through every deploy
#[derive(Clone)]
pub struct DirectorContext {
    pub store: Store,
    pub cloud: Arc<dyn Cloud>,
    /// Agent clients, already retrying idempotent calls on timeout
    pub agents: Arc<dyn AgentFactory>,
    pub locks: LockManager,
    pub ticker: Arc<dyn Ticker>,
    pub config: DirectorConfig,
}

impl DirectorContext {
    pub fn new(
        store: Store,
        cloud: Arc<dyn Cloud>,
        agents: Arc<dyn AgentFactory>,
        leases: Arc<dyn LeaseStore>,
        config: DirectorConfig,
    ) -> Self {
        let agents: Arc<dyn AgentFactory> =
            Arc::new(RetryingAgentFactory::new(agents, config.agent.retries));
        Self {
            store,
            cloud,
            agents,
            locks: LockManager::new(leases, config.lock),
            ticker: Arc::new(NoopTicker),
            config,
        }
    }

    pub fn with_ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = ticker;
        self
    }

    /// Context for the update stages of one deploy
    pub fn update_context(&self) -> UpdateContext {
        UpdateContext::new(self.store.clone(), self.cloud.clone(), self.agents.clone())
            .with_settings(self.config.update_settings())
            .with_ticker(self.ticker.clone())
    }
}

impl std::fmt::Debug for DirectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

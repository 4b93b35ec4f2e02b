use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::trading::supervisor::BotSupervisor;

/// Process-wide map of running supervisors, keyed by config id.
#[derive(Clone, Default)]
pub struct SupervisorRegistry {
    supervisors: Arc<RwLock<HashMap<Uuid, Arc<BotSupervisor>>>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a supervisor, replacing and stopping any previous one for
    /// the same config on a detached task.
    pub async fn add(&self, config_id: Uuid, supervisor: Arc<BotSupervisor>) {
        let mut supervisors = self.supervisors.write().await;
        if let Some(old) = supervisors.insert(config_id, supervisor) {
            warn!(
                "Replacing existing supervisor for config {}, stopping the old one",
                config_id
            );
            tokio::spawn(async move {
                old.stop().await;
            });
        } else {
            info!("✅ Supervisor registered for config {}", config_id);
        }
    }

    pub async fn get(&self, config_id: Uuid) -> Option<Arc<BotSupervisor>> {
        self.supervisors.read().await.get(&config_id).cloned()
    }

    pub async fn remove(&self, config_id: Uuid) -> Option<Arc<BotSupervisor>> {
        let removed = self.supervisors.write().await.remove(&config_id);
        if removed.is_some() {
            info!("Supervisor removed for config {}", config_id);
        }
        removed
    }

    pub async fn get_all(&self) -> Vec<Arc<BotSupervisor>> {
        self.supervisors.read().await.values().cloned().collect()
    }

    /// Stops every supervisor with a bounded wait each, then clears the map.
    /// Invoked on process shutdown.
    pub async fn stop_all(&self, timeout: Duration) {
        let supervisors: Vec<_> = {
            let mut map = self.supervisors.write().await;
            map.drain().collect()
        };

        for (config_id, supervisor) in supervisors {
            if tokio::time::timeout(timeout, supervisor.stop()).await.is_err() {
                warn!("Supervisor {} did not stop within {:?}", config_id, timeout);
            }
        }
        info!("All supervisors stopped");
    }
}

/// Last seen price per symbol, written by every supervisor's ticker loop
/// and read by the HTTP layer for unrealized-profit computation.
#[derive(Clone, Default)]
pub struct PriceCache {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    pub async fn get(&self, symbol: &str) -> Option<Decimal> {
        self.prices.read().await.get(symbol).copied()
    }
}

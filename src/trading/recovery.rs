use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::db::models::{BotConfig, CycleStatus, DcaCycle, OrderStatus};
use crate::db::repository;
use crate::errors::{BotError, Result};
use crate::exchange::types::ExchangeOrderStatus;
use crate::exchange::Exchange;
use crate::trading::order_handler::OrderLifecycle;
use crate::trading::supervisor::BotEngine;
use crate::trading::types::RecoveryStats;

/// Reconciles in-flight bots with the exchange after a restart, replaying
/// fills that landed while the process was down, then hands each bot to a
/// fresh supervisor.
pub struct BotRecoveryService {
    engine: BotEngine,
}

impl BotRecoveryService {
    pub fn new(engine: BotEngine) -> Self {
        Self { engine }
    }

    /// Runs once at startup, before any supervisor. A failure in one bot
    /// deactivates that bot and moves on to the next.
    pub async fn recover_all_active_bots(&self) -> RecoveryStats {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut recovered = 0;
        let mut failed = 0;

        info!("🔁 Bot recovery starting");

        let configs = match self.engine.db().find_active_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Could not enumerate active configs: {}", e);
                return RecoveryStats {
                    recovered,
                    failed,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    started_at,
                };
            }
        };

        if configs.is_empty() {
            info!("No active bots found, nothing to recover");
            return RecoveryStats {
                recovered,
                failed,
                duration_seconds: started.elapsed().as_secs_f64(),
                started_at,
            };
        }

        info!("Found {} active bot(s) to recover", configs.len());

        for config in configs {
            match self.recover_single_bot(&config).await {
                Ok(()) => recovered += 1,
                Err(e) => {
                    error!("Failed to recover bot {}: {}", config.id, e);
                    failed += 1;
                    if let Err(db_err) =
                        self.engine.db().set_config_active(config.id, false).await
                    {
                        error!("Could not deactivate bot {}: {}", config.id, db_err);
                    } else {
                        warn!("Bot {} deactivated after recovery failure", config.id);
                    }
                }
            }
        }

        let stats = RecoveryStats {
            recovered,
            failed,
            duration_seconds: started.elapsed().as_secs_f64(),
            started_at,
        };
        info!(
            "Bot recovery completed in {:.2}s — recovered: {}, failed: {}",
            stats.duration_seconds, stats.recovered, stats.failed
        );
        stats
    }

    async fn recover_single_bot(&self, config: &BotConfig) -> Result<()> {
        info!(
            "Recovering bot {}: symbol={}, budget={}",
            config.id, config.symbol, config.total_budget
        );

        let Some(cycle) = self.engine.db().find_open_cycle(config.id).await? else {
            info!("No open cycle for bot {}, starting fresh", config.id);
            self.engine.start_first_cycle(config).await?;
            return Ok(());
        };

        info!(
            "Found open cycle {}: avg_price={}, spent={}",
            cycle.id, cycle.avg_price, cycle.total_quote_spent
        );

        let exchange = self.engine.exchange_for(config)?;
        let sync_result = self.sync_orders_with_exchange(config, &cycle, exchange.clone()).await;
        exchange.close().await;
        sync_result?;

        let cycle = self
            .engine
            .db()
            .get_cycle(cycle.id)
            .await?
            .ok_or_else(|| BotError::recovery(format!("cycle {} disappeared", cycle.id)))?;

        if cycle.status == CycleStatus::Closed {
            info!("Cycle {} closed during downtime, starting fresh", cycle.id);
            self.engine.start_first_cycle(config).await?;
        } else {
            self.engine.resume_bot(config).await?;
        }

        info!("Bot {} recovered", config.id);
        Ok(())
    }

    /// Compares locally in-flight orders against the exchange: replays
    /// missed fills through the normal fill handler (which may cascade
    /// into closing the cycle) and cancels rows the exchange dropped.
    async fn sync_orders_with_exchange(
        &self,
        config: &BotConfig,
        cycle: &DcaCycle,
        exchange: Arc<dyn Exchange>,
    ) -> Result<()> {
        let local_orders = self.engine.db().find_inflight_orders(cycle.id).await?;
        if local_orders.is_empty() {
            info!("No in-flight local orders to sync for cycle {}", cycle.id);
            return Ok(());
        }
        info!("Syncing {} local orders with the exchange", local_orders.len());

        let open_ids: HashSet<String> = exchange
            .fetch_open_orders(&config.symbol)
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();

        let handler = OrderLifecycle::new(self.engine.db().clone(), exchange.clone());

        for local_order in local_orders {
            let Some(exchange_id) = local_order.exchange_order_id.clone() else {
                warn!("Order {} has no exchange id, skipping", local_order.id);
                continue;
            };

            if open_ids.contains(&exchange_id) {
                info!("Order {} still open on the exchange", exchange_id);
                continue;
            }

            match exchange.fetch_order(&exchange_id, &config.symbol).await {
                Ok(remote) if remote.status == ExchangeOrderStatus::Closed => {
                    info!("Order {} filled during downtime, replaying", exchange_id);
                    handler.handle_fill(&remote).await?;
                }
                Ok(remote) if remote.status == ExchangeOrderStatus::Open => {
                    // Reappeared between the open-orders snapshot and this
                    // fetch; the live stream handles it once attached.
                    info!("Order {} open again on re-fetch", remote.id);
                }
                Ok(remote) => {
                    info!("Order {} is {:?}, marking canceled", exchange_id, remote.status);
                    let mut conn = self.engine.db().pool().acquire().await?;
                    repository::update_order_status(&mut conn, local_order.id, OrderStatus::Canceled)
                        .await?;
                }
                Err(e) => {
                    error!("Could not fetch order {}: {}", exchange_id, e);
                    let mut conn = self.engine.db().pool().acquire().await?;
                    repository::update_order_status(&mut conn, local_order.id, OrderStatus::Canceled)
                        .await?;
                }
            }
        }

        info!("Order sync completed for cycle {}", cycle.id);
        Ok(())
    }
}

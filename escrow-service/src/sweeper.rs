use crate::error::EscrowResult;
use crate::reconciliation::{ReconcileOutcome, ReconciliationEngine};
use crate::state_machine::OrderStatus;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::time;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub settled: usize,
    pub still_pending: usize,
    pub auto_released: usize,
}

/// Catches what callbacks missed: transactions waiting too long are queried, orders
/// nobody confirmed within the release window are completed.
pub struct TimeoutSweeper {
    engine: Arc<ReconciliationEngine>,
}

impl TimeoutSweeper {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.engine.config().sweep_interval);

        loop {
            interval.tick().await;

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report != SweepReport::default() => {
                    info!(
                        polled = report.polled,
                        settled = report.settled,
                        still_pending = report.still_pending,
                        auto_released = report.auto_released,
                        "sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Error sweeping stale transactions: {}", e),
            }
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> EscrowResult<SweepReport> {
        let config = self.engine.config();
        let mut report = SweepReport::default();

        let cutoff = now - to_chrono(config.callback_timeout);
        let stale = self
            .engine
            .ledger()
            .stale_pending(cutoff, config.sweep_batch_size)
            .await?;
        report.polled = stale.len();

        let results = join_all(stale.iter().map(|tx| self.engine.poll_transaction(tx))).await;
        for (tx, result) in stale.iter().zip(results) {
            match result {
                Ok(ReconcileOutcome::Settled { .. }) | Ok(ReconcileOutcome::AlreadySettled { .. }) => {
                    report.settled += 1
                }
                Ok(_) => report.still_pending += 1,
                Err(e) => {
                    report.still_pending += 1;
                    warn!(transaction_id = %tx.id, "poll failed: {}", e);
                }
            }
        }

        if let Some(window) = config.auto_release_after {
            let idle_since = now - to_chrono(window);
            let idle = self
                .engine
                .orders()
                .idle_since(
                    &[OrderStatus::Shipped, OrderStatus::Delivered],
                    idle_since,
                    config.sweep_batch_size,
                )
                .await?;

            for order in idle {
                match self.engine.auto_release(order.id).await {
                    Ok(_) => {
                        report.auto_released += 1;
                        info!(order_id = %order.id, "order auto-released");
                    }
                    Err(e) => warn!(order_id = %order.id, "auto-release failed: {}", e),
                }
            }
        }

        Ok(report)
    }
}

fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::weeks(5200))
}

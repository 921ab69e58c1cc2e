//! Built-in trigger loop. Production deployments usually call the cron
//! endpoint from an external scheduler instead; this loop exists for
//! single-process setups and runs the exact same batch.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::dispatch::Dispatcher;

/// Run `run_batch` every `interval_secs` until `shutdown` flips to `true`.
pub async fn run_chase_loop(
    dispatcher: Arc<Dispatcher>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = std::time::Duration::from_secs(interval_secs.max(1));
    tracing::info!("⏰ Chase loop started (every {}s)", period.as_secs());

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match dispatcher.run_batch(Utc::now()).await {
            Ok(report) if report.fetched > 0 => {
                tracing::debug!("Chase loop tick: {}", report.summary());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Chase loop batch failed: {e}"),
        }
    }
    tracing::info!("⏹️ Chase loop stopped");
}

/// Spawn the loop on the runtime. Dropping or signalling the returned sender stops it.
pub fn spawn_chase_loop(
    dispatcher: Arc<Dispatcher>,
    interval_secs: u64,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(run_chase_loop(dispatcher, interval_secs, rx));
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Collaborators, DispatchSettings};
    use crate::limits::PlanLimiter;
    use crate::memory::{MemoryMailer, MemoryStore};
    use chaser_core::{BusinessClock, Invoice, InvoiceStatus, PlanLimitTable};

    #[tokio::test]
    async fn test_loop_sends_then_stops() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(MemoryMailer::new());
        store.upsert_invoice(Invoice {
            id: "inv-1".into(),
            tenant_id: "t-1".into(),
            customer_email: "ap@customer.test".into(),
            customer_name: None,
            invoice_number: None,
            amount_cents: 100,
            currency: "USD".into(),
            due_at: Some(Utc::now() - chrono::Duration::days(2)),
            status: InvoiceStatus::Pending,
            payment_link: None,
        });
        let dispatcher = Arc::new(Dispatcher::new(
            Collaborators::from_store(store.clone(), mailer.clone()),
            BusinessClock::default(),
            PlanLimiter::new(PlanLimitTable::default(), false).unwrap(),
            DispatchSettings::default(),
        ));

        let (stop, handle) = spawn_chase_loop(dispatcher, 1);
        // The first tick fires immediately.
        for _ in 0..50 {
            if !mailer.sent().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        stop.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(mailer.sent().len(), 1);
    }
}

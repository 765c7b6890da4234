//! Outbox event relay: the only path from durable lifecycle events to
//! in-process subscribers.
//!
//! A single relay instance per deployment polls the outbox, claims due rows
//! in batches, invokes every matching subscriber synchronously, and settles
//! each row: `published` on success, `pending` with backoff on failure,
//! `dead` after the attempt cap. A separate sweep re-reaps rows stuck in
//! `claimed` by a crashed instance. Delivery is at-least-once; subscribers
//! must be idempotent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use fm_config::settings::RelaySettings;
use fm_db::outbox::{self, OutboxEventRow};
use fm_schemas::events::EventEnvelope;
use rand::Rng;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod pattern;

pub use pattern::pattern_matches;

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Synchronous event handler. A returned error marks the delivery failed and
/// the row is retried; handlers see duplicates under crash recovery.
pub type Handler = Arc<dyn Fn(&EventEnvelope) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(usize);

/// Pattern → handler registry. Registration normally happens once at
/// composition time; the lock is uncontended after that.
#[derive(Default)]
pub struct SubscriberRegistry {
    subs: RwLock<Vec<(SubscriptionId, String, Handler)>>,
    next_id: AtomicUsize,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, pattern: impl Into<String>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subs
            .write()
            .expect("subscriber registry poisoned")
            .push((id, pattern.into(), handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subs
            .write()
            .expect("subscriber registry poisoned")
            .retain(|(sid, _, _)| *sid != id);
    }

    fn matching(&self, event_type: &str) -> Vec<Handler> {
        self.subs
            .read()
            .expect("subscriber registry poisoned")
            .iter()
            .filter(|(_, pattern, _)| pattern_matches(pattern, event_type))
            .map(|(_, _, h)| Arc::clone(h))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead: usize,
}

pub struct Relay {
    pool: PgPool,
    settings: RelaySettings,
    registry: Arc<SubscriberRegistry>,
    instance: String,
}

pub struct RelayHandle {
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl Relay {
    pub fn new(
        pool: PgPool,
        settings: RelaySettings,
        registry: Arc<SubscriberRegistry>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            settings,
            registry,
            instance: instance.into(),
        }
    }

    /// One poll cycle: claim due rows and deliver them. Public so tests and
    /// the CLI can drive the relay without the background task.
    pub async fn tick(&self) -> Result<TickReport> {
        let claimed = outbox::claim_due_batch(
            &self.pool,
            self.settings.batch_size,
            &self.instance,
        )
        .await?;

        let mut report = TickReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for row in claimed {
            match self.deliver(&row) {
                Ok(()) => {
                    outbox::mark_published(&self.pool, row.event_id).await?;
                    report.published += 1;
                }
                Err(e) => {
                    warn!(
                        event_id = row.event_id,
                        event_type = %row.event_type,
                        attempts = row.attempts,
                        error = %format!("{e:#}"),
                        "subscriber delivery failed"
                    );
                    // attempts counts completed deliveries; this one makes
                    // attempts + 1.
                    if row.attempts + 1 >= self.settings.max_attempts {
                        outbox::mark_dead(&self.pool, row.event_id).await?;
                        error!(event_id = row.event_id, "event parked as dead");
                        report.dead += 1;
                    } else {
                        let next = Utc::now() + delivery_backoff(row.attempts);
                        outbox::mark_retry(&self.pool, row.event_id, next).await?;
                        report.retried += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Invoke every matching subscriber; the first failure fails the
    /// delivery (the retry will re-invoke all of them — idempotency is the
    /// subscriber contract).
    fn deliver(&self, row: &OutboxEventRow) -> Result<()> {
        let envelope = EventEnvelope {
            event_id: row.event_id,
            event_type: row.event_type.clone(),
            aggregate_type: row.aggregate_type.clone(),
            aggregate_id: row.aggregate_id.clone(),
            payload: row.payload.clone(),
            created_at: row.created_at,
        };

        let handlers = self.registry.matching(&row.event_type);
        debug!(
            event_id = row.event_id,
            event_type = %row.event_type,
            subscribers = handlers.len(),
            "delivering"
        );
        for handler in handlers {
            handler(&envelope)?;
        }
        Ok(())
    }

    /// Spawn the poll loop and the stale-claim reaper.
    pub fn start(self) -> RelayHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let relay = Arc::new(self);

        let tick_interval = Duration::from_millis(relay.settings.tick_ms);
        let reap_interval = Duration::from_secs(relay.settings.reap_interval_secs);
        let claim_ttl = relay.settings.claim_ttl_secs;

        let tick_task = {
            let relay = Arc::clone(&relay);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tick_interval);
                while !stop.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    match relay.tick().await {
                        Ok(report) if report.claimed > 0 => {
                            info!(
                                claimed = report.claimed,
                                published = report.published,
                                retried = report.retried,
                                dead = report.dead,
                                "relay tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %format!("{e:#}"), "relay tick failed"),
                    }
                }
            })
        };

        let reap_task = {
            let pool = relay.pool.clone();
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(reap_interval);
                while !stop.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    match outbox::reap_stale_claims(&pool, claim_ttl).await {
                        Ok(0) => {}
                        Ok(n) => warn!(reaped = n, "re-reaped stale outbox claims"),
                        Err(e) => error!(error = %format!("{e:#}"), "claim reap failed"),
                    }
                }
            })
        };

        info!(instance = %relay.instance, "relay started");
        RelayHandle {
            stop,
            tasks: vec![tick_task, reap_task],
        }
    }
}

/// Delivery retry backoff: `2^attempts` seconds capped at 60, plus up to a
/// second of jitter.
fn delivery_backoff(attempts: i32) -> chrono::Duration {
    let attempts = attempts.clamp(0, 6) as u32;
    let secs = (1u64 << attempts).min(60);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    chrono::Duration::seconds(secs as i64) + chrono::Duration::milliseconds(jitter_ms)
}

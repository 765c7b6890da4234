//! A subscriber that throws on first delivery gets the row rescheduled with
//! attempts=1; the next tick delivers and the row is published.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fm_config::settings::RelaySettings;
use fm_db::outbox::{self, NewOutboxEvent};
use fm_relay::{Relay, SubscriberRegistry};
use serde_json::json;
use uuid::Uuid;

fn test_settings() -> RelaySettings {
    RelaySettings {
        tick_ms: 50,
        batch_size: 1000,
        max_attempts: 5,
        claim_ttl_secs: 60,
        reap_interval_secs: 3600,
    }
}

async fn insert_job_event(pool: &sqlx::PgPool, key: &str) -> anyhow::Result<i64> {
    let mut conn = pool.acquire().await?;
    let id = outbox::insert_event(
        &mut conn,
        &NewOutboxEvent {
            event_type: "job.completed".to_string(),
            aggregate_type: "operation".to_string(),
            aggregate_id: Uuid::new_v4().to_string(),
            payload: json!({"marker": key}),
            idempotency_key: key.to_string(),
        },
    )
    .await?;
    Ok(id)
}

#[tokio::test]
async fn failing_subscriber_retries_then_publishes() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _guard = fm_testkit::exclusive_test_lock(&pool).await?;

    let key = format!("retry-{}", Uuid::new_v4());
    let event_id = insert_job_event(&pool, &key).await?;

    // Fails only for this test's event, only on the first sight of it.
    let failures = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(SubscriberRegistry::new());
    {
        let failures = Arc::clone(&failures);
        let marker = key.clone();
        registry.subscribe(
            "job.*",
            Arc::new(move |env| {
                if env.payload["marker"] == marker.as_str()
                    && failures.fetch_add(1, Ordering::SeqCst) == 0
                {
                    anyhow::bail!("transient subscriber failure");
                }
                Ok(())
            }),
        );
    }

    let relay = Relay::new(pool.clone(), test_settings(), registry, "test-relay");

    // First tick: delivery fails, row is rescheduled.
    relay.tick().await?;
    let row = outbox::fetch_by_key(&pool, &key).await?.expect("row");
    assert_eq!(row.status, "pending");
    assert_eq!(row.attempts, 1);
    assert!(row.next_attempt_at > chrono::Utc::now());

    // Pull the retry forward and tick again: published.
    sqlx::query("update outbox_events set next_attempt_at = now() where event_id = $1")
        .bind(event_id)
        .execute(&pool)
        .await?;
    relay.tick().await?;

    let row = outbox::fetch_by_key(&pool, &key).await?.expect("row");
    assert_eq!(row.status, "published");
    assert!(failures.load(Ordering::SeqCst) >= 2);

    Ok(())
}

#[tokio::test]
async fn attempts_exhaustion_parks_event_as_dead() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _guard = fm_testkit::exclusive_test_lock(&pool).await?;

    let key = format!("dead-{}", Uuid::new_v4());
    insert_job_event(&pool, &key).await?;

    let registry = Arc::new(SubscriberRegistry::new());
    {
        let marker = key.clone();
        registry.subscribe(
            "job.*",
            Arc::new(move |env| {
                if env.payload["marker"] == marker.as_str() {
                    anyhow::bail!("permanently broken subscriber");
                }
                Ok(())
            }),
        );
    }

    let settings = RelaySettings {
        max_attempts: 2,
        ..test_settings()
    };
    let relay = Relay::new(pool.clone(), settings, registry, "test-relay");

    relay.tick().await?;
    sqlx::query("update outbox_events set next_attempt_at = now() where idempotency_key = $1")
        .bind(&key)
        .execute(&pool)
        .await?;
    relay.tick().await?;

    let row = outbox::fetch_by_key(&pool, &key).await?.expect("row");
    assert_eq!(row.status, "dead");
    assert_eq!(row.attempts, 2);

    Ok(())
}

#[tokio::test]
async fn events_deliver_in_commit_order_per_aggregate() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _guard = fm_testkit::exclusive_test_lock(&pool).await?;

    let base = Uuid::new_v4();
    let k1 = format!("order-{base}-1");
    let k2 = format!("order-{base}-2");
    let first = insert_job_event(&pool, &k1).await?;
    let second = insert_job_event(&pool, &k2).await?;
    assert!(first < second);

    let seen: Arc<std::sync::Mutex<Vec<i64>>> = Arc::default();
    let registry = Arc::new(SubscriberRegistry::new());
    {
        let seen = Arc::clone(&seen);
        let prefix = format!("order-{base}-");
        registry.subscribe(
            "job.*",
            Arc::new(move |env| {
                if env.payload["marker"]
                    .as_str()
                    .is_some_and(|m| m.starts_with(&prefix))
                {
                    seen.lock().unwrap().push(env.event_id);
                }
                Ok(())
            }),
        );
    }

    let relay = Relay::new(pool.clone(), test_settings(), registry, "test-relay");
    relay.tick().await?;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![first, second]);

    Ok(())
}

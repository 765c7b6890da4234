//! Shared runtime state for fm-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Everything mutable
//! lives in the database; in-process state is the SSE bus and the component
//! handles built at composition time.

use std::sync::Arc;

use fm_pipeline::Pipeline;
use fm_queue::{ProgressBus, ProgressUpdate};
use fm_relay::SubscriberRegistry;
use fm_schemas::events::EventEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast to connected SSE clients: durable lifecycle events
/// (delivered through the relay) and ephemeral progress updates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Lifecycle {
        event_id: i64,
        event_type: String,
        payload: Value,
    },
    Progress {
        job_id: String,
        operation_id: Uuid,
        percent: u8,
    },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub pipeline: Pipeline,
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    started: std::time::Instant,
}

impl AppState {
    pub fn new(pool: PgPool, pipeline: Pipeline) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            pool,
            pipeline,
            bus,
            build: BuildInfo {
                service: "fm-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            started: std::time::Instant::now(),
        }
    }

    /// Seconds since this state was composed (daemon start).
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Short random hex id for new assets.
pub fn new_asset_id() -> String {
    use rand::Rng;
    let bytes: [u8; 6] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Register the SSE fanout as a relay subscriber on `job.*` and
/// `credits.*`. The relay is the ONLY path from durable lifecycle events to
/// clients; losing the broadcast (no receivers) never fails the delivery.
pub fn wire_event_fanout(registry: &SubscriberRegistry, bus: broadcast::Sender<BusMsg>) {
    let fanout: fm_relay::Handler = Arc::new(move |env: &EventEnvelope| {
        let _ = bus.send(BusMsg::Lifecycle {
            event_id: env.event_id,
            event_type: env.event_type.clone(),
            payload: env.payload.clone(),
        });
        Ok(())
    });
    registry.subscribe("job.*", Arc::clone(&fanout));
    registry.subscribe("credits.*", fanout);
}

/// Forward ephemeral progress updates onto the SSE bus.
pub fn spawn_progress_forwarder(progress: &ProgressBus, bus: broadcast::Sender<BusMsg>) {
    let mut rx = progress.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ProgressUpdate {
                    job_id,
                    operation_id,
                    percent,
                }) => {
                    let _ = bus.send(BusMsg::Progress {
                        job_id,
                        operation_id,
                        percent,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

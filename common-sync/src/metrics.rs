use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use once_cell::sync::OnceCell;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Metric set for the room registry.
pub struct RoomMetrics {
    pub rooms_created_total: IntCounter,
    pub active_rooms: IntGauge,
    pub joins_total: IntCounter,
}

impl RoomMetrics {
    pub fn on_startup(&self) {
        self.rooms_created_total.inc_by(0);
        self.active_rooms.set(0);
        self.joins_total.inc_by(0);
    }

    pub fn inc_rooms_created(&self) {
        self.rooms_created_total.inc();
    }

    pub fn set_active_rooms(&self, rooms: i64) {
        self.active_rooms.set(rooms);
    }

    pub fn inc_joins(&self) {
        self.joins_total.inc();
    }
}

/// Metric set for the participant runtime's drift correction.
pub struct PlaybackMetrics {
    pub clock_samples_total: IntCounter,
    pub hard_corrections_total: IntCounter,
    pub rate_nudges_total: IntCounter,
    pub stale_snapshots_total: IntCounter,
    pub drift_seconds: Histogram,
}

impl PlaybackMetrics {
    pub fn on_startup(&self) {
        self.clock_samples_total.inc_by(0);
        self.hard_corrections_total.inc_by(0);
        self.rate_nudges_total.inc_by(0);
        self.stale_snapshots_total.inc_by(0);
    }

    pub fn inc_clock_samples(&self) {
        self.clock_samples_total.inc();
    }

    pub fn inc_hard_corrections(&self) {
        self.hard_corrections_total.inc();
    }

    pub fn inc_rate_nudges(&self) {
        self.rate_nudges_total.inc();
    }

    pub fn inc_stale_snapshots(&self) {
        self.stale_snapshots_total.inc();
    }

    pub fn observe_drift_seconds(&self, seconds: f64) {
        self.drift_seconds.observe(seconds);
    }
}

static ROOM_METRICS: OnceCell<RoomMetrics> = OnceCell::new();
static PLAYBACK_METRICS: OnceCell<PlaybackMetrics> = OnceCell::new();

pub fn room_metrics() -> &'static RoomMetrics {
    ROOM_METRICS.get_or_init(|| RoomMetrics {
        rooms_created_total: register_int_counter!(
            "registry_rooms_created_total",
            "Total rooms created by the registry"
        )
        .expect("register registry_rooms_created_total"),
        active_rooms: register_int_gauge!(
            "registry_active_rooms",
            "Number of rooms with at least one participant"
        )
        .expect("register registry_active_rooms"),
        joins_total: register_int_counter!(
            "registry_room_joins_total",
            "Total processed join requests"
        )
        .expect("register registry_room_joins_total"),
    })
}

pub fn playback_metrics() -> &'static PlaybackMetrics {
    PLAYBACK_METRICS.get_or_init(|| PlaybackMetrics {
        clock_samples_total: register_int_counter!(
            "player_clock_samples_total",
            "Completed clock-sync round trips"
        )
        .expect("register player_clock_samples_total"),
        hard_corrections_total: register_int_counter!(
            "player_hard_corrections_total",
            "Drift corrections that forced a seek"
        )
        .expect("register player_hard_corrections_total"),
        rate_nudges_total: register_int_counter!(
            "player_rate_nudges_total",
            "Drift corrections applied as playback-rate changes"
        )
        .expect("register player_rate_nudges_total"),
        stale_snapshots_total: register_int_counter!(
            "player_stale_snapshots_total",
            "Snapshots dropped because their sequence was not newer"
        )
        .expect("register player_stale_snapshots_total"),
        drift_seconds: register_histogram!(
            "player_drift_seconds",
            "Absolute drift against the host position at snapshot time (seconds)",
            vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
        )
        .expect("register player_drift_seconds"),
    })
}

pub fn metrics_router(metrics_path: &'static str) -> Router {
    Router::new().route(metrics_path, get(metrics_handler))
}

pub async fn serve_metrics(
    listener: TcpListener,
    metrics_path: &'static str,
) -> Result<(), BoxError> {
    let router = metrics_router(metrics_path);
    axum::serve(listener, router)
        .await
        .map_err(|err| Box::new(err) as BoxError)
}

pub fn spawn_metrics_exporter(
    addr: SocketAddr,
    metrics_path: &'static str,
    service_name: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = serve_metrics(listener, metrics_path).await {
                    error!(%err, service = service_name, %addr, path = metrics_path, "metrics exporter stopped unexpectedly");
                }
            }
            Err(err) => {
                error!(%err, service = service_name, %addr, path = metrics_path, "metrics exporter could not bind");
            }
        }
    })
}

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(%err, "metrics: encode failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let body = match String::from_utf8(buffer) {
        Ok(text) => text,
        Err(err) => {
            error!(%err, "metrics: non-utf8 output");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(body))
        .unwrap()
}

//! Axum front door for the sync scheduler: service info, liveness, manual trigger.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hsync_sync::{drain, RunOutcome, SyncConfig, SyncOrchestrator, SyncScheduler, SERVICE_NAME};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "hsync-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub ingestion_url: String,
    pub sync_schedule: String,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: &SyncConfig) -> Self {
        Self {
            orchestrator,
            ingestion_url: config.ingestion_service_url.clone(),
            sync_schedule: config.schedule_label(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    status: &'static str,
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/sync/trigger", post(trigger_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves, then lets in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "scheduler http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Whether each side of a shutdown finished inside the grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub http_drained: bool,
    pub sync_drained: bool,
}

/// Runs the front door until `signal` resolves, then shuts everything down within `grace`.
///
/// The orchestrator is closed to new triggers as soon as the signal fires. The cron scheduler
/// (if any) and the HTTP server drain concurrently; a request still running a manual sync when
/// the grace period ends is abandoned.
pub async fn serve_until<F>(
    listener: TcpListener,
    state: AppState,
    scheduler: Option<SyncScheduler>,
    signal: F,
    grace: Duration,
) -> anyhow::Result<ShutdownReport>
where
    F: Future<Output = ()> + Send,
{
    let orchestrator = state.orchestrator.clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    let server_exited = tokio::select! {
        _ = signal => {
            info!("shutdown signal received");
            None
        }
        joined = &mut server => Some(joined),
    };

    orchestrator.close();
    let _ = stop_tx.send(());

    let sync_drain = async {
        match scheduler {
            Some(scheduler) => scheduler.shutdown().await,
            None => Ok(drain(&orchestrator, grace).await),
        }
    };

    if let Some(joined) = server_exited {
        let sync_drained = sync_drain.await?;
        joined.context("http server task failed")??;
        return Ok(ShutdownReport {
            http_drained: true,
            sync_drained,
        });
    }

    let (sync_drained, http_result) =
        tokio::join!(sync_drain, tokio::time::timeout(grace, &mut server));
    let http_drained = match http_result {
        Ok(joined) => {
            joined.context("http server task failed")??;
            true
        }
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "http requests still in flight after grace period, aborting server");
            server.abort();
            false
        }
    };
    let report = ShutdownReport {
        http_drained,
        sync_drained: sync_drained?,
    };
    info!(http_drained = report.http_drained, sync_drained = report.sync_drained, "front door stopped");
    Ok(report)
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "Garmin Scheduler",
        "status": "running",
        "endpoints": {
            "health": "/health",
            "trigger_sync": "/sync/trigger (POST)",
        },
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "ingestion_url": state.ingestion_url,
        "sync_schedule": state.sync_schedule,
    }))
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.trigger_manual().await {
        // Ran, skipped and aborted all look the same to the caller.
        Ok(outcome) => {
            if let RunOutcome::Aborted(reason) = &outcome {
                info!(%reason, "manual sync returned without running");
            }
            (
                StatusCode::OK,
                Json(TriggerResponse {
                    status: "success",
                    message: "Sync triggered successfully".to_string(),
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, "error triggering manual sync");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TriggerResponse {
                    status: "error",
                    message: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::header;
    use hsync_ingest::{HttpClientConfig, IngestionClient};
    use hsync_source::{FixtureDataSource, ProviderCredentials};
    use hsync_sync::OrchestratorSettings;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    // Points at a closed local port, so every run aborts on the health probe.
    fn state(fixtures: &std::path::Path) -> AppState {
        state_for(fixtures, "http://127.0.0.1:9", Duration::from_secs(2))
    }

    fn state_for(fixtures: &std::path::Path, ingest_url: &str, timeout: Duration) -> AppState {
        let source = Arc::new(FixtureDataSource::new(
            fixtures,
            ProviderCredentials::new("me@example.com", "hunter2"),
        ));
        let client = Arc::new(
            IngestionClient::new(
                ingest_url,
                HttpClientConfig {
                    timeout,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            source,
            client.clone(),
            client,
            OrchestratorSettings::default(),
        ));
        AppState {
            orchestrator,
            ingestion_url: ingest_url.to_string(),
            sync_schedule: "*:0".to_string(),
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(state(dir.path()))
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["endpoints"]["health"], "/health");
        assert_eq!(body["endpoints"]["trigger_sync"], "/sync/trigger (POST)");
    }

    #[tokio::test]
    async fn health_reports_schedule_and_ingestion_url() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(state(dir.path()))
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE_NAME);
        assert_eq!(body["ingestion_url"], "http://127.0.0.1:9");
        assert_eq!(body["sync_schedule"], "*:0");
    }

    #[tokio::test]
    async fn trigger_reports_success_even_when_run_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(state(dir.path()))
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Sync triggered successfully");
    }

    #[tokio::test]
    async fn trigger_after_shutdown_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        state.orchestrator.close();
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("shutting down"));
    }

    #[tokio::test]
    async fn trigger_requires_post() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(state(dir.path()))
            .oneshot(axum::http::Request::builder().uri("/sync/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        serve(listener, state(dir.path()), async {}).await.unwrap();
    }

    #[tokio::test]
    async fn idle_shutdown_drains_and_closes_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let orchestrator = state.orchestrator.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let report = serve_until(listener, state, None, async {}, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            report,
            ShutdownReport {
                http_drained: true,
                sync_drained: true
            }
        );
        assert!(orchestrator.is_closed());
        assert!(orchestrator.trigger_manual().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_cron_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let orchestrator = state.orchestrator.clone();
        let scheduler = SyncScheduler::start(orchestrator.clone(), "0 0 * * * *", Duration::from_secs(1))
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let report = serve_until(listener, state, Some(scheduler), async {}, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(report.http_drained);
        assert!(report.sync_drained);
        assert!(orchestrator.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_bounded_while_manual_sync_is_stuck() {
        use tokio::io::AsyncWriteExt;

        // Accepts connections but never answers, so the health probe hangs inside the run.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ingest_url = format!("http://{}", silent.local_addr().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let state = state_for(dir.path(), &ingest_url, Duration::from_secs(60));
        let orchestrator = state.orchestrator.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (signal_tx, signal_rx) = oneshot::channel::<()>();
        let front_door = tokio::spawn(serve_until(
            listener,
            state,
            None,
            async move {
                let _ = signal_rx.await;
            },
            Duration::from_millis(300),
        ));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /sync/trigger HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !orchestrator.is_running() {
            assert!(tokio::time::Instant::now() < deadline, "manual sync never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        signal_tx.send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), front_door)
            .await
            .expect("shutdown exceeded its grace period")
            .unwrap()
            .unwrap();
        assert!(!report.http_drained);
        assert!(!report.sync_drained);
        assert!(orchestrator.is_closed());
        assert!(orchestrator.trigger_manual().await.is_err());
        drop(stream);
        drop(silent);
    }
}

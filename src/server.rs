//! The HTTP Surface (§4.7 / §6). Thin handlers: validate, call Store/Job
//! Engine, map errors via `NexusError`'s `IntoResponse`. Versioned under `/v1/`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::str::FromStr;
use std::sync::Arc;

use crate::auth::{self, AuthGate};
use crate::config::DaemonConfig;
use crate::engine;
use crate::error::{NexusError, Result};
use crate::gpu::GpuProbe;
use crate::job::{create_job, Job, JobPatch, JobRequest, JobStatus};
use crate::logs::LogBuffer;
use crate::store::{JobFilter, Store};

#[derive(Clone)]
pub struct ServerState {
    pub store: Store,
    pub gpu_probe: Arc<GpuProbe>,
    pub log_buffer: LogBuffer,
    pub config: DaemonConfig,
    pub started_at: std::time::Instant,
}

pub fn router(state: ServerState, auth_gate: Arc<AuthGate>) -> Router {
    Router::new()
        .route("/v1/server/status", get(server_status))
        .route("/v1/server/logs", get(server_logs))
        .route("/v1/jobs", get(list_jobs).post(submit_job))
        .route(
            "/v1/jobs/{id}",
            get(get_job).patch(patch_job).delete(delete_job),
        )
        .route("/v1/jobs/{id}/kill", post(kill_job))
        .route("/v1/jobs/{id}/logs", get(job_logs))
        .route("/v1/jobs/{id}/events", get(job_events))
        .route("/v1/gpus", get(list_gpus))
        .route(
            "/v1/gpus/{idx}/blacklist",
            put(blacklist_gpu).delete(unblacklist_gpu),
        )
        .route("/v1/health", get(health))
        .route("/v1/ssh-keys", post(register_ssh_key))
        .route_layer(middleware::from_fn_with_state(auth_gate, auth::require_auth))
        .with_state(state)
}

/// Binds a `SO_REUSEPORT` listening socket the way the teacher's daemon does,
/// so a future redeploy can bind the same port before the old process exits.
pub async fn bind(config: &DaemonConfig) -> anyhow::Result<tokio::net::TcpListener> {
    let bind_addr = if config.host.contains(':') && !config.host.starts_with('[') {
        format!("[{}]:{}", config.host, config.port)
    } else {
        format!("{}:{}", config.host, config.port)
    };
    let addr = tokio::net::lookup_host(&bind_addr)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("failed to resolve address: {bind_addr}"))?;

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(std_listener)?)
}

#[derive(Serialize)]
struct ServerStatus {
    node_name: String,
    queued: i64,
    running: i64,
    completed: i64,
    failed: i64,
    killed: i64,
    uptime_secs: u64,
}

async fn server_status(State(state): State<ServerState>) -> Result<Json<ServerStatus>> {
    Ok(Json(ServerStatus {
        node_name: state.config.node_name.clone(),
        queued: state.store.count_jobs(JobStatus::Queued)?,
        running: state.store.count_jobs(JobStatus::Running)?,
        completed: state.store.count_jobs(JobStatus::Completed)?,
        failed: state.store.count_jobs(JobStatus::Failed)?,
        killed: state.store.count_jobs(JobStatus::Killed)?,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
struct LogsQuery {
    last_n_lines: Option<usize>,
}

#[derive(Serialize)]
struct LogsResponse {
    logs: String,
}

async fn server_logs(
    State(state): State<ServerState>,
    Query(query): Query<LogsQuery>,
) -> Json<LogsResponse> {
    let n = query.last_n_lines.unwrap_or(200);
    Json(LogsResponse {
        logs: state.log_buffer.last_n_lines(n).join("\n"),
    })
}

#[derive(Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    gpu_index: Option<u32>,
    command_regex: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_jobs(
    State(state): State<ServerState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>> {
    let status = query
        .status
        .map(|s| {
            JobStatus::from_str(&s)
                .map_err(|_| NexusError::Validation(format!("unknown status: {s}")))
        })
        .transpose()?;
    let filter = JobFilter {
        status,
        gpu_index: query.gpu_index,
        command_regex: query.command_regex,
        limit: query.limit,
        offset: query.offset,
    };
    Ok(Json(state.store.list_jobs(&filter)?))
}

async fn submit_job(
    State(state): State<ServerState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<Job>)> {
    let id = engine::generate_id(&state.store)?;
    let job = create_job(request, id, &state.config.node_name)?;
    state.store.add_job(&job)?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(State(state): State<ServerState>, Path(id): Path<String>) -> Result<Json<Job>> {
    Ok(Json(state.store.get_job(&id)?))
}

async fn patch_job(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> Result<Json<Job>> {
    let mut job = state.store.get_job(&id)?;
    if job.status != JobStatus::Queued {
        return Err(NexusError::Conflict(format!("job {id} is not queued")));
    }
    if let Some(command) = patch.command {
        if command.trim().is_empty() {
            return Err(NexusError::Validation("command must not be empty".into()));
        }
        job.command = command.into();
    }
    if let Some(priority) = patch.priority {
        job.priority = priority;
    }
    state.store.update_job(&job)?;
    Ok(Json(job))
}

async fn delete_job(State(state): State<ServerState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.store.delete_job(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn kill_job(State(state): State<ServerState>, Path(id): Path<String>) -> Result<StatusCode> {
    let mut job = state.store.get_job(&id)?;
    if job.status != JobStatus::Running {
        return Err(NexusError::Conflict(format!("job {id} is not running")));
    }
    job.marked_for_kill = true;
    state.store.update_job(&job)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct JobLogsResponse {
    logs: String,
}

async fn job_logs(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<JobLogsResponse>> {
    let job = state.store.get_job(&id)?;
    let dir = job
        .dir
        .clone()
        .ok_or_else(|| NexusError::NotFound(format!("job {id} has no logs yet")))?;
    let contents = std::fs::read_to_string(dir.join("output.log"))
        .map_err(|e| NexusError::NotFound(format!("no log file for job {id}: {e}")))?;
    let logs = match query.last_n_lines {
        Some(n) => {
            let lines: Vec<&str> = contents.lines().collect();
            let skip = lines.len().saturating_sub(n);
            lines[skip..].join("\n")
        }
        None => contents,
    };
    Ok(Json(JobLogsResponse { logs }))
}

#[derive(Serialize)]
struct JobEvent {
    at: f64,
    event_type: String,
    detail: Option<String>,
}

async fn job_events(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobEvent>>> {
    state.store.get_job(&id)?;
    let events = state
        .store
        .job_events(&id)?
        .into_iter()
        .map(|(at, event_type, detail)| JobEvent { at, event_type, detail })
        .collect();
    Ok(Json(events))
}

async fn gpu_statuses(state: &ServerState) -> Result<Vec<GpuStatus>> {
    let gpus = state
        .gpu_probe
        .snapshot(false)
        .map_err(|e| NexusError::Internal(e.to_string()))?;
    let blacklist = state.store.list_blacklist()?;
    let running = state.store.list_jobs(&JobFilter {
        status: Some(JobStatus::Running),
        ..Default::default()
    })?;
    let busy_by_gpu: std::collections::HashMap<u32, String> = running
        .into_iter()
        .flat_map(|j| j.gpu_idxs.iter().map(|g| (*g, j.id.clone())).collect::<Vec<_>>())
        .collect();

    Ok(gpus
        .into_iter()
        .map(|g| GpuStatus {
            index: g.index,
            name: g.name,
            memory_total_mb: g.memory_total_mb,
            memory_used_mb: g.memory_used_mb,
            blacklisted: blacklist.contains(&g.index),
            running_job_id: busy_by_gpu.get(&g.index).cloned(),
        })
        .collect())
}

async fn list_gpus(State(state): State<ServerState>) -> Result<Json<Vec<GpuStatus>>> {
    Ok(Json(gpu_statuses(&state).await?))
}

async fn single_gpu_status(state: &ServerState, idx: u32) -> Result<GpuStatus> {
    gpu_statuses(state)
        .await?
        .into_iter()
        .find(|g| g.index == idx)
        .ok_or_else(|| NexusError::NotFound(format!("gpu {idx}")))
}

#[derive(Serialize)]
struct GpuStatus {
    index: u32,
    name: String,
    memory_total_mb: u64,
    memory_used_mb: u64,
    blacklisted: bool,
    running_job_id: Option<String>,
}

async fn blacklist_gpu(
    State(state): State<ServerState>,
    Path(idx): Path<u32>,
) -> Result<Json<GpuStatus>> {
    state.store.set_blacklist(idx, true)?;
    Ok(Json(single_gpu_status(&state, idx).await?))
}

async fn unblacklist_gpu(
    State(state): State<ServerState>,
    Path(idx): Path<u32>,
) -> Result<Json<GpuStatus>> {
    state.store.set_blacklist(idx, false)?;
    Ok(Json(single_gpu_status(&state, idx).await?))
}

#[derive(Deserialize)]
struct HealthQuery {
    #[serde(default)]
    detailed: bool,
    #[serde(default)]
    refresh: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<crate::health::HealthSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpus: Option<Vec<crate::gpu::GpuInfo>>,
}

async fn health(
    State(state): State<ServerState>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<HealthResponse>> {
    let gpus = if query.detailed {
        Some(
            state
                .gpu_probe
                .snapshot(query.refresh)
                .map_err(|e| NexusError::Internal(e.to_string()))?,
        )
    } else {
        None
    };
    Ok(Json(HealthResponse {
        status: "ok",
        pid: std::process::id(),
        detail: query.detailed.then(crate::health::sample),
        gpus,
    }))
}

#[derive(Deserialize)]
struct RegisterSshKeyRequest {
    public_key: String,
}

async fn register_ssh_key(
    State(_state): State<ServerState>,
    Json(request): Json<RegisterSshKeyRequest>,
) -> Result<StatusCode> {
    let home = crate::config::home_dir().map_err(|e| NexusError::Internal(e.to_string()))?;
    auth::register_ssh_key(&home, &request.public_key)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn test_state() -> ServerState {
        ServerState {
            store: Store::open_in_memory().unwrap(),
            gpu_probe: Arc::new(GpuProbe::with_backend(
                Box::new(crate::gpu::test_support::FixedBackend::idle(1)),
                std::time::Duration::from_secs(1),
            )),
            log_buffer: LogBuffer::new(),
            config: DaemonConfig::default(),
            started_at: std::time::Instant::now(),
        }
    }

    /// Requests from a fresh `Request::builder()` carry no peer address, so
    /// `require_auth`'s `ConnectInfo` extractor needs it injected by hand —
    /// stamped as loopback so these tests exercise the routes, not the gate.
    fn with_loopback_peer(mut request: Request<Body>) -> Request<Body> {
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    #[tokio::test]
    async fn submit_and_fetch_job_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(AuthGate::init(dir.path()).unwrap());
        let app = router(test_state(), gate);

        let body = serde_json::json!({
            "command": "echo hi",
            "user": "u",
            "git_repo_url": "",
            "git_tag": "",
            "git_branch": "",
            "artifact_id": "art",
        });
        let response = app
            .clone()
            .oneshot(with_loopback_peer(
                Request::builder()
                    .method("POST")
                    .uri("/v1/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn get_missing_job_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(AuthGate::init(dir.path()).unwrap());
        let app = router(test_state(), gate);

        let response = app
            .oneshot(with_loopback_peer(
                Request::builder()
                    .uri("/v1/jobs/nope01")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn job_events_include_creation() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(AuthGate::init(dir.path()).unwrap());
        let state = test_state();
        let store = state.store.clone();
        let app = router(state, gate);

        let job = create_job(
            JobRequest {
                command: "echo hi".into(),
                user: "u".into(),
                git_repo_url: String::new(),
                git_tag: String::new(),
                git_branch: String::new(),
                artifact_id: String::new(),
                num_gpus: 1,
                gpu_idxs: None,
                priority: 0,
                search_wandb: false,
                notifications: Vec::new(),
                env: Default::default(),
                jobrc: None,
                run_immediately: false,
                ignore_blacklist: false,
                output_file: None,
            },
            "jobevt1".into(),
            "node",
        )
        .unwrap();
        store.add_job(&job).unwrap();

        let response = app
            .oneshot(with_loopback_peer(
                Request::builder()
                    .uri("/v1/jobs/jobevt1/events")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let events: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], "created");
    }

    #[tokio::test]
    async fn blacklist_put_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(AuthGate::init(dir.path()).unwrap());
        let state = test_state();
        let store = state.store.clone();
        let app = router(state, gate);

        let response = app
            .clone()
            .oneshot(with_loopback_peer(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/gpus/0/blacklist")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.list_blacklist().unwrap().contains(&0));

        app.oneshot(with_loopback_peer(
            Request::builder()
                .method("DELETE")
                .uri("/v1/gpus/0/blacklist")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();
        assert!(store.list_blacklist().unwrap().is_empty());
    }
}

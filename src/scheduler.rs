//! The periodic control loop (§4.5): four tasks per tick — advance running
//! jobs, start queued jobs, discover tracker URLs, probe system health.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DaemonConfig;
use crate::engine;
use crate::gpu::GpuProbe;
use crate::job::{end_job, JobStatus};
use crate::notify::Notifier;
use crate::session::SessionRunner;
use crate::store::{JobFilter, Store};

pub struct Scheduler {
    store: Store,
    gpu_probe: Arc<GpuProbe>,
    runner: Arc<dyn SessionRunner>,
    notifier: Arc<Notifier>,
    jobs_root: PathBuf,
    config: DaemonConfig,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        gpu_probe: Arc<GpuProbe>,
        runner: Arc<dyn SessionRunner>,
        notifier: Arc<Notifier>,
        jobs_root: PathBuf,
        config: DaemonConfig,
    ) -> Self {
        Self {
            store,
            gpu_probe,
            runner,
            notifier,
            jobs_root,
            config,
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.stop.clone()
    }

    /// Finalizes running jobs whose session did not survive a restart
    /// (§9 open question: never re-adopt, always finalize as failed).
    pub fn reconcile_orphans(&self) -> crate::error::Result<()> {
        let running = self.store.list_jobs(&JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        })?;
        for job in running {
            let alive = job
                .screen_session_name
                .as_deref()
                .map(|n| self.runner.is_alive(n))
                .unwrap_or(false);
            if alive {
                continue;
            }
            let mut orphaned = job.clone();
            orphaned.status = JobStatus::Failed;
            orphaned.completed_at = Some(crate::util::now_secs());
            orphaned.error_message = Some("orphaned by restart".to_string());
            self.store.update_job(&orphaned)?;
            engine::cleanup_job(&self.jobs_root, &orphaned).ok();
            tracing::warn!(job_id = %orphaned.id, "finalized orphaned job on startup");
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.refresh_rate_secs));
        loop {
            interval.tick().await;
            if self.stop.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }
    }

    async fn tick(self: &Arc<Self>) {
        let call_timeout = Duration::from_secs(self.config.call_timeout_secs);
        let (advance, start, tracker, health) = tokio::join!(
            run_bounded(call_timeout, "advance_running", {
                let this = self.clone();
                async move { this.advance_running().await }
            }),
            run_bounded(call_timeout, "start_queued", {
                let this = self.clone();
                async move { this.start_queued().await }
            }),
            run_bounded(call_timeout, "discover_tracker_urls", {
                let this = self.clone();
                async move { this.discover_tracker_urls().await }
            }),
            run_bounded(call_timeout, "system_health", {
                let this = self.clone();
                async move { this.system_health().await }
            }),
        );
        for (name, result) in [
            ("advance_running", advance),
            ("start_queued", start),
            ("discover_tracker_urls", tracker),
            ("system_health", health),
        ] {
            if let Err(e) = result {
                tracing::error!(task = name, error = %e, "scheduler task failed");
            }
        }
    }

    /// Task 1: observe exited/killed sessions, finalize, notify, clean up.
    async fn advance_running(&self) -> crate::error::Result<()> {
        let running = self.store.list_jobs(&JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        })?;
        for job in running {
            let alive = job
                .screen_session_name
                .as_deref()
                .map(|n| self.runner.is_alive(n))
                .unwrap_or(false);

            if alive && !job.marked_for_kill {
                continue;
            }

            if job.marked_for_kill && alive {
                engine::kill_job(self.runner.as_ref(), &job)?;
            }

            let log = engine::read_output_log(&self.jobs_root, &job).unwrap_or_default();
            let ended = end_job(&job, job.marked_for_kill, &log)?;

            if ended.output_file.is_some() && ended.status == JobStatus::Completed {
                if let Err(e) = engine::stage_output_file(&self.jobs_root, &ended) {
                    tracing::warn!(job_id = %ended.id, error = %e, "failed to stage output_file");
                }
            }
            engine::cleanup_job(&self.jobs_root, &ended).ok();

            self.store.update_job(&ended)?;
            self.notifier.notify_terminal(&ended).await;
        }
        Ok(())
    }

    /// Task 2: allocate GPUs and start at most one queued job this tick.
    async fn start_queued(&self) -> crate::error::Result<()> {
        let running = self.store.list_jobs(&JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        })?;
        let busy = engine::busy_gpus(&running);
        let blacklist = self.store.list_blacklist()?;

        let queued = self.store.list_jobs(&JobFilter {
            status: Some(JobStatus::Queued),
            ..Default::default()
        })?;

        for job in queued {
            let free = self
                .gpu_probe
                .available_indices(
                    &blacklist,
                    &busy,
                    job.ignore_blacklist,
                    self.config.gpus.as_deref(),
                )
                .map_err(|e| crate::error::NexusError::Internal(e.to_string()))?;
            let free: HashSet<u32> = free.into_iter().collect();

            let chosen = match self.pending_pinned_gpus(&job) {
                Some(pinned) => {
                    if pinned.iter().all(|g| free.contains(g)) {
                        Some(pinned)
                    } else {
                        None
                    }
                }
                None => {
                    if free.len() as u32 >= job.num_gpus {
                        let mut sorted: Vec<u32> = free.into_iter().collect();
                        sorted.sort_unstable();
                        Some(sorted.into_iter().take(job.num_gpus as usize).collect())
                    } else {
                        None
                    }
                }
            };

            let Some(gpus) = chosen else { continue };

            let mut started = engine::start_job(&self.store, self.runner.as_ref(), &self.jobs_root, &job, &gpus);
            if started.status == JobStatus::Running {
                let message_ids = self.notifier.notify_started(&started).await;
                started.notification_messages.extend(message_ids);
                self.store.update_job(&started)?;
            } else {
                self.store.update_job(&started)?;
                self.notifier.notify_terminal(&started).await;
            }
            // Only one job starts per tick (§4.5 task 2).
            break;
        }
        Ok(())
    }

    /// Requested pinned GPUs for a still-queued job (§3 `requested_gpu_idxs`,
    /// carried from submission until the job actually starts running).
    fn pending_pinned_gpus(&self, job: &crate::job::Job) -> Option<Vec<u32>> {
        job.requested_gpu_idxs.clone()
    }

    /// Task 3: probe for tracker URLs (e.g. wandb) under each running job's
    /// directory; amend any already-sent notification with the discovered URL.
    async fn discover_tracker_urls(&self) -> crate::error::Result<()> {
        let running = self.store.list_jobs(&JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        })?;
        let now = crate::util::now_secs();
        for job in running {
            if !job.search_wandb || job.wandb_url.is_some() {
                continue;
            }
            let age = now - job.started_at.unwrap_or(now);
            if age > self.config.wandb_discovery_cap_secs as f64 {
                continue;
            }
            let Some(dir) = &job.dir else { continue };
            if let Some(url) = probe_wandb_url(dir) {
                let mut updated = job.clone();
                updated.wandb_url = Some(url.clone());
                self.store.update_job(&updated)?;
                self.notifier.notify_tracker_url(&updated, &url).await;
            }
        }
        Ok(())
    }

    /// Task 4: purely observational resource sampling.
    async fn system_health(&self) -> crate::error::Result<()> {
        let sample = crate::health::sample();
        if sample.mem_used_pct > 0.9 {
            tracing::warn!(pct = sample.mem_used_pct, "memory usage high");
        }
        if sample.disk_used_pct > 0.9 {
            tracing::warn!(pct = sample.disk_used_pct, "disk usage high");
        }
        Ok(())
    }
}

async fn run_bounded<F>(timeout: Duration, name: &'static str, fut: F) -> crate::error::Result<()>
where
    F: std::future::Future<Output = crate::error::Result<()>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(task = name, "scheduler task exceeded call timeout");
            Ok(())
        }
    }
}

/// Looks for a `wandb`-style run directory under the job's extracted source
/// tree and reads the URL out of its metadata file, if present.
fn probe_wandb_url(job_dir: &std::path::Path) -> Option<String> {
    let wandb_dir = job_dir.join("repo").join("wandb").join("latest-run");
    let meta_path = wandb_dir.join("files").join("wandb-metadata.json");
    let contents = std::fs::read_to_string(meta_path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&contents).ok()?;
    value
        .get("url")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

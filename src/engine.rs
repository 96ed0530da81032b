//! Side-effecting half of the Job Engine (§4.4): artifact extraction, working
//! directory management, and the actual Session Runner calls. `job.rs` holds
//! the pure transforms this module wraps.

use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::job::{build_env, build_script, Job, JobStatus};
use crate::session::SessionRunner;
use crate::store::Store;
use crate::util::now_secs;

pub fn session_name(job_id: &str) -> String {
    format!("nexus_job_{job_id}")
}

pub fn job_dir(jobs_root: &Path, job_id: &str) -> PathBuf {
    jobs_root.join(job_id)
}

/// Picks a 6-character id not already present in the store.
pub fn generate_id(store: &Store) -> crate::error::Result<String> {
    for _ in 0..32 {
        let candidate = crate::util::random_id();
        match store.get_job(&candidate) {
            Err(crate::error::NexusError::NotFound(_)) => return Ok(candidate),
            Err(e) => return Err(e),
            Ok(_) => continue,
        }
    }
    Err(crate::error::NexusError::Internal(
        "failed to allocate a unique job id".into(),
    ))
}

fn extract_artifact(bytes: &[u8], dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Extracts the artifact, writes the wrapper script, and asks the Session
/// Runner to start it. Never returns `Err`: on any failure the job comes back
/// as `failed` with `error_message` set, matching §4.4 `start_job`.
pub fn start_job(
    store: &Store,
    runner: &dyn SessionRunner,
    jobs_root: &Path,
    job: &Job,
    gpus: &[u32],
) -> Job {
    let dir = job_dir(jobs_root, &job.id);
    let repo = dir.join("repo");

    let result: std::io::Result<u32> = (|| {
        let artifact = store
            .get_artifact(&job.artifact_id)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        extract_artifact(&artifact, &repo)?;

        let script_path = dir.join("run.sh");
        std::fs::write(&script_path, build_script(job))?;
        make_executable(&script_path)?;

        let env = build_env(job, gpus);
        let name = session_name(&job.id);
        runner
            .start(&name, &dir, &script_path, &env)
            .map_err(|e| std::io::Error::other(e.to_string()))
    })();

    let mut next = job.clone();
    match result {
        Ok(pid) => {
            next.status = JobStatus::Running;
            next.pid = Some(pid);
            next.dir = Some(dir);
            next.gpu_idxs = gpus.to_vec();
            next.started_at = Some(now_secs());
            next.screen_session_name = Some(session_name(&job.id));
        }
        Err(e) => {
            let _ = std::fs::remove_dir_all(&dir);
            next.status = JobStatus::Failed;
            next.error_message = Some(format!("launch failed: {e}"));
            next.completed_at = Some(now_secs());
        }
    }
    next
}

/// Deletes the extracted source tree; `output.log`/`error.log` live directly
/// under `dir` and are left in place.
pub fn cleanup_job(jobs_root: &Path, job: &Job) -> std::io::Result<()> {
    let dir = job.dir.clone().unwrap_or_else(|| job_dir(jobs_root, &job.id));
    let repo = dir.join("repo");
    if repo.exists() {
        std::fs::remove_dir_all(&repo)?;
    }
    Ok(())
}

/// Synchronous kill via the Session Runner. Does not transition the record —
/// the scheduler observes the death on its next tick and calls `end_job`.
pub fn kill_job(runner: &dyn SessionRunner, job: &Job) -> crate::error::Result<()> {
    if let Some(name) = &job.screen_session_name {
        runner.kill(name)?;
    }
    Ok(())
}

pub fn read_output_log(jobs_root: &Path, job: &Job) -> std::io::Result<String> {
    let dir = job.dir.clone().unwrap_or_else(|| job_dir(jobs_root, &job.id));
    std::fs::read_to_string(dir.join("output.log"))
}

/// Copies `dir/repo/<output_file>` to a well-known path once a job with
/// `output_file` set completes successfully (§4.5 task 1). Copy failures are
/// the caller's to log; this never fails the job.
pub fn stage_output_file(jobs_root: &Path, job: &Job) -> std::io::Result<Option<PathBuf>> {
    let Some(rel) = &job.output_file else {
        return Ok(None);
    };
    let dir = job.dir.clone().unwrap_or_else(|| job_dir(jobs_root, &job.id));
    let src = dir.join("repo").join(rel);
    let flattened = crate::util::flatten_path(rel);
    let dest = std::env::temp_dir().join(format!("nexus-{}-{}", job.id, flattened));
    std::fs::copy(&src, &dest)?;
    Ok(Some(dest))
}

/// GPU indices currently claimed by a running job, used by the scheduler to
/// build the `busy` set passed to `GpuProbe::available_indices`.
pub fn busy_gpus(jobs: &[Job]) -> HashSet<u32> {
    jobs.iter()
        .filter(|j| j.status == JobStatus::Running)
        .flat_map(|j| j.gpu_idxs.iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{create_job, JobRequest};
    use crate::session::fake::FakeRunner;
    use crate::store::Store;
    use std::collections::HashMap;

    fn req() -> JobRequest {
        JobRequest {
            command: "echo hi".into(),
            user: "u".into(),
            git_repo_url: String::new(),
            git_tag: String::new(),
            git_branch: String::new(),
            artifact_id: "art".into(),
            num_gpus: 1,
            gpu_idxs: None,
            priority: 0,
            search_wandb: false,
            notifications: vec![],
            env: HashMap::new(),
            jobrc: None,
            run_immediately: false,
            ignore_blacklist: false,
            output_file: None,
        }
    }

    fn empty_tar_gz() -> Vec<u8> {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        {
            let mut builder = tar::Builder::new(&mut gz);
            builder.finish().unwrap();
        }
        gz.finish().unwrap()
    }

    #[test]
    fn start_job_extracts_artifact_and_launches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        store.add_artifact("art", &empty_tar_gz()).unwrap();
        let job = create_job(req(), "jobaaa1".into(), "node").unwrap();
        let runner = FakeRunner::default();

        let started = start_job(&store, &runner, dir.path(), &job, &[0]);
        assert_eq!(started.status, JobStatus::Running);
        assert_eq!(started.gpu_idxs, vec![0]);
        assert!(started.pid.is_some());
        assert!(runner.is_alive(started.screen_session_name.as_ref().unwrap()));
        assert!(job_dir(dir.path(), "jobaaa1").join("repo").exists());
    }

    #[test]
    fn start_job_missing_artifact_fails_without_touching_gpus() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let job = create_job(req(), "jobaaa1".into(), "node").unwrap();
        let runner = FakeRunner::default();

        let started = start_job(&store, &runner, dir.path(), &job, &[0]);
        assert_eq!(started.status, JobStatus::Failed);
        assert!(started.gpu_idxs.is_empty());
        assert!(started.error_message.is_some());
    }

    #[test]
    fn cleanup_job_removes_repo_but_keeps_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        store.add_artifact("art", &empty_tar_gz()).unwrap();
        let job = create_job(req(), "jobaaa1".into(), "node").unwrap();
        let runner = FakeRunner::default();
        let started = start_job(&store, &runner, dir.path(), &job, &[0]);

        std::fs::write(started.dir.as_ref().unwrap().join("output.log"), "hi").unwrap();
        cleanup_job(dir.path(), &started).unwrap();

        assert!(!started.dir.as_ref().unwrap().join("repo").exists());
        assert!(started.dir.as_ref().unwrap().join("output.log").exists());
    }

    #[test]
    fn kill_job_is_noop_without_session_name() {
        let job = create_job(req(), "jobaaa1".into(), "node").unwrap();
        let runner = FakeRunner::default();
        kill_job(&runner, &job).unwrap();
    }

    #[test]
    fn busy_gpus_only_counts_running_jobs() {
        let mut running = create_job(req(), "jobaaa1".into(), "node").unwrap();
        running.status = JobStatus::Running;
        running.gpu_idxs = vec![0, 1];
        let queued = create_job(req(), "jobbbb1".into(), "node").unwrap();

        let busy = busy_gpus(&[running, queued]);
        assert_eq!(busy, HashSet::from([0, 1]));
    }
}

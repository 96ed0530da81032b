//! The job record and the pure transformations over it (§4.4 of the design doc).
//!
//! Side effects (filesystem, session runner, notifier) live in `engine` and
//! `scheduler`; everything here is a value-in, value-out transform so the
//! transition logic can be exercised without a live tmux/nvml/sqlite stack.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use strum::{Display, EnumString};

use crate::error::{NexusError, Result};
use crate::util::now_secs;

#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display, EnumString, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed
        )
    }

    /// Invariant 6: monotone transitions, no back-edges.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Killed)
        )
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display, EnumString, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationChannel {
    Discord,
    Phone,
}

#[derive(Debug)]
pub enum JobError {
    InvalidTransition { from: JobStatus, to: JobStatus },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::InvalidTransition { from, to } => {
                write!(f, "invalid transition from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for JobError {}

/// Immutable job record. Transitions produce new records via `.transitioned(...)`-style
/// helpers below rather than mutating a live instance in place.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub command: CompactString,
    pub user: CompactString,
    pub node_name: CompactString,
    pub priority: i64,
    pub num_gpus: u32,
    pub gpu_idxs: Vec<u32>,
    pub requested_gpu_idxs: Option<Vec<u32>>,
    pub git_repo_url: CompactString,
    pub git_branch: CompactString,
    pub git_tag: CompactString,
    pub artifact_id: String,
    pub env: HashMap<String, String>,
    pub jobrc: Option<String>,
    pub notifications: HashSet<NotificationChannel>,
    pub search_wandb: bool,
    pub ignore_blacklist: bool,
    pub status: JobStatus,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub pid: Option<u32>,
    pub dir: Option<PathBuf>,
    pub screen_session_name: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub wandb_url: Option<String>,
    pub marked_for_kill: bool,
    pub notification_messages: HashMap<String, String>,
    pub output_file: Option<String>,
}

impl Default for Job {
    fn default() -> Self {
        Job {
            id: String::new(),
            command: CompactString::default(),
            user: CompactString::default(),
            node_name: CompactString::default(),
            priority: 0,
            num_gpus: 1,
            gpu_idxs: Vec::new(),
            requested_gpu_idxs: None,
            git_repo_url: CompactString::default(),
            git_branch: CompactString::default(),
            git_tag: CompactString::default(),
            artifact_id: String::new(),
            env: HashMap::new(),
            jobrc: None,
            notifications: HashSet::new(),
            search_wandb: false,
            ignore_blacklist: false,
            status: JobStatus::Queued,
            created_at: 0.0,
            started_at: None,
            completed_at: None,
            pid: None,
            dir: None,
            screen_session_name: None,
            exit_code: None,
            error_message: None,
            wandb_url: None,
            marked_for_kill: false,
            notification_messages: HashMap::new(),
            output_file: None,
        }
    }
}

/// Body of `POST /v1/jobs`.
#[derive(Debug, Deserialize, Clone)]
pub struct JobRequest {
    pub command: String,
    pub user: String,
    pub git_repo_url: String,
    pub git_tag: String,
    pub git_branch: String,
    pub artifact_id: String,
    #[serde(default = "default_num_gpus")]
    pub num_gpus: u32,
    #[serde(default)]
    pub gpu_idxs: Option<Vec<u32>>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub search_wandb: bool,
    #[serde(default)]
    pub notifications: Vec<NotificationChannel>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub jobrc: Option<String>,
    #[serde(default)]
    pub run_immediately: bool,
    #[serde(default)]
    pub ignore_blacklist: bool,
    #[serde(default)]
    pub output_file: Option<String>,
}

fn default_num_gpus() -> u32 {
    1
}

/// Body of `PATCH /v1/jobs/{id}` — only legal on `queued` jobs.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct JobPatch {
    pub command: Option<String>,
    pub priority: Option<i64>,
}

/// Validates a request and stamps a new `queued` record. Pure aside from reading the clock.
pub fn create_job(req: JobRequest, id: String, node_name: &str) -> Result<Job> {
    if req.command.trim().is_empty() {
        return Err(NexusError::Validation("command must not be empty".into()));
    }
    if req.num_gpus == 0 {
        return Err(NexusError::Validation("num_gpus must be >= 1".into()));
    }
    if let Some(ref pinned) = req.gpu_idxs {
        if pinned.len() as u32 != req.num_gpus {
            return Err(NexusError::Validation(
                "gpu_idxs must contain exactly num_gpus indices".into(),
            ));
        }
    }

    Ok(Job {
        id,
        command: req.command.into(),
        user: req.user.into(),
        node_name: node_name.into(),
        priority: req.priority,
        num_gpus: req.num_gpus,
        gpu_idxs: Vec::new(),
        requested_gpu_idxs: req.gpu_idxs.clone(),
        git_repo_url: req.git_repo_url.into(),
        git_branch: req.git_branch.into(),
        git_tag: req.git_tag.into(),
        artifact_id: req.artifact_id,
        env: req.env,
        jobrc: req.jobrc,
        notifications: req.notifications.into_iter().collect(),
        search_wandb: req.search_wandb,
        ignore_blacklist: req.ignore_blacklist,
        status: JobStatus::Queued,
        created_at: now_secs(),
        output_file: req.output_file,
        ..Job::default()
    })
}

/// The union of the current process environment, user-supplied extras, and system
/// injections (§4.4 `build_env`).
pub fn build_env(job: &Job, assigned_gpus: &[u32]) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(job.env.clone());

    let gpu_csv = assigned_gpus
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    env.insert("CUDA_VISIBLE_DEVICES".to_string(), gpu_csv.clone());
    env.insert("NEXUS_JOB_ID".to_string(), job.id.clone());
    env.insert("NEXUS_GPU_IDS".to_string(), gpu_csv);
    if !job.git_tag.is_empty() {
        env.insert("NEXUS_GIT_TAG".to_string(), job.git_tag.to_string());
    }
    env
}

/// Generates the two-level wrapper script (§4.4 `build_script`).
///
/// The outer script changes into `dir/repo`, sources `jobrc` if present, runs the
/// inner script, and appends the exit-code sentinel. The inner script runs the user
/// command verbatim under a login shell so `conda activate`-style rc customizations
/// behave the way an interactive session would.
pub fn build_script(job: &Job) -> String {
    let mut outer = String::new();
    outer.push_str("#!/bin/sh\n");
    outer.push_str("cd \"$(dirname \"$0\")/repo\" || exit 1\n");
    if let Some(jobrc) = &job.jobrc {
        outer.push_str(jobrc);
        outer.push('\n');
    }
    outer.push_str(&format!(
        "bash -lc {}\n",
        shell_escape::escape(job.command.as_str().into())
    ));
    outer.push_str("echo \"COMMAND_EXIT_CODE=$?\"\n");
    outer
}

/// Scans `output.log` for the exit-code sentinel (§4.4 `end_job`, design note on
/// last-match-wins parsing). Scans from the end and stops at the first match so a
/// user command that happens to print the same string earlier doesn't confuse us.
pub fn parse_exit_code(log: &str) -> Option<i32> {
    const PREFIX: &str = "COMMAND_EXIT_CODE=";
    log.lines()
        .rev()
        .find_map(|line| line.strip_prefix(PREFIX))
        .and_then(|rest| rest.trim().parse::<i32>().ok())
}

/// Produces the terminal record for a job whose session has ended (§4.4 `end_job`).
pub fn end_job(job: &Job, killed: bool, output_log: &str) -> Result<Job> {
    if job.status != JobStatus::Running {
        return Err(NexusError::Conflict(format!(
            "job {} is not running",
            job.id
        )));
    }

    let mut next = job.clone();
    next.completed_at = Some(now_secs());

    if killed {
        next.status = JobStatus::Killed;
        next.exit_code = parse_exit_code(output_log);
        return Ok(next);
    }

    match parse_exit_code(output_log) {
        None => {
            next.status = JobStatus::Failed;
            next.error_message = Some("no exit code recorded".to_string());
        }
        Some(0) => {
            next.status = JobStatus::Completed;
            next.exit_code = Some(0);
        }
        Some(n) => {
            next.status = JobStatus::Failed;
            next.exit_code = Some(n);
            next.error_message = Some(format!("command exited with code {n}"));
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> JobRequest {
        JobRequest {
            command: "echo hi".into(),
            user: "u".into(),
            git_repo_url: String::new(),
            git_tag: String::new(),
            git_branch: String::new(),
            artifact_id: "art1".into(),
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

    #[test]
    fn create_job_rejects_empty_command() {
        let mut req = base_request();
        req.command = "   ".into();
        let err = create_job(req, "abcdef".into(), "node").unwrap_err();
        assert!(matches!(err, NexusError::Validation(_)));
    }

    #[test]
    fn create_job_rejects_zero_gpus() {
        let mut req = base_request();
        req.num_gpus = 0;
        let err = create_job(req, "abcdef".into(), "node").unwrap_err();
        assert!(matches!(err, NexusError::Validation(_)));
    }

    #[test]
    fn create_job_rejects_mismatched_pinned_gpus() {
        let mut req = base_request();
        req.num_gpus = 2;
        req.gpu_idxs = Some(vec![0]);
        let err = create_job(req, "abcdef".into(), "node").unwrap_err();
        assert!(matches!(err, NexusError::Validation(_)));
    }

    #[test]
    fn create_job_stamps_queued_record() {
        let job = create_job(base_request(), "abcdef".into(), "node0").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.gpu_idxs.is_empty());
        assert!(job.started_at.is_none());
        assert_eq!(job.node_name, "node0");
    }

    #[test]
    fn build_env_injects_system_variables() {
        let job = create_job(base_request(), "abcdef".into(), "node0").unwrap();
        let env = build_env(&job, &[0, 1]);
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").unwrap(), "0,1");
        assert_eq!(env.get("NEXUS_JOB_ID").unwrap(), "abcdef");
        assert_eq!(env.get("NEXUS_GPU_IDS").unwrap(), "0,1");
    }

    #[test]
    fn build_script_embeds_sentinel_and_command() {
        let job = create_job(base_request(), "abcdef".into(), "node0").unwrap();
        let script = build_script(&job);
        assert!(script.contains("COMMAND_EXIT_CODE=$?"));
        assert!(script.contains("echo hi"));
    }

    #[test]
    fn parse_exit_code_takes_last_sentinel() {
        let log = "COMMAND_EXIT_CODE=7\nuser noise\nCOMMAND_EXIT_CODE=0\n";
        assert_eq!(parse_exit_code(log), Some(0));
    }

    #[test]
    fn parse_exit_code_missing_sentinel_is_none() {
        assert_eq!(parse_exit_code("no sentinel here\n"), None);
    }

    fn running_job() -> Job {
        let mut job = create_job(base_request(), "abcdef".into(), "node0").unwrap();
        job.status = JobStatus::Running;
        job.gpu_idxs = vec![0];
        job.started_at = Some(now_secs());
        job.screen_session_name = Some("nexus_job_abcdef".into());
        job
    }

    #[test]
    fn end_job_classifies_success() {
        let job = running_job();
        let ended = end_job(&job, false, "COMMAND_EXIT_CODE=0\n").unwrap();
        assert_eq!(ended.status, JobStatus::Completed);
        assert_eq!(ended.exit_code, Some(0));
        assert!(ended.completed_at.is_some());
    }

    #[test]
    fn end_job_classifies_failure() {
        let job = running_job();
        let ended = end_job(&job, false, "COMMAND_EXIT_CODE=1\n").unwrap();
        assert_eq!(ended.status, JobStatus::Failed);
        assert_eq!(ended.exit_code, Some(1));
    }

    #[test]
    fn end_job_missing_sentinel_is_failed_with_message() {
        let job = running_job();
        let ended = end_job(&job, false, "nothing useful\n").unwrap();
        assert_eq!(ended.status, JobStatus::Failed);
        assert_eq!(ended.exit_code, None);
        assert_eq!(ended.error_message.as_deref(), Some("no exit code recorded"));
    }

    #[test]
    fn end_job_killed_overrides_exit_code_classification() {
        let job = running_job();
        let ended = end_job(&job, true, "COMMAND_EXIT_CODE=1\n").unwrap();
        assert_eq!(ended.status, JobStatus::Killed);
    }

    #[test]
    fn end_job_rejects_non_running_job() {
        let job = create_job(base_request(), "abcdef".into(), "node0").unwrap();
        let err = end_job(&job, false, "COMMAND_EXIT_CODE=0\n").unwrap_err();
        assert!(matches!(err, NexusError::Conflict(_)));
    }

    #[test]
    fn status_transition_table_is_monotone() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Queued));
    }

    use proptest::prelude::*;

    proptest! {
        /// P5 (Exit classification): a sentinel `COMMAND_EXIT_CODE=N` yields
        /// `completed` iff N==0, `failed` otherwise; exit_code always matches N.
        #[test]
        fn prop_exit_classification_matches_sentinel(n: i32) {
            let job = running_job();
            let log = format!("some program output\nCOMMAND_EXIT_CODE={n}\n");
            let ended = end_job(&job, false, &log).unwrap();
            if n == 0 {
                prop_assert_eq!(ended.status, JobStatus::Completed);
            } else {
                prop_assert_eq!(ended.status, JobStatus::Failed);
                prop_assert!(ended.error_message.is_some());
            }
            prop_assert_eq!(ended.exit_code, Some(n));
        }

        /// P6 (Kill idempotency): running `end_job(..., killed=true, ...)` against
        /// the already-terminal record it produced yields the same status and
        /// exit_code (the single-application result, not a double-kill record).
        #[test]
        fn prop_kill_is_idempotent(n: i32) {
            let job = running_job();
            let log = format!("COMMAND_EXIT_CODE={n}\n");
            let once = end_job(&job, true, &log).unwrap();

            let mut still_running = once.clone();
            still_running.status = JobStatus::Running;
            let twice = end_job(&still_running, true, &log).unwrap();

            prop_assert_eq!(once.status, twice.status);
            prop_assert_eq!(once.exit_code, twice.exit_code);
            prop_assert_eq!(once.status, JobStatus::Killed);
        }
    }
}

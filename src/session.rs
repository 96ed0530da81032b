//! The detachable terminal session abstraction (§4.3). Conceptually a
//! `screen`-style named session that survives disconnection; here backed by
//! `tmux_interface`, matching the only session technology this codebase has
//! ever shipped with.

use std::collections::HashMap;
use std::path::Path;
use tmux_interface::{NewSession, SendKeys, Tmux};

use crate::error::{NexusError, Result};

pub trait SessionRunner: Send + Sync {
    /// Creates a detached session named `name`, runs `script_path` inside `working_dir`
    /// with `env`, redirecting stdout+stderr to `working_dir/output.log` and stderr
    /// additionally to `working_dir/error.log`. Returns the session leader's PID.
    fn start(
        &self,
        name: &str,
        working_dir: &Path,
        script_path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<u32>;

    /// Sends a terminate signal, then (after a grace period) an unconditional kill.
    /// Idempotent: killing an already-dead or unknown session is not an error.
    fn kill(&self, name: &str) -> Result<()>;

    fn is_alive(&self, name: &str) -> bool;
}

pub struct TmuxRunner {
    pub kill_grace: std::time::Duration,
}

impl Default for TmuxRunner {
    fn default() -> Self {
        Self {
            kill_grace: std::time::Duration::from_secs(3),
        }
    }
}

impl TmuxRunner {
    fn session_leader_pid(name: &str) -> Option<u32> {
        let output = Tmux::with_command(
            tmux_interface::ListPanes::new()
                .target(name)
                .format("#{pane_pid}"),
        )
        .output()
        .ok()?;
        if !output.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout())
            .lines()
            .next()
            .and_then(|l| l.trim().parse().ok())
    }
}

impl SessionRunner for TmuxRunner {
    fn start(
        &self,
        name: &str,
        working_dir: &Path,
        script_path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<u32> {
        let output = Tmux::new()
            .add_command(
                NewSession::new()
                    .detached()
                    .session_name(name)
                    .start_directory(working_dir.to_string_lossy().to_string()),
            )
            .output()
            .map_err(|e| NexusError::LaunchFailed(format!("tmux new-session failed: {e}")))?;
        if !output.success() {
            return Err(NexusError::LaunchFailed(format!(
                "tmux refused to create session {name}"
            )));
        }

        let env_prefix: String = env
            .iter()
            .map(|(k, v)| format!("{k}={} ", shell_escape::escape(v.into())))
            .collect();
        let script = script_path.to_string_lossy();
        let out_log = working_dir.join("output.log");
        let err_log = working_dir.join("error.log");
        let command = format!(
            "{env_prefix}sh {script} > {out} 2> >(tee -a {err} >> {out})",
            script = script,
            out = out_log.to_string_lossy(),
            err = err_log.to_string_lossy(),
        );

        Tmux::new()
            .add_command(SendKeys::new().target_pane(name).key(command))
            .add_command(SendKeys::new().target_pane(name).key("Enter"))
            .output()
            .map_err(|e| NexusError::LaunchFailed(format!("failed to start job command: {e}")))?;

        Self::session_leader_pid(name)
            .ok_or_else(|| NexusError::LaunchFailed(format!("could not read pid for {name}")))
    }

    fn kill(&self, name: &str) -> Result<()> {
        if !self.is_alive(name) {
            return Ok(());
        }
        Tmux::with_command(SendKeys::new().target_pane(name).key("C-c")).output().ok();
        std::thread::sleep(self.kill_grace);
        Tmux::with_command(tmux_interface::KillSession::new().target_session(name))
            .output()
            .ok();
        Ok(())
    }

    fn is_alive(&self, name: &str) -> bool {
        Tmux::with_command(tmux_interface::HasSession::new().target_session(name))
            .output()
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

/// In-memory double used by engine/scheduler tests so they don't depend on a
/// real tmux binary being present.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeRunner {
        pub alive: Mutex<std::collections::HashSet<String>>,
        pub next_pid: Mutex<u32>,
    }

    impl SessionRunner for FakeRunner {
        fn start(
            &self,
            name: &str,
            _working_dir: &Path,
            _script_path: &Path,
            _env: &HashMap<String, String>,
        ) -> Result<u32> {
            self.alive.lock().unwrap().insert(name.to_string());
            let mut pid = self.next_pid.lock().unwrap();
            *pid += 1;
            Ok(*pid)
        }

        fn kill(&self, name: &str) -> Result<()> {
            self.alive.lock().unwrap().remove(name);
            Ok(())
        }

        fn is_alive(&self, name: &str) -> bool {
            self.alive.lock().unwrap().contains(name)
        }
    }
}

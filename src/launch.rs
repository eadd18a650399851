//! Detached child spawn.
//!
//! The child gets its own session (`setsid`), stdin from `/dev/null`, and
//! stdout/stderr appended to the log file, so it outlives the invoking
//! terminal and the supervisor itself.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::CommandSpec;
use crate::error::LaunchError;

/// Spawns the managed command and returns its pid.
pub trait Launcher {
    fn launch(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32, LaunchError>;
}

impl<L: Launcher + ?Sized> Launcher for &L {
    fn launch(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32, LaunchError> {
        (**self).launch(spec, log_path)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn launch(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32, LaunchError> {
        let mut log = open_log(log_path)?;
        let log_err = |source| LaunchError::LogFile {
            path: log_path.to_path_buf(),
            source,
        };
        writeln!(
            log,
            "--- portkeeper: starting `{}` at {} ---",
            spec.display(),
            chrono::Local::now().to_rfc3339()
        )
        .map_err(log_err)?;
        let stderr = log.try_clone().map_err(log_err)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // New session: no controlling terminal, own process group.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        log::info!("spawned `{}` with pid {pid}", spec.display());
        Ok(pid)
    }
}

fn open_log(path: &Path) -> Result<File, LaunchError> {
    let err = |source| LaunchError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(err)?;
    }
    OpenOptions::new().create(true).append(true).open(path).map_err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ProcessController;
    use std::time::{Duration, Instant};

    fn wait_dead(pid: u32) {
        let c = ProcessController::default();
        let deadline = Instant::now() + Duration::from_secs(5);
        while c.is_alive(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_output_is_appended_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("app.log");
        fs::create_dir_all(log.parent().unwrap()).unwrap();
        fs::write(&log, "previous run\n").unwrap();

        let mut spec = CommandSpec::new("sh", ["-c", "echo out-$GREETING; echo err >&2"]);
        spec.env.insert("GREETING".into(), "hello".into());
        let pid = DetachedLauncher.launch(&spec, &log).unwrap();
        wait_dead(pid);

        let text = fs::read_to_string(&log).unwrap();
        assert!(text.starts_with("previous run\n"), "{text}");
        assert!(text.contains("--- portkeeper: starting `sh -c"), "{text}");
        assert!(text.contains("out-hello"), "{text}");
        assert!(text.contains("err"), "{text}");
    }

    #[test]
    fn test_child_runs_in_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let spec = CommandSpec::new("sleep", ["5"]);
        let pid = DetachedLauncher.launch(&spec, &log).unwrap();

        let nix_pid = nix::unistd::Pid::from_raw(pid as i32);
        // setsid may not have run yet right after fork
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut sid = nix::unistd::getsid(Some(nix_pid)).unwrap();
        while sid != nix_pid && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            sid = nix::unistd::getsid(Some(nix_pid)).unwrap();
        }
        assert_eq!(sid, nix_pid);

        ProcessController::default()
            .terminate(pid, Duration::from_secs(2))
            .unwrap();
    }

    #[test]
    fn test_working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let mut spec = CommandSpec::new("sh", ["-c", "pwd"]);
        spec.working_dir = Some(dir.path().to_path_buf());
        let pid = DetachedLauncher.launch(&spec, &log).unwrap();
        wait_dead(pid);

        let text = fs::read_to_string(&log).unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(text.contains(canonical.to_str().unwrap()), "{text}");
    }

    #[test]
    fn test_missing_program_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("/nonexistent/portkeeper-test-binary", Vec::<String>::new());
        let err = DetachedLauncher.launch(&spec, &dir.path().join("app.log")).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}

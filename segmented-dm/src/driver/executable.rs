//! Backend that launches the vendor executable once per command.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{DriverBackend, DriverError, DriverResult};
use crate::config::UnitParams;

/// Interval between exit-status checks while the driver runs.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs `<executable> <mirror serial> <driver serial> <command file>`.
///
/// Success is a zero exit status. A run that outlives its timeout is killed
/// and reaped; the mirror may have moved partway.
#[derive(Debug, Default)]
pub struct ExecutableDriver {
    runs: u64,
}

impl ExecutableDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed driver runs.
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

/// Running driver process, killed and reaped on drop unless it has exited.
struct DriverProcess {
    child: Child,
    exited: bool,
}

impl DriverProcess {
    fn new(child: Child) -> Self {
        Self {
            child,
            exited: false,
        }
    }

    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.exited = status.is_some();
        Ok(status)
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        warn!("Killing driver pid {}", self.child.id());
        if let Err(e) = self.child.kill() {
            warn!("Failed to kill driver: {e}");
        }
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap driver: {e}");
        }
    }
}

fn check_executable(path: &Path) -> DriverResult<()> {
    if !path.is_file() {
        return Err(DriverError::ExecutableMissing(path.to_path_buf()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o111 == 0 {
            return Err(DriverError::NotExecutable(path.to_path_buf()));
        }
    }
    Ok(())
}

impl DriverBackend for ExecutableDriver {
    fn start(&mut self, unit: &UnitParams) -> DriverResult<()> {
        check_executable(&unit.executable)?;
        debug!(
            "Using driver {} for mirror {} on driver {}",
            unit.executable.display(),
            unit.mirror_serial,
            unit.driver_serial
        );
        Ok(())
    }

    fn apply_file(
        &mut self,
        unit: &UnitParams,
        command_file: &Path,
        timeout: Duration,
    ) -> DriverResult<()> {
        debug!(
            "Running {} {} {} {}",
            unit.executable.display(),
            unit.mirror_serial,
            unit.driver_serial,
            command_file.display()
        );

        let child = Command::new(&unit.executable)
            .arg(&unit.mirror_serial)
            .arg(&unit.driver_serial)
            .arg(command_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| DriverError::Spawn {
                path: unit.executable.clone(),
                source,
            })?;
        let mut process = DriverProcess::new(child);

        let start = Instant::now();
        loop {
            if let Some(status) = process.try_wait()? {
                self.runs += 1;
                debug!("Driver exited with {status} after {:?}", start.elapsed());
                return if status.success() {
                    Ok(())
                } else {
                    Err(DriverError::Failed {
                        code: status.code(),
                    })
                };
            }

            if start.elapsed() > timeout {
                warn!("Driver pid {} exceeded {timeout:?}", process.id());
                return Err(DriverError::Timeout(timeout));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop(&mut self, unit: &UnitParams) -> DriverResult<()> {
        debug!("Released mirror {}", unit.mirror_serial);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn unit(executable: PathBuf) -> UnitParams {
        UnitParams {
            mirror_serial: "M1".to_string(),
            driver_serial: "D1".to_string(),
            executable,
        }
    }

    fn have_shell() -> bool {
        Path::new("/bin/sh").exists()
    }

    #[test]
    fn test_start_requires_existing_file() {
        let mut driver = ExecutableDriver::new();
        let err = driver
            .start(&unit(PathBuf::from("/nonexistent/dm_driver")))
            .unwrap_err();
        assert!(matches!(err, DriverError::ExecutableMissing(_)));
    }

    #[test]
    fn test_start_requires_execute_permission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver");
        fs::write(&path, "").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = ExecutableDriver::new().start(&unit(path)).unwrap_err();
        assert!(matches!(err, DriverError::NotExecutable(_)));
    }

    #[test]
    fn test_passes_serials_and_file() {
        if !have_shell() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.txt");
        let exe = script(dir.path(), "driver", &format!("echo \"$@\" > {}", log.display()));
        let command_file = dir.path().join("command.ini");
        fs::write(&command_file, "").unwrap();

        let mut driver = ExecutableDriver::new();
        let unit = unit(exe);
        driver.start(&unit).unwrap();
        driver
            .apply_file(&unit, &command_file, Duration::from_secs(5))
            .unwrap();

        let args = fs::read_to_string(&log).unwrap();
        assert_eq!(args.trim(), format!("M1 D1 {}", command_file.display()));
        assert_eq!(driver.runs(), 1);
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        if !have_shell() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "driver", "exit 3");

        let err = ExecutableDriver::new()
            .apply_file(&unit(exe), Path::new("unused.ini"), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, DriverError::Failed { code: Some(3) }));
    }

    #[test]
    fn test_timeout_kills_driver() {
        if !have_shell() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "driver", "sleep 10");

        let start = Instant::now();
        let err = ExecutableDriver::new()
            .apply_file(&unit(exe), Path::new("unused.ini"), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dropped_process_is_killed_and_reaped() {
        if !have_shell() {
            return;
        }
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 10")
            .spawn()
            .unwrap();
        let proc_dir = PathBuf::from(format!("/proc/{}", child.id()));
        assert!(proc_dir.exists());

        let start = Instant::now();
        drop(DriverProcess::new(child));
        assert!(!proc_dir.exists());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_exited_process_is_left_alone() {
        if !have_shell() {
            return;
        }
        let child = Command::new("/bin/sh").arg("-c").arg("exit 0").spawn().unwrap();
        let mut process = DriverProcess::new(child);
        let status = loop {
            if let Some(status) = process.try_wait().unwrap() {
                break status;
            }
            thread::sleep(POLL_INTERVAL);
        };
        assert!(status.success());
        assert!(process.exited);
    }
}

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::app::error::AppError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

fn wait_for_exit(
    child: &mut Child,
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<Option<i32>, AppError> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code()),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AppError::timeout(
                        format!("{program} {} timed out after {timeout:?}", args.join(" ")),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ))
            }
        }
    }
}

fn spawn(
    program: &str,
    args: &[String],
    stdout: Stdio,
    trace_id: &str,
) -> Result<Child, AppError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn {program}: {err}"), trace_id))
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut child = spawn(program, args, Stdio::piped(), trace_id)?;

    // Both pipes are drained on their own threads; a chatty child
    // would otherwise block on a full pipe and look like a timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    let exit_code = wait_for_exit(&mut child, program, args, timeout, trace_id);
    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code: exit_code?,
    })
}

/// Like [`run_command_with_timeout`], but stdout goes straight into
/// `destination` instead of memory. The returned `stdout` is empty.
pub fn run_to_file_with_timeout(
    program: &str,
    args: &[String],
    destination: &Path,
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let file = File::create(destination).map_err(|err| {
        AppError::system(
            format!("Failed to create {}: {err}", destination.display()),
            trace_id,
        )
    })?;
    let mut child = spawn(program, args, Stdio::from(file), trace_id)?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stderr_handle = drain(stderr);

    let exit_code = wait_for_exit(&mut child, program, args, timeout, trace_id);
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(CommandOutput {
        stdout: Vec::new(),
        stderr,
        exit_code: exit_code?,
    })
}

fn ensure_success(
    program: &str,
    args: &[String],
    output: CommandOutput,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    if !output.success() {
        return Err(AppError::dependency(
            format!(
                "{program} {} exited with {:?}: {}",
                args.join(" "),
                output.exit_code,
                output.stderr_text()
            ),
            trace_id,
        ));
    }
    Ok(output)
}

/// Runs the command and turns a non-zero exit into a dependency error.
pub fn run_checked(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let output = run_command_with_timeout(program, args, timeout, trace_id)?;
    ensure_success(program, args, output, trace_id)
}

pub fn run_checked_to_file(
    program: &str,
    args: &[String],
    destination: &Path,
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let output = run_to_file_with_timeout(program, args, destination, timeout, trace_id)?;
    ensure_success(program, args, output, trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> (String, Vec<String>) {
        if cfg!(windows) {
            ("cmd.exe".to_string(), vec!["/C".to_string(), script.to_string()])
        } else {
            ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
        }
    }

    #[test]
    fn run_command_with_timeout_does_not_deadlock_on_large_stdout() {
        let (program, args) = if cfg!(windows) {
            shell("for /L %i in (1,1,100000) do @echo 1234567890")
        } else {
            shell("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done")
        };

        let output = run_command_with_timeout(&program, &args, Duration::from_secs(10), "trace-big")
            .expect("expected large-output command to complete without timing out");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_times_out() {
        let (program, args) = shell("sleep 5");
        let err = run_command_with_timeout(&program, &args, Duration::from_millis(100), "trace-slow")
            .expect_err("expected timeout");
        assert_eq!(err.code, "ERR_TIMEOUT");
    }

    #[cfg(unix)]
    #[test]
    fn run_checked_reports_stderr_on_failure() {
        let (program, args) = shell("echo broken >&2; exit 3");
        let err = run_checked(&program, &args, Duration::from_secs(5), "trace-fail")
            .expect_err("expected failure");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(err.error.contains("broken"));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_streams_into_the_destination_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let destination = dir.path().join("report.txt");
        let (program, args) = shell("echo line one; echo line two; echo noise >&2");
        let output = run_checked_to_file(
            &program,
            &args,
            &destination,
            Duration::from_secs(5),
            "trace-file",
        )
        .expect("run");
        assert!(output.stdout.is_empty());
        assert_eq!(output.stderr_text(), "noise");
        assert_eq!(
            std::fs::read_to_string(&destination).expect("read"),
            "line one\nline two\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_to_file_is_dependency_error() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let (program, args) = shell("echo partial; exit 2");
        let err = run_checked_to_file(
            &program,
            &args,
            &dir.path().join("report.txt"),
            Duration::from_secs(5),
            "trace-file",
        )
        .expect_err("exit 2");
        assert_eq!(err.code, "ERR_DEPENDENCY");
    }

    #[test]
    fn missing_program_is_system_error() {
        let err = run_command_with_timeout(
            "definitely-not-a-real-binary-xyz",
            &[],
            Duration::from_secs(1),
            "trace-missing",
        )
        .expect_err("spawn should fail");
        assert_eq!(err.code, "ERR_SYSTEM");
    }
}

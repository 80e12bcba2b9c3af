use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::HarvestError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One invocation of an external binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Narrow capability for running external tools (`wget`, `psql`, the
/// container runtime). Spawn failures are errors; a non-zero exit or a
/// timeout is a regular [`CommandOutput`].
pub trait CommandRunner: Send + Sync {
    fn execute(&self, spec: &CommandSpec, timeout: Duration)
    -> Result<CommandOutput, HarvestError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn execute(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, HarvestError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                HarvestError::MissingTool(spec.program.clone())
            } else {
                HarvestError::CommandSpawn {
                    program: spec.program.clone(),
                    message: err.to_string(),
                }
            }
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let (exit_code, timed_out) = wait_with_timeout(&mut child, timeout, &spec.program)?;

        Ok(CommandOutput {
            exit_code,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            timed_out,
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    program: &str,
) -> Result<(Option<i32>, bool), HarvestError> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = child.try_wait().map_err(|err| HarvestError::CommandSpawn {
            program: program.to_string(),
            message: err.to_string(),
        })?;
        if let Some(status) = status {
            return Ok((status.code(), false));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok((None, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_command_line() {
        let spec = CommandSpec::new("wget")
            .arg("--tries=1")
            .args(["-O", "/tmp/out"])
            .env("A", "B");
        assert_eq!(spec.display(), "wget --tries=1 -O /tmp/out");
        assert_eq!(spec.env, vec![("A".to_string(), "B".to_string())]);
    }

    #[test]
    fn output_success_requires_zero_exit() {
        let ok = CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        };
        assert!(ok.success());
        let timed_out = CommandOutput {
            exit_code: Some(0),
            timed_out: true,
            ..CommandOutput::default()
        };
        assert!(!timed_out.success());
        assert!(!CommandOutput::default().success());
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_output() {
        let runner = SystemCommandRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = runner.execute(&spec, Duration::from_secs(10)).unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_kills_on_timeout() {
        let runner = SystemCommandRunner::new();
        let spec = CommandSpec::new("sleep").arg("5");
        let output = runner.execute(&spec, Duration::from_millis(200)).unwrap();
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
    }

    #[test]
    fn missing_program_is_reported() {
        let runner = SystemCommandRunner::new();
        let spec = CommandSpec::new("definitely-not-a-real-binary-gff-harvest");
        let err = runner.execute(&spec, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, HarvestError::MissingTool(_)));
    }
}

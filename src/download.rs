use std::fs;
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use regex::Regex;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::config::DownloadPolicy;
use crate::domain::DownloadOutcome;

/// Extra time granted to the transfer process beyond its own `--timeout`.
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// wget exit status for an error response from the server.
const WGET_SERVER_ERROR: i32 = 8;

static MISSING_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bERROR 404\b").expect("static regex"));

#[derive(Debug)]
enum Attempt {
    Done(u64),
    NotFound(String),
    Transient(String),
}

/// Fetches one URL to one local path with `wget`, retrying transient failures.
pub struct Downloader<C: CommandRunner> {
    runner: Arc<C>,
    policy: DownloadPolicy,
}

impl<C: CommandRunner> Downloader<C> {
    pub fn new(runner: Arc<C>, policy: DownloadPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn policy(&self) -> &DownloadPolicy {
        &self.policy
    }

    pub fn download(&self, url: &str, target: &Utf8Path) -> DownloadOutcome {
        let max_attempts = self.policy.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(url, target) {
                Attempt::Done(bytes) => {
                    info!(%url, attempt, bytes, "downloaded");
                    return DownloadOutcome::success(attempt, bytes, Some(url.to_string()));
                }
                Attempt::NotFound(message) => {
                    info!(%url, "not found on server");
                    return DownloadOutcome::not_found(attempt, message, Some(url.to_string()));
                }
                Attempt::Transient(message) => {
                    warn!(%url, attempt, max_attempts, error = %message, "download attempt failed");
                    last_error = message;
                    if attempt < max_attempts && !self.policy.retry_delay.is_zero() {
                        thread::sleep(self.policy.retry_delay);
                    }
                }
            }
        }

        DownloadOutcome::failed(max_attempts, last_error, Some(url.to_string()))
    }

    fn attempt(&self, url: &str, target: &Utf8Path) -> Attempt {
        let Some(parent) = target.parent() else {
            return Attempt::Transient(format!("{target} has no parent directory"));
        };
        if let Err(err) = fs::create_dir_all(parent.as_std_path()) {
            return Attempt::Transient(format!("create {parent}: {err}"));
        }
        let file_name = target.file_name().unwrap_or("download");
        let temp = match Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
        {
            Ok(temp) => temp,
            Err(err) => return Attempt::Transient(format!("temp file in {parent}: {err}")),
        };

        let spec = self.command(url, &temp.path().to_string_lossy());
        debug!(command = %spec.display(), "running transfer");
        let output = match self
            .runner
            .execute(&spec, self.policy.timeout + TIMEOUT_GRACE)
        {
            Ok(output) => output,
            Err(err) => return Attempt::Transient(err.to_string()),
        };

        match classify(&output) {
            Ok(()) => {}
            Err(attempt) => return attempt,
        }

        let bytes = match temp.as_file().metadata() {
            Ok(meta) => meta.len(),
            Err(err) => return Attempt::Transient(format!("stat temp file: {err}")),
        };
        match temp.persist(target.as_std_path()) {
            Ok(_) => Attempt::Done(bytes),
            Err(err) => Attempt::Transient(format!("persist {target}: {err}")),
        }
    }

    fn command(&self, url: &str, output_path: &str) -> CommandSpec {
        CommandSpec::new(&self.policy.wget).args([
            "--no-verbose".to_string(),
            format!("--timeout={}", self.policy.timeout.as_secs()),
            "--tries=1".to_string(),
            "-O".to_string(),
            output_path.to_string(),
            url.to_string(),
        ])
    }
}

fn classify(output: &CommandOutput) -> Result<(), Attempt> {
    if output.timed_out {
        return Err(Attempt::Transient("transfer timed out".to_string()));
    }
    if output.success() {
        return Ok(());
    }
    let stderr = output.stderr.trim();
    if output.exit_code == Some(WGET_SERVER_ERROR) && reports_missing(stderr) {
        return Err(Attempt::NotFound(last_line(stderr)));
    }
    let message = if stderr.is_empty() {
        format!("transfer exited with {:?}", output.exit_code)
    } else {
        last_line(stderr)
    };
    Err(Attempt::Transient(message))
}

fn reports_missing(stderr: &str) -> bool {
    MISSING_STATUS.is_match(stderr)
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or(text)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::DownloadStatus;
    use crate::error::HarvestError;

    /// Replays scripted outputs; a `Some(body)` writes `body` to the `-O` path.
    struct ScriptedWget {
        script: Mutex<Vec<(CommandOutput, Option<&'static [u8]>)>>,
        calls: Mutex<u32>,
    }

    impl ScriptedWget {
        fn new(mut script: Vec<(CommandOutput, Option<&'static [u8]>)>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }
    }

    impl CommandRunner for ScriptedWget {
        fn execute(
            &self,
            spec: &CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, HarvestError> {
            *self.calls.lock().unwrap() += 1;
            let (output, body) = self.script.lock().unwrap().pop().unwrap();
            let out_index = spec.args.iter().position(|arg| arg == "-O").unwrap() + 1;
            let path = &spec.args[out_index];
            // wget creates the output file even for failed transfers
            fs::write(path, body.unwrap_or_default()).unwrap();
            Ok(output)
        }
    }

    fn policy(max_retries: u32) -> DownloadPolicy {
        DownloadPolicy {
            max_parallel: 1,
            timeout: Duration::from_secs(5),
            max_retries,
            retry_delay: Duration::ZERO,
            wget: "wget".to_string(),
            use_listing: false,
        }
    }

    fn exit(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stderr: stderr.to_string(),
            ..CommandOutput::default()
        }
    }

    fn target(temp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().join("release_12/x/x.gff3.gz")).unwrap()
    }

    fn dir_entries(path: &Utf8Path) -> Vec<String> {
        fs::read_dir(path.as_std_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn success_renames_into_place() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedWget::new(vec![(exit(0, ""), Some(b"gzdata"))]));
        let target = target(&temp);

        let outcome = Downloader::new(runner, policy(3)).download("https://x/x.gff3.gz", &target);

        assert_eq!(outcome.status, DownloadStatus::Success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.bytes_written, Some(6));
        assert_eq!(fs::read(target.as_std_path()).unwrap(), b"gzdata");
        assert_eq!(dir_entries(target.parent().unwrap()), vec!["x.gff3.gz"]);
    }

    #[test]
    fn not_found_is_not_retried() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedWget::new(vec![(
            exit(8, "https://x/x.gff3.gz:\n2024-01-01 ERROR 404: Not Found.\n"),
            None,
        )]));
        let target = target(&temp);

        let outcome =
            Downloader::new(runner.clone(), policy(3)).download("https://x/x.gff3.gz", &target);

        assert_eq!(outcome.status, DownloadStatus::NotFound);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(*runner.calls.lock().unwrap(), 1);
        assert_matches!(outcome.error_message.as_deref(), Some(msg) if msg.contains("404"));
        assert!(dir_entries(target.parent().unwrap()).is_empty());
    }

    #[test]
    fn transient_failures_exhaust_attempts() {
        let temp = tempfile::tempdir().unwrap();
        let timed_out = CommandOutput {
            timed_out: true,
            ..CommandOutput::default()
        };
        let runner = Arc::new(ScriptedWget::new(vec![
            (timed_out.clone(), None),
            (exit(4, "Network failure"), None),
            (timed_out, None),
        ]));
        let target = target(&temp);

        let outcome =
            Downloader::new(runner.clone(), policy(3)).download("https://x/x.gff3.gz", &target);

        assert_eq!(outcome.status, DownloadStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.error_message.as_deref(), Some("transfer timed out"));
        assert_eq!(*runner.calls.lock().unwrap(), 3);
        assert!(dir_entries(target.parent().unwrap()).is_empty());
    }

    #[test]
    fn server_error_other_than_404_is_transient() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedWget::new(vec![
            (exit(8, "ERROR 503: Service Unavailable."), None),
            (exit(0, ""), Some(b"ok")),
        ]));

        let outcome =
            Downloader::new(runner, policy(3)).download("https://x/x.gff3.gz", &target(&temp));

        assert_eq!(outcome.status, DownloadStatus::Success);
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn url_containing_404_does_not_mark_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let url = "https://x/felis_catus.Felis_catus_9404.gff3.gz";
        let runner = Arc::new(ScriptedWget::new(vec![
            (
                exit(8, &format!("{url}:\n2024-01-01 ERROR 503: Service Unavailable.\n")),
                None,
            ),
            (exit(0, ""), Some(b"ok")),
        ]));

        let outcome = Downloader::new(runner, policy(3)).download(url, &target(&temp));

        assert_eq!(outcome.status, DownloadStatus::Success);
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn missing_status_line_is_matched() {
        assert!(reports_missing("u:\n2024-01-01 ERROR 404: Not Found."));
        assert!(!reports_missing("https://x/a_404.gff3.gz:\nERROR 500: Internal Server Error."));
    }
}

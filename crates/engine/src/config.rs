use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_core::upload::{UploadPolicy, DEFAULT_MAX_UPLOAD_BYTES};

/// Default argument template for the external process.
pub const DEFAULT_ARGS: &str = "--input {input} --output {output}";

/// How to invoke the external diarization process.
///
/// `args` may contain `{placeholder}` tokens, see
/// [`process::render_args`](crate::process::render_args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a whitespace-separated argument template.
    pub fn parse_args(template: &str) -> Vec<String> {
        template.split_whitespace().map(str::to_string).collect()
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub command: ProcessCommand,
    /// Root for per-job input and output directories.
    pub transient_dir: PathBuf,
    /// Root for committed results.
    pub result_dir: PathBuf,
    /// Upper bound on simultaneously running processes (at least 1).
    pub max_concurrent_jobs: usize,
    /// Reject submissions once this many jobs are waiting. `None` is unbounded.
    pub max_queued_jobs: Option<usize>,
    pub upload: UploadPolicy,
    /// Time between SIGTERM and SIGKILL when terminating a process.
    pub cancel_grace: Duration,
    /// Wall-clock limit for one process run. `None` disables it.
    pub process_timeout: Option<Duration>,
    /// Number of trailing stderr lines kept for failure reports.
    pub stderr_tail_lines: usize,
    /// Polling interval advertised to clients.
    pub poll_interval: Duration,
    /// How long terminal jobs are kept. `None` keeps them forever.
    pub job_retention: Option<Duration>,
}

impl EngineConfig {
    /// Configuration with defaults for everything but the command and roots.
    pub fn new(
        command: ProcessCommand,
        transient_dir: impl Into<PathBuf>,
        result_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command,
            transient_dir: transient_dir.into(),
            result_dir: result_dir.into(),
            max_concurrent_jobs: 1,
            max_queued_jobs: None,
            upload: UploadPolicy::default(),
            cancel_grace: Duration::from_secs(5),
            process_timeout: None,
            stderr_tail_lines: 20,
            poll_interval: Duration::from_millis(1000),
            job_retention: Some(Duration::from_secs(86_400)),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                            |
    /// |------------------------|------------------------------------|
    /// | `MURMUR_COMMAND`       | `murmur-diarize`                   |
    /// | `MURMUR_ARGS`          | `--input {input} --output {output}`|
    /// | `MURMUR_TRANSIENT_DIR` | `storage/uploads`                  |
    /// | `MURMUR_RESULT_DIR`    | `storage/results`                  |
    /// | `MAX_CONCURRENT_JOBS`  | `1`                                |
    /// | `MAX_QUEUED_JOBS`      | unbounded                          |
    /// | `MAX_UPLOAD_BYTES`     | `524288000`                        |
    /// | `ALLOWED_EXTENSIONS`   | common audio and video types       |
    /// | `CANCEL_GRACE_SECS`    | `5`                                |
    /// | `PROCESS_TIMEOUT_SECS` | disabled                           |
    /// | `STDERR_TAIL_LINES`    | `20`                               |
    /// | `POLL_INTERVAL_MS`     | `1000`                             |
    /// | `JOB_RETENTION_SECS`   | `86400` (`0` disables)             |
    ///
    /// Panics on malformed values; meant to run once at startup.
    pub fn from_env() -> Self {
        let program = std::env::var("MURMUR_COMMAND").unwrap_or_else(|_| "murmur-diarize".into());
        let args = std::env::var("MURMUR_ARGS").unwrap_or_else(|_| DEFAULT_ARGS.into());

        let mut config = Self::new(
            ProcessCommand::new(program, ProcessCommand::parse_args(&args)),
            std::env::var("MURMUR_TRANSIENT_DIR").unwrap_or_else(|_| "storage/uploads".into()),
            std::env::var("MURMUR_RESULT_DIR").unwrap_or_else(|_| "storage/results".into()),
        );

        config.max_concurrent_jobs = env_or("MAX_CONCURRENT_JOBS", 1usize).max(1);
        config.max_queued_jobs = env_opt("MAX_QUEUED_JOBS");
        config.upload.max_bytes = env_or("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES);
        if let Ok(list) = std::env::var("ALLOWED_EXTENSIONS") {
            let allowed: Vec<String> = list
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !allowed.is_empty() {
                config.upload.allowed_extensions = allowed;
            }
        }
        config.cancel_grace = Duration::from_secs(env_or("CANCEL_GRACE_SECS", 5));
        config.process_timeout = env_opt::<u64>("PROCESS_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        config.stderr_tail_lines = env_or("STDERR_TAIL_LINES", 20);
        config.poll_interval = Duration::from_millis(env_or("POLL_INTERVAL_MS", 1000));
        config.job_retention = match env_or::<u64>("JOB_RETENTION_SECS", 86_400) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        config
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Some(
        raw.parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid {}", std::any::type_name::<T>())),
    )
}

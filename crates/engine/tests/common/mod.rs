#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_core::job::{Job, JobMutation, JobParams, JobSnapshot, JobStatus};
use murmur_core::types::JobId;
use murmur_engine::config::ProcessCommand;
use murmur_engine::{EngineConfig, InMemoryRegistry, JobRegistry, Orchestrator, RegistryError, Upload};
use tempfile::TempDir;

/// How long tests wait for a job to reach an expected state.
pub const WAIT: Duration = Duration::from_secs(10);

/// A valid transcript with two speakers, deliberately out of order.
pub const RESULT_JSON: &str = r#"{"segments":[{"start":2.0,"end":3.5,"speaker":"SPEAKER_01","text":"world"},{"start":0.0,"end":1.5,"speaker":"SPEAKER_00","text":"hello"}]}"#;

/// Engine running an `sh` script as its external process.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(script: &str) -> Self {
        Self::with_config(script, |_| {}).await
    }

    pub async fn with_config(script: &str, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::build(script, tweak, Arc::new(InMemoryRegistry::new())).await
    }

    pub async fn with_registry(script: &str, registry: Arc<dyn JobRegistry>) -> Self {
        Self::build(script, |_| {}, registry).await
    }

    async fn build(
        script: &str,
        tweak: impl FnOnce(&mut EngineConfig),
        registry: Arc<dyn JobRegistry>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("diarize.sh");
        std::fs::write(&script_path, script).expect("write script");

        let mut config = EngineConfig::new(
            ProcessCommand::new("sh", [script_path.display().to_string()]),
            dir.path().join("uploads"),
            dir.path().join("results"),
        );
        config.cancel_grace = Duration::from_millis(500);
        tweak(&mut config);

        let orchestrator = Orchestrator::with_registry(config, registry)
            .await
            .expect("start orchestrator");
        Self { orchestrator, dir }
    }

    pub fn transient_root(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.transient_root().join(id.to_string())
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub async fn submit(&self, filename: &str) -> JobSnapshot {
        self.orchestrator
            .submit(upload(filename))
            .await
            .expect("submit")
    }

    /// Poll until `done` holds for the job's snapshot.
    pub async fn wait_for(&self, id: JobId, done: impl Fn(&JobSnapshot) -> bool) -> JobSnapshot {
        let poll = async {
            loop {
                let snapshot = self.orchestrator.status(id).await.expect("status");
                if done(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(WAIT, poll)
            .await
            .expect("job did not reach the expected state in time")
    }

    pub async fn wait_terminal(&self, id: JobId) -> JobSnapshot {
        self.wait_for(id, |s| s.terminal).await
    }

    /// Wait until `expected` cleanups have run, then check no more follow.
    pub async fn assert_cleanups(&self, expected: u64) {
        let poll = async {
            while self.orchestrator.stats().await.cleanups < expected {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(WAIT, poll)
            .await
            .expect("cleanup did not run");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(self.orchestrator.stats().await.cleanups, expected);
    }

    /// Wait until the job's transient directory is gone.
    pub async fn wait_cleaned(&self, id: JobId) {
        let dir = self.job_dir(id);
        let poll = async {
            while dir.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(WAIT, poll)
            .await
            .expect("transient storage was not cleaned up");
    }
}

pub fn upload(filename: &str) -> Upload {
    Upload {
        filename: filename.to_string(),
        data: b"RIFF....WAVEfmt ".to_vec(),
        params: JobParams::default(),
    }
}

/// Script that reports stages, then writes [`RESULT_JSON`].
pub fn success_script(pause_secs: f32) -> String {
    format!(
        "echo '::stage::initializing'\n\
         echo 'Transcribing audio with whisper'\n\
         sleep {pause_secs}\n\
         echo '::stage::diarizing::50'\n\
         cat > \"$MURMUR_OUTPUT\" <<'JSON'\n{RESULT_JSON}\nJSON\n\
         echo '::stage::finalizing'\n"
    )
}

/// Script that blocks until killed.
pub const BLOCKING_SCRIPT: &str = "echo '::stage::transcribing'\nsleep 30\n";

pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Registry that commits a cancellation right before forwarding one kind
/// of mutation, reproducing a cancel that lands at that exact moment.
pub struct CancelFirst {
    pub inner: InMemoryRegistry,
    trigger: fn(&JobMutation) -> bool,
}

impl CancelFirst {
    pub fn before_start() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryRegistry::new(),
            trigger: |m| matches!(m, JobMutation::Start),
        })
    }

    pub fn before_complete() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryRegistry::new(),
            trigger: |m| matches!(m, JobMutation::Complete { .. }),
        })
    }
}

#[async_trait]
impl JobRegistry for CancelFirst {
    async fn create(&self, job: Job) -> Result<(), RegistryError> {
        self.inner.create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, RegistryError> {
        self.inner.get(id).await
    }

    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<Job, RegistryError> {
        if (self.trigger)(&mutation) {
            self.inner.update(id, JobMutation::Cancel).await?;
        }
        self.inner.update(id, mutation).await
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, RegistryError> {
        self.inner.list(status).await
    }

    async fn delete(&self, id: JobId) -> Result<Option<Job>, RegistryError> {
        self.inner.delete(id).await
    }
}

//! Registry of running jobs and their cancellation tokens.
//!
//! Every token is a child of one engine-wide token, so shutting the engine
//! down cancels all running supervisors at once.

use std::collections::HashMap;

use murmur_core::types::JobId;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ActiveJobs {
    shutdown: CancellationToken,
    tokens: RwLock<HashMap<JobId, CancellationToken>>,
}

impl ActiveJobs {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Register a job as running and hand back its token.
    ///
    /// Returns `None` if the job is already running; a job never gets two
    /// supervisors.
    pub async fn register(&self, id: JobId) -> Option<CancellationToken> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&id) {
            return None;
        }
        let token = self.shutdown.child_token();
        tokens.insert(id, token.clone());
        Some(token)
    }

    /// Signal a running job to stop. Returns `false` if it is not running.
    pub async fn cancel(&self, id: JobId) -> bool {
        match self.tokens.read().await.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: JobId) {
        self.tokens.write().await.remove(&id);
    }

    pub async fn contains(&self, id: JobId) -> bool {
        self.tokens.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    /// Cancel every running job through the shared parent token.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::pipeline::TaskPipeline;
use crate::types::ChangeOrigin;

/// Per-source last-successful-iteration timestamps, shared by all change
/// sources and read by the health surface.
#[derive(Debug, Default)]
pub struct SourceHealth {
    last_success: Mutex<HashMap<ChangeOrigin, DateTime<Utc>>>,
}

impl SourceHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn record_success(&self, origin: ChangeOrigin) {
        self.last_success.lock().await.insert(origin, Utc::now());
    }

    pub async fn last_success(&self, origin: ChangeOrigin) -> Option<DateTime<Utc>> {
        self.last_success.lock().await.get(&origin).copied()
    }

    pub async fn snapshot(&self) -> HashMap<ChangeOrigin, DateTime<Utc>> {
        self.last_success.lock().await.clone()
    }
}

/// Point-in-time view of pipeline and source health, consumed by the
/// external health-check collaborator.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub queue_depth: usize,
    pub failed_tasks: u64,
    pub source_last_success: HashMap<ChangeOrigin, DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
}

impl StatusReport {
    pub async fn collect(pipeline: &TaskPipeline, health: &SourceHealth) -> Self {
        Self {
            queue_depth: pipeline.queue_depth().await,
            failed_tasks: pipeline.failed_count().await,
            source_last_success: health.snapshot().await,
            collected_at: Utc::now(),
        }
    }
}

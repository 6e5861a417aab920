//! Request/response DTOs for the control API. Bodies are camelCase,
//! matching the teacher's convention for HTTP-facing structs.

use std::path::PathBuf;

use consumer_common::BusinessHours;
use serde::{Deserialize, Serialize};

use crate::engine::{PersistedQueuesReport, QueueInfo, RestoreReport};
use crate::persistence::PersistedQueueEntry;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeBody {
    pub queue: String,
    pub webhook: String,
    #[serde(default)]
    pub min_interval: Option<u64>,
    #[serde(default)]
    pub max_interval: Option<u64>,
    #[serde(default)]
    pub business_hours: Option<BusinessHours>,
}

#[derive(Debug, Deserialize)]
pub struct QueueNameBody {
    pub queue: String,
}

#[derive(Debug, Deserialize)]
pub struct QueuesInfoBody {
    pub queues: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuesInfoResponse {
    pub queues: Vec<QueueInfo>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

#[derive(Debug, Serialize)]
pub struct OkBody {
    pub ok: bool,
}

impl Default for OkBody {
    fn default() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Deserialize)]
pub struct TestWebhookBody {
    pub url: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestWebhookResponse {
    pub success: bool,
    pub status: Option<u16>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedQueuesResponse {
    pub persisted: Vec<PersistedQueueEntry>,
    pub stats: crate::persistence::PersistenceStats,
}

impl From<PersistedQueuesReport> for PersistedQueuesResponse {
    fn from(report: PersistedQueuesReport) -> Self {
        Self {
            persisted: report.persisted,
            stats: report.stats,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreQueuesResponse {
    pub restored: usize,
    pub failed: usize,
    pub skipped: usize,
    pub removed: usize,
}

impl From<RestoreReport> for RestoreQueuesResponse {
    fn from(report: RestoreReport) -> Self {
        Self {
            restored: report.restored,
            failed: report.failed,
            skipped: report.skipped,
            removed: report.removed,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackupConfigsBody {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfigsResponse {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreBackupBody {
    pub backup_path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct RestoreBackupResponse {
    pub queues: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupOrphansResponse {
    pub removed: Vec<String>,
}

//! Durable store contract.
//!
//! The engine only needs job submissions recorded and readable; history
//! persistence belongs to the collaborator behind this trait. The in-memory
//! implementation backs tests and single-process runs.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: u64,
    pub title: String,
    pub mode: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, title: &str, mode: &str, config: &serde_json::Value)
        -> Result<u64>;

    async fn get_job(&self, id: u64) -> Result<Option<JobRecord>>;
}

pub struct MemoryJobStore {
    next_id: AtomicU64,
    records: DashMap<u64, JobRecord>,
}

impl MemoryJobStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            records: DashMap::new(),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        title: &str,
        mode: &str,
        config: &serde_json::Value,
    ) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.insert(
            id,
            JobRecord {
                id,
                title: title.to_string(),
                mode: mode.to_string(),
                config: config.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_job(&self, id: u64) -> Result<Option<JobRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = MemoryJobStore::new();
        let config = serde_json::json!({"recipients": []});
        let id = store.create_job("airdrop", "distribution", &config).await.unwrap();
        let record = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(record.title, "airdrop");
        assert_eq!(record.mode, "distribution");
        assert!(store.get_job(id + 1).await.unwrap().is_none());
    }
}

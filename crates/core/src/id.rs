//! Strongly-typed identifiers used across the job subsystem.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a job row.
///
/// Jobs are numbered by a monotonically increasing sequence (BIGSERIAL in
/// Postgres, an atomic counter in memory); the claim ordering uses it as the
/// final tie-break, so insertion order is recoverable from the id alone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub fn from_i64(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

/// Identifier of a dead-lettered job.
///
/// Generated fresh at dead-letter time; never reused from the job id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailedJobId(Uuid);

impl FailedJobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FailedJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for FailedJobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for FailedJobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<FailedJobId> for Uuid {
    fn from(value: FailedJobId) -> Self {
        value.0
    }
}

impl FromStr for FailedJobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("FailedJobId: {}", e)))?;
        Ok(Self(uuid))
    }
}

/// Identity of a worker process.
///
/// Workers coordinate only through the shared store; the identity is what a
/// claim lease records in `locked_by`. Distinct per worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique identity (`worker-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_order_by_value() {
        assert!(JobId::from_i64(1) < JobId::from_i64(2));
        assert_eq!(JobId::from_i64(7).as_i64(), 7);
    }

    #[test]
    fn failed_job_id_round_trips_through_str() {
        let id = FailedJobId::new();
        let parsed: FailedJobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn failed_job_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<FailedJobId>().is_err());
    }

    #[test]
    fn generated_worker_ids_are_distinct() {
        assert_ne!(WorkerId::generate(), WorkerId::generate());
    }
}

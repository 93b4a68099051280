//! Persisted shapes shared by every queue store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Store-assigned job identity. Higher ids were enqueued later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(BatchId)
    }
}

/// A job ready to be written to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub connection: String,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub max_tries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub batch_id: Option<BatchId>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    pub fn into_record(self, id: JobId) -> JobRecord {
        JobRecord {
            id,
            connection: self.connection,
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            attempts: 0,
            reserved_at: None,
            available_at: self.available_at.max(self.created_at),
            created_at: self.created_at,
            max_tries: self.max_tries,
            timeout_seconds: self.timeout_seconds,
            batch_id: self.batch_id,
        }
    }
}

/// A job in the active table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub connection: String,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub reserved_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub max_tries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub batch_id: Option<BatchId>,
}

impl JobRecord {
    /// Whether `reserve_next` may hand this record out at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>, lock_duration: Duration) -> bool {
        if self.available_at > now {
            return false;
        }
        match self.reserved_at {
            None => true,
            Some(reserved_at) => crate::clock::after(reserved_at, lock_duration) < now,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    /// Whether this stored record still carries the reservation `held`
    /// was handed out with. Every reservation bumps `attempts`, so a
    /// worker whose lock expired and was taken over no longer matches.
    pub fn holds_reservation(&self, held: &JobRecord) -> bool {
        self.id == held.id
            && self.attempts == held.attempts
            && self.reserved_at.is_some()
            && self.reserved_at == held.reserved_at
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// Terminal copy of a job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub connection: String,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub max_tries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub batch_id: Option<BatchId>,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedJobRecord {
    /// A fresh active job carrying the same payload, available at `now`.
    pub fn to_new_job(&self, now: DateTime<Utc>) -> NewJob {
        NewJob {
            connection: self.connection.clone(),
            queue: self.queue.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            max_tries: self.max_tries,
            timeout_seconds: self.timeout_seconds,
            // A retried job no longer reports to its batch; the batch has
            // already counted this member as failed.
            batch_id: None,
            available_at: now,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Key into [`BatchHooks`](crate::BatchHooks).
    pub callbacks: Option<String>,
    /// When false, the first member failure cancels the batch.
    pub allow_failures: bool,
    pub queue: Option<String>,
    pub connection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub total_jobs: u32,
    pub pending_jobs: u32,
    pub failed_jobs: u32,
    pub failed_job_ids: Vec<JobId>,
    pub options: BatchOptions,
    pub cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(name: impl Into<String>, options: BatchOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::new(),
            name: name.into(),
            total_jobs: 0,
            pending_jobs: 0,
            failed_jobs: 0,
            failed_job_ids: Vec::new(),
            options,
            cancelled: false,
            cancelled_at: None,
            created_at: now,
            finished_at: None,
        }
    }

    pub fn processed_jobs(&self) -> u32 {
        self.total_jobs.saturating_sub(self.pending_jobs)
    }

    /// Percentage of members that reached a terminal state.
    pub fn progress(&self) -> u32 {
        if self.total_jobs == 0 {
            return 0;
        }
        ((self.processed_jobs() as u64 * 100) / self.total_jobs as u64) as u32
    }

    pub fn has_failures(&self) -> bool {
        self.failed_jobs > 0
    }

    pub fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Apply one terminal member transition. Returns true when this call
    /// took `pending_jobs` to zero.
    pub(crate) fn settle_member(&mut self, failed: Option<JobId>, now: DateTime<Utc>) -> bool {
        if let Some(job_id) = failed {
            self.failed_jobs += 1;
            self.failed_job_ids.push(job_id);
            if !self.options.allow_failures && !self.cancelled {
                self.cancelled = true;
                self.cancelled_at = Some(now);
            }
        }
        self.pending_jobs = self.pending_jobs.saturating_sub(1);
        if self.pending_jobs == 0 && self.finished_at.is_none() {
            self.finished_at = Some(now);
            return true;
        }
        false
    }
}

/// Result of a batch counter update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchUpdate {
    pub batch: Batch,
    /// True for exactly one update per batch: the one that drained it.
    pub finished: bool,
}

/// A terminal transition that applied to the caller's reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled<T> {
    pub record: T,
    /// Counter update of the job's batch, settled in the same transition.
    /// `None` for jobs outside a batch or whose batch is gone.
    pub batch: Option<BatchUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.per_page as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 25)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn from_slice(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.per_page as usize)
            .collect();
        Self {
            items,
            page: request.page,
            per_page: request.per_page,
            total,
        }
    }

    pub fn last_page(&self) -> u32 {
        if self.per_page == 0 {
            return 1;
        }
        (self.total.div_ceil(self.per_page as u64) as u32).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSize {
    pub queue: String,
    pub pending: u64,
    pub reserved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(available_in: i64, reserved_ago: Option<i64>) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: JobId(1),
            connection: "memory".into(),
            queue: "default".into(),
            job_type: "noop".into(),
            payload: serde_json::Value::Null,
            attempts: 0,
            reserved_at: reserved_ago.map(|s| now - chrono::Duration::seconds(s)),
            available_at: now + chrono::Duration::seconds(available_in),
            created_at: now - chrono::Duration::seconds(3600),
            max_tries: None,
            timeout_seconds: None,
            batch_id: None,
        }
    }

    #[test]
    fn future_jobs_are_not_eligible() {
        let record = job(10, None);
        assert!(!record.is_eligible(Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn stale_reservations_become_eligible() {
        let lock = Duration::from_secs(60);
        assert!(!job(-1, Some(30)).is_eligible(Utc::now(), lock));
        assert!(job(-1, Some(61)).is_eligible(Utc::now(), lock));
    }

    #[test]
    fn batch_finishes_once() {
        let mut batch = Batch::new("deposits", BatchOptions::default(), Utc::now());
        batch.total_jobs = 2;
        batch.pending_jobs = 2;

        assert!(!batch.settle_member(None, Utc::now()));
        assert!(batch.settle_member(None, Utc::now()));
        assert!(!batch.settle_member(None, Utc::now()));
        assert_eq!(batch.pending_jobs, 0);
        assert_eq!(batch.progress(), 100);
    }

    #[test]
    fn failure_cancels_unless_allowed() {
        let mut strict = Batch::new("strict", BatchOptions::default(), Utc::now());
        strict.total_jobs = 3;
        strict.pending_jobs = 3;
        strict.settle_member(Some(JobId(7)), Utc::now());
        assert!(strict.cancelled);
        assert_eq!(strict.failed_job_ids, vec![JobId(7)]);

        let mut lenient = Batch::new(
            "lenient",
            BatchOptions {
                allow_failures: true,
                ..Default::default()
            },
            Utc::now(),
        );
        lenient.total_jobs = 3;
        lenient.pending_jobs = 3;
        lenient.settle_member(Some(JobId(7)), Utc::now());
        assert!(!lenient.cancelled);
        assert_eq!(lenient.failed_jobs, 1);
    }

    #[test]
    fn pages_are_one_based() {
        let page = Page::from_slice((1..=7).collect::<Vec<_>>(), PageRequest::new(2, 3));
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 7);
        assert_eq!(page.last_page(), 3);
    }
}

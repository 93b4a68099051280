use super::QueueStore;
use crate::clock::{self, Clock};
use crate::error::{JobError, Result};
use crate::record::{
    Batch, BatchId, BatchOptions, BatchUpdate, FailedJobRecord, JobId, JobRecord, NewJob, Page,
    PageRequest, QueueSize, Settled,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::Connection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Key layout, relative to the configured prefix:
//   ids, failed_ids                 counters
//   job:{member}                    hash per active job
//   queue:{name}:pending            zset member -> available_at (ms)
//   queue:{name}:reserved           zset member -> reserved_at (ms)
//   queues                          set of queue names
//   failed / failed:{id}            zset of ids / JSON record
//   batch:{id} / batch:{id}:failed  hash / list of failed job ids
//   batches                         zset batch id -> created_at (ms)
//
// Members are zero-padded ids so equal scores order by id.

const RESERVE: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[2])
for _, member in ipairs(stale) do
    redis.call('ZREM', KEYS[2], member)
    local available = redis.call('HGET', ARGV[3] .. member, 'available_at')
    if available then
        redis.call('HSET', ARGV[3] .. member, 'reserved_at', '')
        redis.call('ZADD', KEYS[1], available, member)
    end
end
local jobs = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #jobs == 0 then
    return nil
end
local member = jobs[1]
redis.call('ZREM', KEYS[1], member)
redis.call('ZADD', KEYS[2], ARGV[1], member)
redis.call('HSET', ARGV[3] .. member, 'reserved_at', ARGV[1])
redis.call('HINCRBY', ARGV[3] .. member, 'attempts', 1)
return member
"#;

const ENQUEUE: &str = r#"
local batch = ARGV[1]
if batch ~= '' then
    if redis.call('EXISTS', batch) == 0 then
        return -1
    end
    if redis.call('HGET', batch, 'finished_at') ~= '' then
        return -2
    end
    redis.call('HINCRBY', batch, 'total_jobs', 1)
    redis.call('HINCRBY', batch, 'pending_jobs', 1)
end
redis.call('HSET', KEYS[1], unpack(ARGV, 5))
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[4])
return 1
"#;

// Terminal transitions check that the job still carries the reservation
// the caller took (same attempts and reserved_at) before touching it.

const FINISH: &str = r#"
local state = redis.call('HMGET', KEYS[1], 'queue', 'attempts', 'reserved_at')
if not state[1] or state[2] ~= ARGV[3] or not state[3] or state[3] == ''
    or state[3] ~= ARGV[4] then
    return 0
end
redis.call('ZREM', ARGV[1] .. state[1] .. ':pending', ARGV[2])
redis.call('ZREM', ARGV[1] .. state[1] .. ':reserved', ARGV[2])
redis.call('DEL', KEYS[1])
if ARGV[8] ~= '' then
    redis.call('SET', ARGV[8], ARGV[9])
    redis.call('ZADD', ARGV[10], ARGV[11], ARGV[11])
end
local batch = ARGV[5]
if batch == '' or redis.call('EXISTS', batch) == 0 then
    return 1
end
if ARGV[7] ~= '' then
    redis.call('HINCRBY', batch, 'failed_jobs', 1)
    redis.call('RPUSH', batch .. ':failed', ARGV[7])
    if redis.call('HGET', batch, 'allow_failures') ~= '1'
        and redis.call('HGET', batch, 'cancelled') ~= '1' then
        redis.call('HSET', batch, 'cancelled', '1', 'cancelled_at', ARGV[6])
    end
end
local pending = redis.call('HINCRBY', batch, 'pending_jobs', -1)
if pending < 0 then
    redis.call('HSET', batch, 'pending_jobs', 0)
    pending = 0
end
if pending == 0 and redis.call('HGET', batch, 'finished_at') == '' then
    redis.call('HSET', batch, 'finished_at', ARGV[6])
    return 3
end
return 2
"#;

const RELEASE: &str = r#"
local state = redis.call('HMGET', KEYS[1], 'queue', 'attempts', 'reserved_at')
if not state[1] or state[2] ~= ARGV[3] or not state[3] or state[3] == ''
    or state[3] ~= ARGV[4] then
    return 0
end
redis.call('HSET', KEYS[1], 'reserved_at', '', 'available_at', ARGV[5])
redis.call('ZREM', ARGV[1] .. state[1] .. ':reserved', ARGV[2])
redis.call('ZADD', ARGV[1] .. state[1] .. ':pending', ARGV[5], ARGV[2])
return 1
"#;

const CANCEL_BATCH: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if redis.call('HGET', KEYS[1], 'cancelled') ~= '1' then
    redis.call('HSET', KEYS[1], 'cancelled', '1', 'cancelled_at', ARGV[1])
end
return 1
"#;

const PRUNE_BATCHES: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local removed = 0
for _, id in ipairs(ids) do
    local key = ARGV[2] .. id
    local finished = redis.call('HGET', key, 'finished_at')
    if finished and finished ~= '' then
        redis.call('DEL', key, key .. ':failed')
        redis.call('ZREM', KEYS[1], id)
        removed = removed + 1
    end
end
return removed
"#;

const CLEAR_QUEUE: &str = r#"
local removed = 0
for _, zset in ipairs({KEYS[1], KEYS[2]}) do
    local members = redis.call('ZRANGE', zset, 0, -1)
    for _, member in ipairs(members) do
        redis.call('DEL', ARGV[1] .. member)
        removed = removed + 1
    end
    redis.call('DEL', zset)
end
return removed
"#;

const CLEAR_FAILED: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[1] .. id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

const RETRY_FAILED: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], unpack(ARGV, 5))
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[2])
redis.call('SADD', KEYS[5], ARGV[4])
return 1
"#;

#[derive(Debug, Clone)]
struct Scripts {
    reserve: Script,
    enqueue: Script,
    finish: Script,
    release: Script,
    cancel_batch: Script,
    prune_batches: Script,
    clear_queue: Script,
    clear_failed: Script,
    retry_failed: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            reserve: Script::new(RESERVE),
            enqueue: Script::new(ENQUEUE),
            finish: Script::new(FINISH),
            release: Script::new(RELEASE),
            cancel_batch: Script::new(CANCEL_BATCH),
            prune_batches: Script::new(PRUNE_BATCHES),
            clear_queue: Script::new(CLEAR_QUEUE),
            clear_failed: Script::new(CLEAR_FAILED),
            retry_failed: Script::new(RETRY_FAILED),
        }
    }
}

/// Redis-backed queue store
///
/// Every transition that reads before it writes is a Lua script, which
/// Redis runs without interleaving other commands.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
    prefix: String,
    scripts: Scripts,
    clock: Arc<dyn Clock>,
}

fn member(id: JobId) -> String {
    format!("{:020}", id.0)
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: &str) -> Result<Option<DateTime<Utc>>> {
    if ms.is_empty() {
        return Ok(None);
    }
    let ms: i64 = ms
        .parse()
        .map_err(|e| JobError::store(format!("bad timestamp `{}`: {}", ms, e)))?;
    Ok(Utc.timestamp_millis_opt(ms).single())
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn field<'a>(map: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    map.get(name)
        .map(String::as_str)
        .ok_or_else(|| JobError::store(format!("missing field `{}`", name)))
}

fn parse_field<T: std::str::FromStr>(map: &HashMap<String, String>, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    field(map, name)?
        .parse()
        .map_err(|e| JobError::store(format!("bad field `{}`: {}", name, e)))
}

fn parse_optional<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match map.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(_) => parse_field(map, name).map(Some),
    }
}

fn required_time(map: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>> {
    from_millis(field(map, name)?)?
        .ok_or_else(|| JobError::store(format!("missing timestamp `{}`", name)))
}

fn job_fields(id: JobId, job: &NewJob) -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("id", id.0.to_string()),
        ("connection", job.connection.clone()),
        ("queue", job.queue.clone()),
        ("job_type", job.job_type.clone()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("attempts", "0".to_string()),
        ("reserved_at", String::new()),
        (
            "available_at",
            millis(job.available_at.max(job.created_at)).to_string(),
        ),
        ("created_at", millis(job.created_at).to_string()),
        ("max_tries", optional(job.max_tries)),
        ("timeout_seconds", optional(job.timeout_seconds)),
        ("batch_id", optional(job.batch_id)),
    ])
}

fn job_from_hash(map: &HashMap<String, String>) -> Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(parse_field(map, "id")?),
        connection: field(map, "connection")?.to_string(),
        queue: field(map, "queue")?.to_string(),
        job_type: field(map, "job_type")?.to_string(),
        payload: serde_json::from_str(field(map, "payload")?)?,
        attempts: parse_field(map, "attempts")?,
        reserved_at: from_millis(field(map, "reserved_at")?)?,
        available_at: required_time(map, "available_at")?,
        created_at: required_time(map, "created_at")?,
        max_tries: parse_optional(map, "max_tries")?,
        timeout_seconds: parse_optional(map, "timeout_seconds")?,
        batch_id: parse_optional::<Uuid>(map, "batch_id")?.map(BatchId),
    })
}

impl RedisStore {
    pub fn new(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| JobError::Config(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.trim_end_matches(':').to_string(),
            scripts: Scripts::load(),
            clock: clock::system(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn conn(&self) -> Result<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(JobError::store)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job_key(&self, member: &str) -> String {
        self.key(&format!("job:{}", member))
    }

    fn pending_key(&self, queue: &str) -> String {
        self.key(&format!("queue:{}:pending", queue))
    }

    fn reserved_key(&self, queue: &str) -> String {
        self.key(&format!("queue:{}:reserved", queue))
    }

    fn batch_key(&self, id: BatchId) -> String {
        self.key(&format!("batch:{}", id))
    }

    fn failed_key(&self, id: i64) -> String {
        self.key(&format!("failed:{}", id))
    }

    async fn next_id(&self, conn: &mut Connection, counter: &str) -> Result<i64> {
        conn.incr(self.key(counter), 1)
            .await
            .map_err(JobError::store)
    }

    async fn load_job(&self, conn: &mut Connection, member: &str) -> Result<Option<JobRecord>> {
        let map: HashMap<String, String> = conn
            .hgetall(self.job_key(member))
            .await
            .map_err(JobError::store)?;
        if map.is_empty() {
            return Ok(None);
        }
        job_from_hash(&map).map(Some)
    }

    async fn load_batch(&self, conn: &mut Connection, id: BatchId) -> Result<Option<Batch>> {
        let key = self.batch_key(id);
        let map: HashMap<String, String> = conn.hgetall(&key).await.map_err(JobError::store)?;
        if map.is_empty() {
            return Ok(None);
        }
        let failed: Vec<i64> = conn
            .lrange(format!("{}:failed", key), 0, -1)
            .await
            .map_err(JobError::store)?;

        Ok(Some(Batch {
            id,
            name: field(&map, "name")?.to_string(),
            total_jobs: parse_field(&map, "total_jobs")?,
            pending_jobs: parse_field(&map, "pending_jobs")?,
            failed_jobs: parse_field(&map, "failed_jobs")?,
            failed_job_ids: failed.into_iter().map(JobId).collect(),
            options: serde_json::from_str::<BatchOptions>(field(&map, "options")?)?,
            cancelled: field(&map, "cancelled")? == "1",
            cancelled_at: from_millis(field(&map, "cancelled_at")?)?,
            created_at: required_time(&map, "created_at")?,
            finished_at: from_millis(field(&map, "finished_at")?)?,
        }))
    }

    async fn load_failed(&self, conn: &mut Connection, id: i64) -> Result<Option<FailedJobRecord>> {
        let json: Option<String> = conn.get(self.failed_key(id)).await.map_err(JobError::store)?;
        json.map(|json| serde_json::from_str(&json).map_err(JobError::from))
            .transpose()
    }

    async fn queue_names(&self, conn: &mut Connection) -> Result<Vec<String>> {
        let mut names: Vec<String> = conn
            .smembers(self.key("queues"))
            .await
            .map_err(JobError::store)?;
        names.sort();
        Ok(names)
    }

    /// Remove a reserved job, file `failed` when given, and settle its
    /// batch, all in one script.
    async fn finish(
        &self,
        conn: &mut Connection,
        job: &JobRecord,
        failed: Option<&FailedJobRecord>,
    ) -> Result<Option<Settled<()>>> {
        let member = member(job.id);
        let mut invocation = self.scripts.finish.prepare_invoke();
        invocation
            .key(self.job_key(&member))
            .arg(self.key("queue:"))
            .arg(&member)
            .arg(job.attempts)
            .arg(optional(job.reserved_at.map(millis)))
            .arg(job.batch_id.map(|b| self.batch_key(b)).unwrap_or_default())
            .arg(millis(self.clock.now()));
        match failed {
            Some(failed) => {
                invocation
                    .arg(job.id.0)
                    .arg(self.failed_key(failed.id))
                    .arg(serde_json::to_string(failed)?)
                    .arg(self.key("failed"))
                    .arg(failed.id);
            }
            None => {
                invocation.arg("").arg("").arg("").arg("").arg("");
            }
        }

        let status: i64 = invocation
            .invoke_async(conn)
            .await
            .map_err(JobError::store)?;

        let batch = match (status, job.batch_id) {
            (0, _) => return Ok(None),
            (2 | 3, Some(batch_id)) => {
                self.load_batch(conn, batch_id)
                    .await?
                    .map(|batch| BatchUpdate {
                        batch,
                        finished: status == 3,
                    })
            }
            _ => None,
        };
        Ok(Some(Settled { record: (), batch }))
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let mut conn = self.conn().await?;
        let id = JobId(self.next_id(&mut conn, "ids").await?);
        let member = member(id);
        let fields = job_fields(id, &job)?;

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.job_key(&member))
            .key(self.pending_key(&job.queue))
            .key(self.key("queues"))
            .arg(job.batch_id.map(|b| self.batch_key(b)).unwrap_or_default())
            .arg(&member)
            .arg(millis(job.available_at.max(job.created_at)))
            .arg(&job.queue);
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }

        let status: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;

        match (status, job.batch_id) {
            (-1, Some(batch_id)) => Err(JobError::NotFound(format!("batch {}", batch_id))),
            (-2, Some(batch_id)) => Err(JobError::InvalidBatch(format!(
                "batch {} has already finished",
                batch_id
            ))),
            _ => Ok(id),
        }
    }

    async fn reserve_next(
        &self,
        queue: &str,
        lock_duration: Duration,
    ) -> Result<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let now = self.clock.now();

        let reserved: Option<String> = self
            .scripts
            .reserve
            .key(self.pending_key(queue))
            .key(self.reserved_key(queue))
            .arg(millis(now))
            .arg(millis(clock::before(now, lock_duration)))
            .arg(self.key("job:"))
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;

        match reserved {
            Some(member) => self.load_job(&mut conn, &member).await,
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<Option<Settled<()>>> {
        let mut conn = self.conn().await?;
        self.finish(&mut conn, job, None).await
    }

    async fn release(&self, job: &JobRecord, delay: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let member = member(job.id);
        let applied: i64 = self
            .scripts
            .release
            .key(self.job_key(&member))
            .arg(self.key("queue:"))
            .arg(&member)
            .arg(job.attempts)
            .arg(optional(job.reserved_at.map(millis)))
            .arg(millis(clock::after(self.clock.now(), delay)))
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;
        Ok(applied == 1)
    }

    async fn fail_permanently(
        &self,
        job: &JobRecord,
        error: &str,
    ) -> Result<Option<Settled<FailedJobRecord>>> {
        let mut conn = self.conn().await?;
        let failed = FailedJobRecord {
            id: self.next_id(&mut conn, "failed_ids").await?,
            uuid: Uuid::new_v4(),
            connection: job.connection.clone(),
            queue: job.queue.clone(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            max_tries: job.max_tries,
            timeout_seconds: job.timeout_seconds,
            batch_id: job.batch_id,
            exception: error.to_string(),
            failed_at: self.clock.now(),
        };

        let settled = self.finish(&mut conn, job, Some(&failed)).await?;
        Ok(settled.map(|settled| Settled {
            record: failed,
            batch: settled.batch,
        }))
    }

    async fn create_batch(
        &self,
        mut batch: Batch,
        jobs: Vec<NewJob>,
    ) -> Result<(BatchId, Vec<JobId>)> {
        let mut conn = self.conn().await?;
        batch.total_jobs = jobs.len() as u32;
        batch.pending_jobs = jobs.len() as u32;
        if jobs.is_empty() {
            batch.finished_at = Some(self.clock.now());
        }

        let last: i64 = conn
            .incr(self.key("ids"), jobs.len() as i64)
            .await
            .map_err(JobError::store)?;
        let first = last - jobs.len() as i64 + 1;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            self.batch_key(batch.id),
            &[
                ("name", batch.name.clone()),
                ("total_jobs", batch.total_jobs.to_string()),
                ("pending_jobs", batch.pending_jobs.to_string()),
                ("failed_jobs", "0".to_string()),
                ("options", serde_json::to_string(&batch.options)?),
                (
                    "allow_failures",
                    if batch.options.allow_failures { "1" } else { "0" }.to_string(),
                ),
                ("cancelled", if batch.cancelled { "1" } else { "0" }.to_string()),
                ("cancelled_at", optional(batch.cancelled_at.map(millis))),
                ("created_at", millis(batch.created_at).to_string()),
                ("finished_at", optional(batch.finished_at.map(millis))),
            ],
        )
        .ignore();
        pipe.zadd(
            self.key("batches"),
            batch.id.to_string(),
            millis(batch.created_at),
        )
        .ignore();

        let mut ids = Vec::with_capacity(jobs.len());
        for (offset, mut job) in jobs.into_iter().enumerate() {
            job.batch_id = Some(batch.id);
            let id = JobId(first + offset as i64);
            let member = member(id);
            pipe.hset_multiple(self.job_key(&member), &job_fields(id, &job)?)
                .ignore();
            pipe.zadd(
                self.pending_key(&job.queue),
                &member,
                millis(job.available_at.max(job.created_at)),
            )
            .ignore();
            pipe.sadd(self.key("queues"), &job.queue).ignore();
            ids.push(id);
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(JobError::store)?;
        Ok((batch.id, ids))
    }

    async fn find_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let mut conn = self.conn().await?;
        self.load_batch(&mut conn, id).await
    }

    async fn cancel_batch(&self, id: BatchId) -> Result<Batch> {
        let mut conn = self.conn().await?;
        let found: i64 = self
            .scripts
            .cancel_batch
            .key(self.batch_key(id))
            .arg(millis(self.clock.now()))
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;
        if found == 0 {
            return Err(JobError::NotFound(format!("batch {}", id)));
        }
        self.load_batch(&mut conn, id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("batch {}", id)))
    }

    async fn list_batches(&self, page: PageRequest) -> Result<Page<Batch>> {
        let mut conn = self.conn().await?;
        let key = self.key("batches");
        let total: u64 = conn.zcard(&key).await.map_err(JobError::store)?;
        let items = if page.per_page == 0 {
            Vec::new()
        } else {
            let start = page.offset() as isize;
            let stop = start + page.per_page as isize - 1;
            let ids: Vec<String> = conn
                .zrevrange(&key, start, stop)
                .await
                .map_err(JobError::store)?;
            let mut batches = Vec::with_capacity(ids.len());
            for id in ids {
                let id: BatchId = id
                    .parse()
                    .map_err(|e| JobError::store(format!("bad batch id: {}", e)))?;
                if let Some(batch) = self.load_batch(&mut conn, id).await? {
                    batches.push(batch);
                }
            }
            batches
        };

        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn prune_batches(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .scripts
            .prune_batches
            .key(self.key("batches"))
            .arg(millis(before))
            .arg(self.key("batch:"))
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;
        Ok(removed as u64)
    }

    async fn list_pending(&self, queue: &str, page: PageRequest) -> Result<Page<JobRecord>> {
        let mut conn = self.conn().await?;
        let mut members: Vec<String> = conn
            .zrange(self.pending_key(queue), 0, -1)
            .await
            .map_err(JobError::store)?;
        let reserved: Vec<String> = conn
            .zrange(self.reserved_key(queue), 0, -1)
            .await
            .map_err(JobError::store)?;
        members.extend(reserved);

        let mut jobs = Vec::with_capacity(members.len());
        for member in members {
            if let Some(job) = self.load_job(&mut conn, &member).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|job| (job.available_at, job.id));
        Ok(Page::from_slice(jobs, page))
    }

    async fn count(&self, queue: Option<&str>) -> Result<u64> {
        let mut conn = self.conn().await?;
        let queues = match queue {
            Some(queue) => vec![queue.to_string()],
            None => self.queue_names(&mut conn).await?,
        };

        let mut total = 0;
        for queue in queues {
            let pending: u64 = conn
                .zcard(self.pending_key(&queue))
                .await
                .map_err(JobError::store)?;
            let reserved: u64 = conn
                .zcard(self.reserved_key(&queue))
                .await
                .map_err(JobError::store)?;
            total += pending + reserved;
        }
        Ok(total)
    }

    async fn queues(&self) -> Result<Vec<QueueSize>> {
        let mut conn = self.conn().await?;
        let mut sizes = Vec::new();
        for queue in self.queue_names(&mut conn).await? {
            let pending: u64 = conn
                .zcard(self.pending_key(&queue))
                .await
                .map_err(JobError::store)?;
            let reserved: u64 = conn
                .zcard(self.reserved_key(&queue))
                .await
                .map_err(JobError::store)?;
            if pending + reserved > 0 {
                sizes.push(QueueSize {
                    queue,
                    pending,
                    reserved,
                });
            }
        }
        Ok(sizes)
    }

    async fn delete_from_queue(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .scripts
            .clear_queue
            .key(self.pending_key(queue))
            .key(self.reserved_key(queue))
            .arg(self.key("job:"))
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;
        Ok(removed as u64)
    }

    async fn delete_all(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let mut removed = 0;
        for queue in self.queue_names(&mut conn).await? {
            removed += self.delete_from_queue(&queue).await?;
        }
        Ok(removed)
    }

    async fn list_failed(&self, page: PageRequest) -> Result<Page<FailedJobRecord>> {
        let mut conn = self.conn().await?;
        let key = self.key("failed");
        let total: u64 = conn.zcard(&key).await.map_err(JobError::store)?;
        let mut items = Vec::new();
        if page.per_page > 0 {
            let start = page.offset() as isize;
            let stop = start + page.per_page as isize - 1;
            let ids: Vec<i64> = conn
                .zrevrange(&key, start, stop)
                .await
                .map_err(JobError::store)?;
            for id in ids {
                if let Some(failed) = self.load_failed(&mut conn, id).await? {
                    items.push(failed);
                }
            }
        }

        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn count_failed(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        conn.zcard(self.key("failed"))
            .await
            .map_err(JobError::store)
    }

    async fn find_failed(&self, id: i64) -> Result<Option<FailedJobRecord>> {
        let mut conn = self.conn().await?;
        self.load_failed(&mut conn, id).await
    }

    async fn delete_failed(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.failed_key(id))
            .zrem(self.key("failed"), id)
            .query_async(&mut conn)
            .await
            .map_err(JobError::store)?;
        Ok(deleted > 0)
    }

    async fn delete_all_failed(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .scripts
            .clear_failed
            .key(self.key("failed"))
            .arg(self.key("failed:"))
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;
        Ok(removed as u64)
    }

    async fn retry_failed(&self, id: i64) -> Result<JobId> {
        let mut conn = self.conn().await?;
        let failed = self
            .load_failed(&mut conn, id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("failed job {}", id)))?;

        let job = failed.to_new_job(self.clock.now());
        let job_id = JobId(self.next_id(&mut conn, "ids").await?);
        let member = member(job_id);

        let mut invocation = self.scripts.retry_failed.prepare_invoke();
        invocation
            .key(self.failed_key(id))
            .key(self.key("failed"))
            .key(self.job_key(&member))
            .key(self.pending_key(&job.queue))
            .key(self.key("queues"))
            .arg(id)
            .arg(&member)
            .arg(millis(job.available_at))
            .arg(&job.queue);
        for (name, value) in &job_fields(job_id, &job)? {
            invocation.arg(*name).arg(value);
        }

        let moved: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(JobError::store)?;
        if moved == 0 {
            // Another caller retried or forgot it between our read and the script.
            return Err(JobError::NotFound(format!("failed job {}", id)));
        }
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const LOCK: Duration = Duration::from_secs(60);

    fn new_job(queue: &str, available_at: DateTime<Utc>) -> NewJob {
        NewJob {
            connection: "redis".into(),
            queue: queue.into(),
            job_type: "noop".into(),
            payload: serde_json::json!({}),
            max_tries: None,
            timeout_seconds: None,
            batch_id: None,
            available_at,
            created_at: available_at,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn reclaimed_job_drops_its_old_reservation() {
        let clock = ManualClock::default();
        let prefix = format!("folio-test-{}", Uuid::new_v4());
        let store = RedisStore::new("redis://127.0.0.1/", &prefix)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let now = clock.now();

        let orphan = store.enqueue(new_job("default", now)).await.unwrap();
        let stale = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        assert_eq!(stale.id, orphan);

        // An older job wins the next reservation, so the orphan is only
        // moved back to pending.
        let older = store
            .enqueue(new_job("default", now - chrono::Duration::seconds(10)))
            .await
            .unwrap();
        clock.advance(LOCK + Duration::from_secs(1));
        let next = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        assert_eq!(next.id, older);

        let pending = store
            .list_pending("default", PageRequest::default())
            .await
            .unwrap();
        let reclaimed = pending.items.iter().find(|job| job.id == orphan).unwrap();
        assert_eq!(reclaimed.reserved_at, None);
        assert!(store.complete(&stale).await.unwrap().is_none());
        assert_eq!(store.count(None).await.unwrap(), 2);

        store.delete_all().await.unwrap();
    }
}

//! Bucketed aggregates with incremental refresh sessions.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::db::{helpers::now_ms, Database, LogRecord, StoreError, StoreResult};

use super::{
    accumulate::evaluate, resolve_window, round_to, AggregateFunc, FuncSpec, TimeSpec,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

pub const DEFAULT_COUNT: u32 = 100;

const MAX_SESSIONS: usize = 256;

/// Upper bound on the buckets one evaluation may compute.
pub const MAX_BUCKETS: i64 = 100_000;

/// One `series` call as the host issues it. Time bounds and the function
/// stay in their textual form; they are part of the session identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRequest {
    pub func: String,
    pub item: String,
    pub start: String,
    #[serde(default = "default_end")]
    pub end: String,
    #[serde(default)]
    pub step: Option<i64>,
    #[serde(default)]
    pub count: Option<u32>,
    /// Session to refresh; derived from the request when absent.
    #[serde(default)]
    pub sid: Option<String>,
}

fn default_end() -> String {
    "now".to_string()
}

impl SeriesRequest {
    pub fn new(func: &str, item: &str, start: &str, end: &str) -> Self {
        Self {
            func: func.to_string(),
            item: item.to_string(),
            start: start.to_string(),
            end: end.to_string(),
            step: None,
            count: None,
            sid: None,
        }
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Deterministic fingerprint of `(item, func, start, end, count)`.
    pub fn session_id(&self, default_count: u32) -> String {
        let count = self.count.unwrap_or(default_count);
        let key = format!(
            "{}|{}|{}|{}|{}",
            self.item, self.func, self.start, self.end, count
        );
        format!("{}#{:08x}", self.item, crc32fast::hash(key.as_bytes()))
    }
}

/// Parameters a host sends back to refresh the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesParams {
    pub update: bool,
    pub item: String,
    pub func: String,
    /// Resolved end of this evaluation; the next refresh starts here.
    pub start: i64,
    pub end: String,
    pub step: i64,
    pub sid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResponse {
    pub cmd: String,
    pub sid: String,
    pub params: SeriesParams,
    /// `(bucket_end, value)`; `None` marks a bucket without records.
    pub series: Vec<(i64, Option<f64>)>,
    /// Wall-clock time after which a refresh yields a new bucket.
    pub update: i64,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
struct SeriesSession {
    item_id: i64,
    func: AggregateFunc,
    step: i64,
    anchor: i64,
    evaluated_at: i64,
    /// Unfinalized points, first bucket starting at `anchor`.
    points: Vec<(i64, Option<f64>)>,
}

impl SeriesSession {
    /// Leading points whose bucket was complete at the previous evaluation.
    fn reusable(&self, end: i64) -> &[(i64, Option<f64>)] {
        let count = self
            .points
            .iter()
            .enumerate()
            .take_while(|(k, (time, _))| {
                (*k as i64 + 1)
                    .checked_mul(self.step)
                    .and_then(|offset| self.anchor.checked_add(offset))
                    == Some(*time)
                    && *time <= self.evaluated_at
                    && *time <= end
            })
            .count();
        &self.points[..count]
    }
}

#[derive(Default)]
struct SessionCache {
    sessions: HashMap<String, SeriesSession>,
    order: VecDeque<String>,
}

impl SessionCache {
    fn get(&self, sid: &str) -> Option<&SeriesSession> {
        self.sessions.get(sid)
    }

    fn store(&mut self, sid: String, session: SeriesSession) {
        if self.sessions.insert(sid.clone(), session).is_none() {
            self.order.push_back(sid);
        }
        while self.order.len() > MAX_SESSIONS {
            if let Some(evicted) = self.order.pop_front() {
                self.sessions.remove(&evicted);
            }
        }
    }
}

/// Builds bucketed series and remembers finished buckets per session.
#[derive(Clone)]
pub struct SeriesBuilder {
    db: Database,
    precision: i32,
    default_count: u32,
    sessions: Arc<Mutex<SessionCache>>,
}

impl SeriesBuilder {
    pub fn new(db: Database, precision: i32, default_count: u32) -> Self {
        Self {
            db,
            precision,
            default_count,
            sessions: Arc::new(Mutex::new(SessionCache::default())),
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, SessionCache> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn series(
        &self,
        request: &SeriesRequest,
        cancel: &CancellationToken,
    ) -> StoreResult<SeriesResponse> {
        self.series_at(request, now_ms(), cancel).await
    }

    /// Evaluates `request` against a fixed wall-clock.
    ///
    /// Cancellation is checked between buckets; a cancelled run returns the
    /// prefix computed so far with `cancelled` set and leaves the session
    /// untouched.
    pub async fn series_at(
        &self,
        request: &SeriesRequest,
        now: i64,
        cancel: &CancellationToken,
    ) -> StoreResult<SeriesResponse> {
        let spec: FuncSpec = request.func.parse()?;
        let start: TimeSpec = request.start.parse()?;
        let end: TimeSpec = request.end.parse()?;
        let count = request.count.unwrap_or(self.default_count);
        let sid = request
            .sid
            .clone()
            .unwrap_or_else(|| request.session_id(self.default_count));

        if let Some(step) = request.step {
            if step <= 0 {
                return Err(StoreError::InvalidQuery(format!(
                    "step must be positive, got {step}"
                )));
            }
        }

        let resolved_end = end.resolve(now);
        let mut response = SeriesResponse {
            cmd: "series".to_string(),
            sid: sid.clone(),
            params: SeriesParams {
                update: true,
                item: request.item.clone(),
                func: spec.to_string(),
                start: resolved_end,
                end: request.end.clone(),
                step: request.step.unwrap_or(0),
                sid: sid.clone(),
            },
            series: Vec::new(),
            update: now,
            cancelled: false,
        };

        let item_id = match self.db.id(&request.item, false).await {
            Ok(id) => id,
            Err(StoreError::NotFound(_)) => return Ok(response),
            Err(err) => return Err(err),
        };

        let Some((start, end)) = resolve_window(&self.db, item_id, start, end, now).await? else {
            return Ok(response);
        };

        let span = end.checked_sub(start).ok_or_else(|| {
            StoreError::InvalidQuery(format!("window [{start}, {end}) is too wide"))
        })?;
        let step = match request.step {
            Some(step) => step,
            None if count == 0 => span,
            None => (span / i64::from(count)).max(1),
        };
        response.params.step = step;
        response.update = now.saturating_add(step);

        if spec.func == AggregateFunc::Raw {
            let points = self.raw_points(item_id, start, end).await?;
            response.series = match spec.finalizer {
                Some(finalizer) => finalizer.apply(points),
                None => points,
            };
            return Ok(response);
        }

        let buckets = span / step + i64::from(span % step != 0);
        if buckets > MAX_BUCKETS {
            return Err(StoreError::InvalidQuery(format!(
                "{buckets} buckets of {step} ms exceed the limit of {MAX_BUCKETS}"
            )));
        }

        // A session is only reused while `start` stays on its bucket grid.
        let previous = {
            let sessions = self.lock_sessions();
            sessions
                .get(&sid)
                .filter(|session| {
                    session.item_id == item_id
                        && session.func == spec.func
                        && session.step == step
                        && session.anchor <= start
                        && start
                            .checked_sub(session.anchor)
                            .is_some_and(|offset| offset % step == 0)
                })
                .map(|session| (session.anchor, session.reusable(end).to_vec()))
        };

        let (anchor, reused) = previous.unwrap_or((start, Vec::new()));
        // Buckets ending at or before `start` fell out of the window.
        let first = ((start - anchor) / step) as usize;
        let bucket_count = first + buckets as usize;
        let first_computed = reused.len().max(first);

        let records = if first_computed < bucket_count {
            let from = anchor + first_computed as i64 * step;
            self.collect_records(item_id, from, end).await?
        } else {
            Vec::new()
        };

        let mut points: Vec<(i64, Option<f64>)> = Vec::with_capacity(buckets as usize);
        points.extend(reused.iter().skip(first).copied());

        for k in first_computed..bucket_count {
            if cancel.is_cancelled() {
                response.cancelled = true;
                break;
            }

            let lower = anchor + k as i64 * step;
            let upper = lower.saturating_add(step).min(end);
            let from = records.partition_point(|record| record.ends_before(lower));
            let value = evaluate(spec.func, &records[from..], lower, upper, now)
                .map(|v| {
                    if spec.func.is_rounded() {
                        round_to(v, self.precision)
                    } else {
                        v
                    }
                });
            points.push((upper, value));
        }

        log_debug!(
            "series {sid}: {} buckets, {} reused, cancelled={}",
            points.len(),
            reused.len().saturating_sub(first),
            response.cancelled
        );

        if !response.cancelled {
            self.lock_sessions().store(
                sid,
                SeriesSession {
                    item_id,
                    func: spec.func,
                    step,
                    anchor: start,
                    evaluated_at: now,
                    points: points.clone(),
                },
            );
        }

        response.series = match spec.finalizer {
            Some(finalizer) => finalizer.apply(points),
            None => points,
        };
        Ok(response)
    }

    /// Every record intersecting `[start, end)` as `(time, value)`, the
    /// first one clipped to `start`.
    async fn raw_points(
        &self,
        item_id: i64,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<(i64, Option<f64>)>> {
        let records = self.collect_records(item_id, start, end).await?;
        Ok(records
            .iter()
            .filter_map(|record| match record.value.as_f64() {
                Some(value) => Some((record.start_time.max(start), Some(value))),
                None => {
                    log_warn!(
                        "skipping non-numeric record of item {item_id} at {}",
                        record.start_time
                    );
                    None
                }
            })
            .collect())
    }

    async fn collect_records(&self, item_id: i64, start: i64, end: i64) -> StoreResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mut scan = self.db.range_scan(item_id, start, end)?;
        while let Some(next) = scan.next().await {
            match next {
                Ok(record) => records.push(record),
                Err(StoreError::BadValue(reason)) => {
                    log_warn!("skipping undecodable record of item {item_id}: {reason}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }
}

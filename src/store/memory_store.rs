//! In-memory schedule store implementation.
//!
//! Backs tests and embedded single-process setups. Same contract as the
//! SQLite store, no durability.

use super::models::{JobState, JobTick, JobTickInitData, JobTickStats, JobTickStatus};
use super::{JobStateFilter, JobStateStore, JobTickStore, ScheduleStore};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Default)]
struct Inner {
    states: HashMap<String, JobState>,
    ticks: BTreeMap<i64, JobTick>,
    next_tick_id: i64,
}

/// In-process schedule store holding everything behind one `RwLock`.
#[derive(Default)]
pub struct InMemoryScheduleStore {
    inner: RwLock<Inner>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStateStore for InMemoryScheduleStore {
    fn all_job_states(&self, filter: &JobStateFilter) -> Result<Vec<JobState>> {
        let inner = self.inner.read().unwrap();
        let mut states: Vec<(String, JobState)> = inner
            .states
            .iter()
            .filter(|(_, state)| filter.matches(state))
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        // Stable order within a call
        states.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(states.into_iter().map(|(_, state)| state).collect())
    }

    fn get_job_state(&self, job_origin_id: &str) -> Result<Option<JobState>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.states.get(job_origin_id).cloned())
    }

    fn add_job_state(&self, state: &JobState) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let origin_id = state.origin_id();
        if inner.states.contains_key(&origin_id) {
            return Err(StoreError::AlreadyExists(origin_id));
        }
        inner.states.insert(origin_id, state.clone());
        Ok(())
    }

    fn update_job_state(&self, state: &JobState) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let origin_id = state.origin_id();
        match inner.states.get_mut(&origin_id) {
            Some(existing) => {
                // Identity fields stay as stored; only status and data move
                existing.status = state.status;
                existing.data = state.data.clone();
                Ok(())
            }
            None => Err(StoreError::JobStateNotFound(origin_id)),
        }
    }

    fn delete_job_state(&self, job_origin_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.states.remove(job_origin_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::JobStateNotFound(job_origin_id.to_string())),
        }
    }
}

impl JobTickStore for InMemoryScheduleStore {
    fn create_job_tick(&self, data: JobTickInitData) -> Result<JobTick> {
        let mut inner = self.inner.write().unwrap();
        inner.next_tick_id += 1;
        let tick = JobTick {
            id: inner.next_tick_id,
            job_origin_id: data.job_origin_id,
            job_type: data.job_type,
            status: JobTickStatus::Started,
            timestamp: data.timestamp,
            run_ids: Vec::new(),
            error: None,
        };
        inner.ticks.insert(tick.id, tick.clone());
        Ok(tick)
    }

    fn update_job_tick(&self, tick: &JobTick) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.ticks.get_mut(&tick.id) {
            Some(existing) => {
                if existing.status.is_terminal() && tick.status == JobTickStatus::Started {
                    return Err(StoreError::TerminalTick {
                        id: tick.id,
                        status: existing.status,
                    });
                }
                existing.status = tick.status;
                existing.timestamp = tick.timestamp;
                existing.run_ids = tick.run_ids.clone();
                existing.error = tick.error.clone();
                Ok(())
            }
            None => Err(StoreError::JobTickNotFound(tick.id)),
        }
    }

    fn get_job_ticks(&self, job_origin_id: &str) -> Result<Vec<JobTick>> {
        let inner = self.inner.read().unwrap();
        let mut ticks: Vec<JobTick> = inner
            .ticks
            .values()
            .filter(|tick| tick.job_origin_id == job_origin_id)
            .cloned()
            .collect();
        // Most recent first, id as tie-break
        ticks.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        Ok(ticks)
    }

    fn get_latest_job_tick(&self, job_origin_id: &str) -> Result<Option<JobTick>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .ticks
            .values()
            .filter(|tick| tick.job_origin_id == job_origin_id)
            .max_by_key(|tick| (tick.timestamp, tick.id))
            .cloned())
    }

    fn purge_job_ticks(
        &self,
        job_origin_id: &str,
        status: JobTickStatus,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        let before_count = inner.ticks.len();
        inner.ticks.retain(|_, tick| {
            !(tick.job_origin_id == job_origin_id
                && tick.status == status
                && tick.timestamp < before)
        });
        Ok(before_count - inner.ticks.len())
    }

    fn get_job_tick_stats(&self, job_origin_id: &str) -> Result<JobTickStats> {
        let inner = self.inner.read().unwrap();
        let mut stats = JobTickStats::default();
        for tick in inner
            .ticks
            .values()
            .filter(|tick| tick.job_origin_id == job_origin_id)
        {
            stats.add(tick.status, 1);
        }
        Ok(stats)
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    fn wipe(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.states.clear();
        inner.ticks.clear();
        Ok(())
    }

    fn upgrade(&self) -> Result<()> {
        // Nothing to migrate
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        JobOrigin, JobSpecificData, JobStatus, JobType, TickError,
    };
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn schedule_state(repo: &str, name: &str) -> JobState {
        JobState {
            origin: JobOrigin::new(repo, name),
            job_type: JobType::Schedule,
            status: JobStatus::Running,
            data: JobSpecificData::Schedule {
                cron_schedule: "*/5 * * * *".to_string(),
                execution_timezone: None,
            },
        }
    }

    fn init_data(job_origin_id: &str, at: DateTime<Utc>) -> JobTickInitData {
        JobTickInitData {
            job_origin_id: job_origin_id.to_string(),
            job_type: JobType::Schedule,
            timestamp: at,
        }
    }

    #[test]
    fn test_job_state_round_trip_and_duplicate() {
        let store = InMemoryScheduleStore::new();
        let state = schedule_state("repo-1", "nightly");

        store.add_job_state(&state).unwrap();
        assert_eq!(
            store.get_job_state(&state.origin_id()).unwrap().unwrap(),
            state
        );
        assert!(matches!(
            store.add_job_state(&state).unwrap_err(),
            StoreError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_update_and_delete_absent_state() {
        let store = InMemoryScheduleStore::new();
        let state = schedule_state("repo-1", "nightly");

        assert!(matches!(
            store.update_job_state(&state).unwrap_err(),
            StoreError::JobStateNotFound(_)
        ));
        assert!(matches!(
            store.delete_job_state(&state.origin_id()).unwrap_err(),
            StoreError::JobStateNotFound(_)
        ));
    }

    #[test]
    fn test_filters() {
        let store = InMemoryScheduleStore::new();
        store.add_job_state(&schedule_state("repo-1", "nightly")).unwrap();
        store.add_job_state(&schedule_state("repo-2", "hourly")).unwrap();

        assert_eq!(store.all_job_states(&JobStateFilter::all()).unwrap().len(), 2);
        assert_eq!(
            store
                .all_job_states(&JobStateFilter::all().with_repository("repo-2"))
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .all_job_states(&JobStateFilter::all().with_job_type(JobType::Sensor))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_tick_lifecycle_and_ordering() {
        let store = InMemoryScheduleStore::new();

        let t1 = store.create_job_tick(init_data("origin-1", ts(100))).unwrap();
        assert_eq!(t1.status, JobTickStatus::Started);

        store
            .update_job_tick(
                &t1.clone()
                    .with_status(JobTickStatus::Failure)
                    .with_error(TickError::new("boom")),
            )
            .unwrap();

        let t2 = store.create_job_tick(init_data("origin-1", ts(200))).unwrap();
        assert_ne!(t1.id, t2.id);

        let ticks = store.get_job_ticks("origin-1").unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].id, t2.id);
        assert_eq!(ticks[1].error.as_ref().unwrap().message, "boom");

        let latest = store.get_latest_job_tick("origin-1").unwrap().unwrap();
        assert_eq!(latest.id, t2.id);
    }

    #[test]
    fn test_latest_tick_tie_break_on_id() {
        let store = InMemoryScheduleStore::new();
        store.create_job_tick(init_data("origin-1", ts(100))).unwrap();
        let newer = store.create_job_tick(init_data("origin-1", ts(100))).unwrap();

        let latest = store.get_latest_job_tick("origin-1").unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
    }

    #[test]
    fn test_terminal_guard() {
        let store = InMemoryScheduleStore::new();
        let tick = store.create_job_tick(init_data("origin-1", ts(100))).unwrap();
        store
            .update_job_tick(&tick.clone().with_status(JobTickStatus::Skipped))
            .unwrap();

        assert!(matches!(
            store
                .update_job_tick(&tick.with_status(JobTickStatus::Started))
                .unwrap_err(),
            StoreError::TerminalTick { .. }
        ));
    }

    #[test]
    fn test_purge_and_stats() {
        let store = InMemoryScheduleStore::new();

        let t1 = store.create_job_tick(init_data("origin-1", ts(100))).unwrap();
        store
            .update_job_tick(&t1.with_status(JobTickStatus::Success))
            .unwrap();
        let t2 = store.create_job_tick(init_data("origin-1", ts(200))).unwrap();
        store
            .update_job_tick(&t2.with_status(JobTickStatus::Success))
            .unwrap();

        let stats = store.get_job_tick_stats("origin-1").unwrap();
        assert_eq!(stats.success, 2);

        assert_eq!(
            store
                .purge_job_ticks("origin-1", JobTickStatus::Success, ts(150))
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .purge_job_ticks("origin-1", JobTickStatus::Success, ts(150))
                .unwrap(),
            0
        );
        assert_eq!(store.get_job_tick_stats("origin-1").unwrap().success, 1);
    }

    #[test]
    fn test_wipe() {
        let store = InMemoryScheduleStore::new();
        store.add_job_state(&schedule_state("repo-1", "nightly")).unwrap();
        store.create_job_tick(init_data("origin-1", ts(100))).unwrap();

        store.wipe().unwrap();

        assert!(store.all_job_states(&JobStateFilter::all()).unwrap().is_empty());
        assert!(store.get_job_ticks("origin-1").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_tick_creation_assigns_distinct_ids() {
        let store = Arc::new(InMemoryScheduleStore::new());

        let handles: Vec<_> = (0..8i64)
            .map(|thread| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..5i64)
                        .map(|i| {
                            store
                                .create_job_tick(init_data("origin-1", ts(thread * 10 + i)))
                                .unwrap()
                                .id
                        })
                        .collect::<Vec<i64>>()
                })
            })
            .collect();

        let mut ids: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 40);
    }
}

//! In-memory reference store.
//!
//! Satisfies the full store contract within one process: an ordered map of
//! triggers with a derived due-index, check/set leases, and idempotent run
//! records. Nothing persists across restarts. The clock is injectable so
//! lease and stall arithmetic is deterministic under test.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::store::{
    JobRecord, Run, RunEnd, RunId, SchedulerStore, StoreError, Trigger,
};
use crate::store::Revision;
use crate::trigger::TriggerId;

/// Due-index key: `(next_run_at millis, -priority, id)` so that ascending
/// iteration yields the drain order.
type DueKey = (i64, i64, TriggerId);

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobRecord>,
    triggers: BTreeMap<TriggerId, Trigger>,
    due: BTreeSet<DueKey>,
    runs: HashMap<RunId, Run>,
}

fn due_key(trigger: &Trigger) -> Option<DueKey> {
    trigger
        .next_run_at
        .map(|at| (at.timestamp_millis(), -i64::from(trigger.priority), trigger.id))
}

/// Reference store implementation for a single process.
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Store on an injected clock (virtual in tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryStore")
            .field("jobs", &state.jobs.len())
            .field("triggers", &state.triggers.len())
            .field("runs", &state.runs.len())
            .finish()
    }
}

#[async_trait]
impl SchedulerStore for InMemoryStore {
    async fn upsert_job(&self, job: JobRecord) -> Result<(), StoreError> {
        self.lock().jobs.insert(job.name.clone(), job);
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.lock().jobs.get(name).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.lock().jobs.values().cloned().collect())
    }

    async fn set_job_paused(&self, name: &str, paused: bool) -> Result<(), StoreError> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(name).ok_or(StoreError::NotFound)?;
        job.paused = paused;
        Ok(())
    }

    async fn remove_job(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.jobs.remove(name).ok_or(StoreError::NotFound)?;
        Ok(())
    }

    async fn upsert_trigger(&self, trigger: Trigger) -> Result<Revision, StoreError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let current = state
            .triggers
            .get(&trigger.id)
            .map(|t| t.revision)
            .unwrap_or(Revision::NONE);
        if trigger.revision != current {
            return Err(StoreError::Conflict);
        }

        if let Some(existing) = state.triggers.get(&trigger.id) {
            if let Some(key) = due_key(existing) {
                state.due.remove(&key);
            }
        }

        let mut stored = trigger;
        stored.revision = current.next();
        let revision = stored.revision;
        if let Some(key) = due_key(&stored) {
            state.due.insert(key);
        }
        state.triggers.insert(stored.id, stored);
        Ok(revision)
    }

    async fn get_trigger(&self, id: &TriggerId) -> Result<Option<Trigger>, StoreError> {
        Ok(self.lock().triggers.get(id).cloned())
    }

    async fn list_triggers(&self) -> Result<Vec<Trigger>, StoreError> {
        Ok(self.lock().triggers.values().cloned().collect())
    }

    async fn delete_trigger(&self, id: &TriggerId) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(existing) = state.triggers.remove(id) {
            if let Some(key) = due_key(&existing) {
                state.due.remove(&key);
            }
        }
        Ok(())
    }

    async fn list_due_triggers(
        &self,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError> {
        let now = self.clock.now();
        let until_ms = until.timestamp_millis();
        let state = self.lock();

        let mut out = Vec::new();
        for &(at_ms, _, id) in &state.due {
            if at_ms > until_ms || out.len() >= limit {
                break;
            }
            let Some(trigger) = state.triggers.get(&id) else {
                continue;
            };
            if !trigger.paused && trigger.claimable(now) {
                out.push(trigger.clone());
            }
        }
        Ok(out)
    }

    async fn claim_trigger(
        &self,
        id: &TriggerId,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(trigger) = state.triggers.get_mut(id) else {
            return Ok(false);
        };
        if !trigger.claimable(now) {
            return Ok(false);
        }
        trigger.lease_owner = Some(owner.to_string());
        trigger.leased_until = Some(
            now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        trigger.revision = trigger.revision.next();
        Ok(true)
    }

    async fn release_trigger(&self, id: &TriggerId, owner: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(trigger) = state.triggers.get_mut(id) {
            if trigger.lease_owner.as_deref() == Some(owner) {
                trigger.lease_owner = None;
                trigger.leased_until = None;
                trigger.revision = trigger.revision.next();
            }
        }
        Ok(())
    }

    async fn record_run_start(&self, run: Run) -> Result<(), StoreError> {
        // Upsert keyed by run id: re-recording is idempotent.
        self.lock().runs.insert(run.run_id.clone(), run);
        Ok(())
    }

    async fn record_run_end(&self, run_id: &RunId, end: RunEnd) -> Result<(), StoreError> {
        if !end.status.is_terminal() {
            return Err(StoreError::State(format!(
                "run end requires a terminal status, got {:?}",
                end.status
            )));
        }
        let mut state = self.lock();
        let run = state.runs.get_mut(run_id).ok_or(StoreError::NotFound)?;
        if run.status.is_terminal() {
            return Err(StoreError::State(format!(
                "run {run_id} already ended as {:?}",
                run.status
            )));
        }
        run.status = end.status;
        run.ended_at = Some(end.ended_at);
        run.result = end.result;
        run.error = end.error;
        Ok(())
    }

    async fn touch_run(&self, run_id: &RunId, progress: Option<u8>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let run = state.runs.get_mut(run_id).ok_or(StoreError::NotFound)?;
        if run.status != crate::store::RunStatus::Running {
            return Err(StoreError::State(format!(
                "cannot touch run {run_id} in status {:?}",
                run.status
            )));
        }
        run.heartbeat_at = Some(now);

        if let Some(p) = progress {
            if p > 100 {
                return Err(StoreError::State(format!(
                    "progress {p} out of range 0..=100"
                )));
            }
            if let Some(current) = run.progress {
                if p < current {
                    return Err(StoreError::State(format!(
                        "progress decreased from {current} to {p}"
                    )));
                }
            }
            run.progress = Some(p);
        }
        Ok(())
    }

    async fn find_stalled_runs(
        &self,
        heartbeat_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Run>, StoreError> {
        let cutoff = now
            - chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let state = self.lock();
        Ok(state
            .runs
            .values()
            .filter(|run| {
                run.status == crate::store::RunStatus::Running
                    && run
                        .heartbeat_at
                        .or(run.started_at)
                        .map_or(false, |hb| hb < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.lock().runs.get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::store::RunStatus;
    use crate::trigger::TriggerOptions;

    fn instant(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn store_at(start: &str) -> (InMemoryStore, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::at(instant(start)));
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    fn trigger(job: &str, next: &str, priority: i32) -> Trigger {
        Trigger {
            id: TriggerId::new(),
            job: job.into(),
            options: TriggerOptions::every("1m"),
            next_run_at: Some(instant(next)),
            last_run_at: None,
            failure_count: 0,
            priority,
            paused: false,
            revision: Revision::NONE,
            metadata: None,
            lease_owner: None,
            leased_until: None,
        }
    }

    fn run(id: RunId, trigger_id: TriggerId, status: RunStatus) -> Run {
        Run {
            run_id: id,
            trigger_id,
            job: "emails".into(),
            scheduled_at: instant("2024-01-01T00:00:00Z"),
            started_at: None,
            ended_at: None,
            attempt: 1,
            status,
            progress: None,
            heartbeat_at: None,
            result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_due_order_time_priority_id() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");

        let early = trigger("a", "2024-01-01T00:00:10Z", 0);
        let late = trigger("b", "2024-01-01T00:00:30Z", 100);
        let high = trigger("c", "2024-01-01T00:00:20Z", 10);
        let low = trigger("d", "2024-01-01T00:00:20Z", 1);
        for t in [&early, &late, &high, &low] {
            store.upsert_trigger(t.clone()).await.unwrap();
        }

        let due = store
            .list_due_triggers(instant("2024-01-01T00:01:00Z"), 10)
            .await
            .unwrap();
        let ids: Vec<TriggerId> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![early.id, high.id, low.id, late.id]);
    }

    #[tokio::test]
    async fn test_due_respects_until_and_limit() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        for i in 0..5 {
            let t = trigger("a", &format!("2024-01-01T00:00:0{i}Z"), 0);
            store.upsert_trigger(t).await.unwrap();
        }

        let due = store
            .list_due_triggers(instant("2024-01-01T00:00:02Z"), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 3);

        let due = store
            .list_due_triggers(instant("2024-01-01T00:01:00Z"), 2)
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn test_paused_triggers_not_due() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let mut t = trigger("a", "2024-01-01T00:00:00Z", 0);
        t.paused = true;
        store.upsert_trigger(t).await.unwrap();

        let due = store
            .list_due_triggers(instant("2024-01-01T01:00:00Z"), 10)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_release() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let t = trigger("a", "2024-01-01T00:00:00Z", 0);
        let id = t.id;
        store.upsert_trigger(t).await.unwrap();

        assert!(store
            .claim_trigger(&id, "engine-a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .claim_trigger(&id, "engine-b", Duration::from_secs(30))
            .await
            .unwrap());

        store.release_trigger(&id, "engine-a").await.unwrap();
        assert!(store
            .claim_trigger(&id, "engine-b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let (store, clock) = store_at("2024-01-01T00:00:00Z");
        let t = trigger("a", "2024-01-01T00:00:00Z", 0);
        let id = t.id;
        store.upsert_trigger(t).await.unwrap();

        assert!(store
            .claim_trigger(&id, "engine-a", Duration::from_secs(30))
            .await
            .unwrap());
        clock.advance(Duration::from_secs(30));
        assert!(store
            .claim_trigger(&id, "engine-b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_a_noop() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let t = trigger("a", "2024-01-01T00:00:00Z", 0);
        let id = t.id;
        store.upsert_trigger(t).await.unwrap();

        assert!(store
            .claim_trigger(&id, "engine-a", Duration::from_secs(30))
            .await
            .unwrap());
        store.release_trigger(&id, "engine-b").await.unwrap();
        assert!(!store
            .claim_trigger(&id, "engine-b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_leased_triggers_not_due() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let t = trigger("a", "2024-01-01T00:00:00Z", 0);
        let id = t.id;
        store.upsert_trigger(t).await.unwrap();
        store
            .claim_trigger(&id, "engine-a", Duration::from_secs(30))
            .await
            .unwrap();

        let due = store
            .list_due_triggers(instant("2024-01-01T01:00:00Z"), 10)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_revision_conflict() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let t = trigger("a", "2024-01-01T00:00:00Z", 0);
        let rev = store.upsert_trigger(t.clone()).await.unwrap();
        assert_eq!(rev, Revision(1));

        // Writing with a stale revision fails.
        let err = store.upsert_trigger(t.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));

        let mut fresh = store.get_trigger(&t.id).await.unwrap().unwrap();
        fresh.priority = 9;
        let rev = store.upsert_trigger(fresh).await.unwrap();
        assert_eq!(rev, Revision(2));
    }

    #[tokio::test]
    async fn test_record_run_start_is_idempotent() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let id = RunId::compose("engine-a", 1);
        let r = run(id.clone(), TriggerId::new(), RunStatus::Pending);
        store.record_run_start(r.clone()).await.unwrap();
        store.record_run_start(r).await.unwrap();
        assert!(store.get_run(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_end_requires_live_run() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let id = RunId::compose("engine-a", 1);
        store
            .record_run_start(run(id.clone(), TriggerId::new(), RunStatus::Running))
            .await
            .unwrap();

        store
            .record_run_end(
                &id,
                RunEnd {
                    status: RunStatus::Completed,
                    ended_at: instant("2024-01-01T00:01:00Z"),
                    result: None,
                    error: None,
                },
            )
            .await
            .unwrap();

        // Ending again is an illegal transition.
        let err = store
            .record_run_end(
                &id,
                RunEnd {
                    status: RunStatus::Failed,
                    ended_at: instant("2024-01-01T00:02:00Z"),
                    result: None,
                    error: Some("boom".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::State(_)));

        let missing = RunId::compose("engine-a", 99);
        let err = store
            .record_run_end(
                &missing,
                RunEnd {
                    status: RunStatus::Failed,
                    ended_at: instant("2024-01-01T00:02:00Z"),
                    result: None,
                    error: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_touch_updates_heartbeat_and_progress() {
        let (store, clock) = store_at("2024-01-01T00:00:00Z");
        let id = RunId::compose("engine-a", 1);
        store
            .record_run_start(run(id.clone(), TriggerId::new(), RunStatus::Running))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(5));
        store.touch_run(&id, Some(40)).await.unwrap();
        let r = store.get_run(&id).await.unwrap().unwrap();
        assert_eq!(r.heartbeat_at, Some(instant("2024-01-01T00:00:05Z")));
        assert_eq!(r.progress, Some(40));
    }

    #[tokio::test]
    async fn test_progress_violations_leave_progress_unchanged() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let id = RunId::compose("engine-a", 1);
        store
            .record_run_start(run(id.clone(), TriggerId::new(), RunStatus::Running))
            .await
            .unwrap();
        store.touch_run(&id, Some(60)).await.unwrap();

        let err = store.touch_run(&id, Some(30)).await.unwrap_err();
        assert!(matches!(err, StoreError::State(_)));
        let err = store.touch_run(&id, Some(150)).await.unwrap_err();
        assert!(matches!(err, StoreError::State(_)));

        let r = store.get_run(&id).await.unwrap().unwrap();
        assert_eq!(r.progress, Some(60));
    }

    #[tokio::test]
    async fn test_find_stalled_runs() {
        let (store, clock) = store_at("2024-01-01T00:00:00Z");
        let fresh_id = RunId::compose("engine-a", 1);
        let stale_id = RunId::compose("engine-a", 2);
        let done_id = RunId::compose("engine-a", 3);
        store
            .record_run_start(run(fresh_id.clone(), TriggerId::new(), RunStatus::Running))
            .await
            .unwrap();
        store
            .record_run_start(run(stale_id.clone(), TriggerId::new(), RunStatus::Running))
            .await
            .unwrap();
        store
            .record_run_start(run(done_id.clone(), TriggerId::new(), RunStatus::Completed))
            .await
            .unwrap();

        store.touch_run(&stale_id, None).await.unwrap();
        clock.advance(Duration::from_secs(120));
        store.touch_run(&fresh_id, None).await.unwrap();

        let stalled = store
            .find_stalled_runs(Duration::from_secs(60), clock.now())
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].run_id, stale_id);
    }

    #[tokio::test]
    async fn test_job_crud() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let job = JobRecord {
            name: "emails".into(),
            concurrency: 1,
            timeout: None,
            retry: None,
            rate_limit: None,
            metadata: None,
            paused: false,
            worker: None,
        };
        store.upsert_job(job).await.unwrap();
        assert!(store.get_job("emails").await.unwrap().is_some());
        assert_eq!(store.list_jobs().await.unwrap().len(), 1);

        store.set_job_paused("emails", true).await.unwrap();
        assert!(store.get_job("emails").await.unwrap().unwrap().paused);

        store.remove_job("emails").await.unwrap();
        assert!(store.get_job("emails").await.unwrap().is_none());
        assert!(matches!(
            store.remove_job("emails").await.unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_delete_trigger_clears_due_index() {
        let (store, _clock) = store_at("2024-01-01T00:00:00Z");
        let t = trigger("a", "2024-01-01T00:00:00Z", 0);
        let id = t.id;
        store.upsert_trigger(t).await.unwrap();
        store.delete_trigger(&id).await.unwrap();

        let due = store
            .list_due_triggers(instant("2024-01-01T01:00:00Z"), 10)
            .await
            .unwrap();
        assert!(due.is_empty());
        // Deleting again is a no-op.
        store.delete_trigger(&id).await.unwrap();
    }
}

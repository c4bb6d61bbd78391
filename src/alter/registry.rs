use crate::alter::job::{AlterJob, JobState, JobType};
use crate::catalog::types::JobId;
use crate::error::{FeError, ResourceType};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Live handle of one job: its latest committed state plus the per-job
/// coordination flags used by the scheduler.
#[derive(Debug)]
pub struct JobSlot {
    job_id: JobId,
    stepping: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
    state: watch::Sender<AlterJob>,
}

/// Exclusive right to run one step of a job. Released on drop.
pub(crate) struct StepGuard<'a> {
    slot: &'a JobSlot,
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.slot.stepping.store(false, Ordering::Release);
    }
}

impl JobSlot {
    fn new(job: AlterJob) -> Self {
        let cancel_reason = Mutex::new(job.cancel_requested.clone());
        let job_id = job.job_id;
        let (state, _) = watch::channel(job);
        Self {
            job_id,
            stepping: AtomicBool::new(false),
            cancel_reason,
            state,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn snapshot(&self) -> AlterJob {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().state
    }

    /// Receiver notified after every committed transition.
    pub fn subscribe(&self) -> watch::Receiver<AlterJob> {
        self.state.subscribe()
    }

    pub(crate) fn try_begin_step(&self) -> Option<StepGuard<'_>> {
        self.stepping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StepGuard { slot: self })
    }

    /// Arms the cancel flag unless a request is already pending. `persist`
    /// runs first and an error from it leaves the flag untouched. Returns
    /// whether this call armed the flag.
    pub(crate) fn request_cancel(
        &self,
        reason: &str,
        persist: impl FnOnce() -> Result<(), FeError>,
    ) -> Result<bool, FeError> {
        let mut pending = self.cancel_reason.lock();
        if pending.is_some() {
            return Ok(false);
        }
        persist()?;
        *pending = Some(reason.to_string());
        self.state
            .send_modify(|job| job.cancel_requested = Some(reason.to_string()));
        Ok(true)
    }

    pub(crate) fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().clone()
    }

    /// Replaces the published state. A pending cancel request survives on
    /// either side: a replayed record re-arms the flag, and a step that
    /// started before the request keeps it.
    pub(crate) fn publish(&self, mut job: AlterJob) {
        let mut pending = self.cancel_reason.lock();
        match (pending.as_ref(), job.cancel_requested.as_ref()) {
            (Some(reason), None) => job.cancel_requested = Some(reason.clone()),
            (None, Some(reason)) => *pending = Some(reason.clone()),
            _ => {}
        }
        self.state.send_replace(job);
    }
}

/// Jobs of one type, keyed by job id.
#[derive(Debug)]
pub struct JobRegistry {
    job_type: JobType,
    jobs: RwLock<BTreeMap<JobId, Arc<JobSlot>>>,
}

impl JobRegistry {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            jobs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub(crate) fn register(&self, job: AlterJob) -> Result<Arc<JobSlot>, FeError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.job_id) {
            return Err(FeError::already_exists(
                ResourceType::AlterJob,
                job.job_id.to_string(),
            ));
        }
        let slot = Arc::new(JobSlot::new(job));
        jobs.insert(slot.job_id(), Arc::clone(&slot));
        Ok(slot)
    }

    /// Inserts or overwrites a job from the journal or a checkpoint image.
    pub(crate) fn restore(&self, job: AlterJob) {
        let mut jobs = self.jobs.write();
        match jobs.get(&job.job_id) {
            Some(slot) => slot.publish(job),
            None => {
                jobs.insert(job.job_id, Arc::new(JobSlot::new(job)));
            }
        }
    }

    pub(crate) fn remove(&self, job_id: JobId) -> Option<Arc<JobSlot>> {
        self.jobs.write().remove(&job_id)
    }

    pub fn get(&self, job_id: JobId) -> Option<Arc<JobSlot>> {
        self.jobs.read().get(&job_id).cloned()
    }

    pub fn slots(&self) -> Vec<Arc<JobSlot>> {
        self.jobs.read().values().cloned().collect()
    }

    /// Current state of every job, terminal ones included until purged.
    pub fn get_alter_jobs(&self) -> BTreeMap<JobId, AlterJob> {
        self.jobs
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.snapshot()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|slot| !slot.state().is_final_state())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::JobRegistry;
    use crate::alter::job::{AlterJob, AlterJobPayload, JobState, JobType, ShadowIndex};
    use crate::error::FeError;
    use crate::catalog::schema::{ColumnDef, SchemaVersion};
    use crate::catalog::table::Table;
    use crate::catalog::types::{ColumnType, TableEngine};

    fn rollup_job(job_id: u64) -> AlterJob {
        let table = Table::new(
            2,
            "tbl1",
            TableEngine::Olap,
            SchemaVersion::new(3, 0, vec![ColumnDef::key("k1", ColumnType::Int)]),
        );
        let payload = AlterJobPayload::Rollup {
            base_index_id: 3,
            rollup: ShadowIndex {
                origin_index_id: None,
                index_name: "r1".into(),
                schema: SchemaVersion::new(job_id + 1, 0, vec![ColumnDef::key("k1", ColumnType::Int)]),
            },
        };
        AlterJob::new(job_id, 1, &table, payload, 60_000, 0)
    }

    #[test]
    fn only_one_step_at_a_time() {
        let registry = JobRegistry::new(JobType::Rollup);
        let slot = registry.register(rollup_job(10)).expect("register");
        let guard = slot.try_begin_step().expect("first step");
        assert!(slot.try_begin_step().is_none());
        drop(guard);
        assert!(slot.try_begin_step().is_some());
    }

    #[test]
    fn duplicate_job_id_is_rejected() {
        let registry = JobRegistry::new(JobType::Rollup);
        registry.register(rollup_job(10)).expect("register");
        assert!(registry.register(rollup_job(10)).is_err());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn published_state_reaches_subscribers() {
        let registry = JobRegistry::new(JobType::Rollup);
        let slot = registry.register(rollup_job(10)).expect("register");
        let mut rx = slot.subscribe();
        let mut next = slot.snapshot();
        next.transition_to(JobState::Cancelled, 5).expect("cancel");
        slot.publish(next);
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().state, JobState::Cancelled);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.get_alter_jobs()[&10].state, JobState::Cancelled);
    }

    #[test]
    fn first_cancel_reason_wins() {
        let registry = JobRegistry::new(JobType::Rollup);
        let slot = registry.register(rollup_job(10)).expect("register");
        assert!(slot.request_cancel("user request", || Ok(())).expect("first"));
        assert!(!slot.request_cancel("second", || Ok(())).expect("second"));
        assert_eq!(slot.cancel_reason().as_deref(), Some("user request"));
        assert_eq!(slot.snapshot().cancel_requested.as_deref(), Some("user request"));
    }

    #[test]
    fn failed_persist_leaves_cancel_unarmed() {
        let registry = JobRegistry::new(JobType::Rollup);
        let slot = registry.register(rollup_job(10)).expect("register");
        let err = slot
            .request_cancel("user request", || Err(FeError::Validation("disk gone".into())))
            .expect_err("persist fails");
        assert!(matches!(err, FeError::Validation(_)));
        assert!(slot.cancel_reason().is_none());
        assert!(slot.snapshot().cancel_requested.is_none());
    }

    #[test]
    fn cancel_request_survives_publish_and_restore() {
        let registry = JobRegistry::new(JobType::Rollup);
        let slot = registry.register(rollup_job(10)).expect("register");
        let stale = slot.snapshot();
        slot.request_cancel("stop", || Ok(())).expect("cancel");
        slot.publish(stale);
        assert_eq!(slot.snapshot().cancel_requested.as_deref(), Some("stop"));

        let restored = JobRegistry::new(JobType::Rollup);
        let mut job = rollup_job(11);
        job.cancel_requested = Some("before restart".into());
        restored.restore(job);
        let slot = restored.get(11).expect("slot");
        assert_eq!(slot.cancel_reason().as_deref(), Some("before restart"));
    }
}

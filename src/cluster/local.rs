//! In-process stand-ins for worker nodes and the transaction manager, used by
//! tests and the offline tooling. Completion, failures and open transactions
//! are all driven explicitly by the caller.

use crate::catalog::schema::SchemaVersion;
use crate::catalog::types::{DbId, IndexId, JobId, TxnId};
use crate::cluster::{BuildTask, TaskHandle, TaskStatus, TransactionManager, WorkerDispatcher};
use crate::error::FeError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
struct LocalTask {
    handle: TaskHandle,
    schema: SchemaVersion,
    remaining_polls: u32,
    status: TaskStatus,
}

#[derive(Debug)]
struct LocalWorkersInner {
    tasks: HashMap<(JobId, IndexId), LocalTask>,
    next_task_id: u64,
    polls_to_complete: u32,
    held: bool,
    failing_dispatches: u32,
    sticky_failure: Option<String>,
    dispatch_count: u64,
    released: Vec<TaskHandle>,
}

#[derive(Debug)]
pub struct LocalWorkers {
    inner: Mutex<LocalWorkersInner>,
}

impl Default for LocalWorkers {
    fn default() -> Self {
        Self::new(1)
    }
}

impl LocalWorkers {
    /// Tasks report `Done` on their `polls_to_complete`-th poll.
    pub fn new(polls_to_complete: u32) -> Self {
        Self {
            inner: Mutex::new(LocalWorkersInner {
                tasks: HashMap::new(),
                next_task_id: 1,
                polls_to_complete: polls_to_complete.max(1),
                held: false,
                failing_dispatches: 0,
                sticky_failure: None,
                dispatch_count: 0,
                released: Vec::new(),
            }),
        }
    }

    /// Keeps every task pending until [`LocalWorkers::resume`].
    pub fn hold(&self) {
        self.inner.lock().held = true;
    }

    pub fn resume(&self) {
        self.inner.lock().held = false;
    }

    /// The next `n` dispatch calls fail as if the worker were unreachable.
    pub fn fail_next_dispatches(&self, n: u32) {
        self.inner.lock().failing_dispatches = n;
    }

    /// Every poll reports `Failed(reason)` until cleared with `None`.
    pub fn set_task_failure(&self, reason: Option<&str>) {
        self.inner.lock().sticky_failure = reason.map(str::to_string);
    }

    pub fn dispatch_count(&self) -> u64 {
        self.inner.lock().dispatch_count
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn released(&self) -> Vec<TaskHandle> {
        self.inner.lock().released.clone()
    }

    pub fn built_schema(&self, job_id: JobId, index_id: IndexId) -> Option<SchemaVersion> {
        self.inner
            .lock()
            .tasks
            .get(&(job_id, index_id))
            .map(|t| t.schema.clone())
    }
}

impl WorkerDispatcher for LocalWorkers {
    fn build_and_backfill(&self, task: &BuildTask) -> Result<TaskHandle, FeError> {
        let mut inner = self.inner.lock();
        if inner.failing_dispatches > 0 {
            inner.failing_dispatches -= 1;
            return Err(FeError::Worker(format!(
                "worker unreachable while dispatching job {} index {}",
                task.job_id,
                task.index_id()
            )));
        }
        inner.dispatch_count += 1;
        let key = (task.job_id, task.index_id());
        if let Some(existing) = inner.tasks.get(&key)
            && !matches!(existing.status, TaskStatus::Failed(_))
        {
            return Ok(existing.handle.clone());
        }
        let handle = TaskHandle {
            job_id: task.job_id,
            index_id: task.index_id(),
            task_id: inner.next_task_id,
        };
        inner.next_task_id += 1;
        let remaining_polls = inner.polls_to_complete;
        inner.tasks.insert(
            key,
            LocalTask {
                handle: handle.clone(),
                schema: task.schema.clone(),
                remaining_polls,
                status: TaskStatus::Pending,
            },
        );
        Ok(handle)
    }

    fn poll_status(&self, handle: &TaskHandle) -> Result<TaskStatus, FeError> {
        let mut inner = self.inner.lock();
        let held = inner.held;
        let sticky_failure = inner.sticky_failure.clone();
        let Some(task) = inner.tasks.get_mut(&(handle.job_id, handle.index_id)) else {
            return Ok(TaskStatus::Failed(format!(
                "task {} not found on worker",
                handle.task_id
            )));
        };
        if task.handle.task_id != handle.task_id {
            return Ok(TaskStatus::Failed(format!(
                "task {} was superseded",
                handle.task_id
            )));
        }
        if let Some(reason) = sticky_failure {
            task.status = TaskStatus::Failed(reason);
            return Ok(task.status.clone());
        }
        if held || task.status != TaskStatus::Pending {
            return Ok(task.status.clone());
        }
        task.remaining_polls = task.remaining_polls.saturating_sub(1);
        if task.remaining_polls == 0 {
            task.status = TaskStatus::Done;
        }
        Ok(task.status.clone())
    }

    fn release(&self, handle: &TaskHandle) {
        let mut inner = self.inner.lock();
        inner.tasks.remove(&(handle.job_id, handle.index_id));
        inner.released.push(handle.clone());
    }
}

#[derive(Debug)]
struct TxnInner {
    next_id: TxnId,
    active: BTreeMap<TxnId, DbId>,
}

#[derive(Debug)]
pub struct LocalTxnManager {
    inner: Mutex<TxnInner>,
}

impl Default for LocalTxnManager {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TxnInner {
                next_id: 1,
                active: BTreeMap::new(),
            }),
        }
    }
}

impl LocalTxnManager {
    pub fn begin(&self, db_id: DbId) -> TxnId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.active.insert(id, db_id);
        id
    }

    pub fn finish(&self, txn_id: TxnId) -> bool {
        self.inner.lock().active.remove(&txn_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }
}

impl TransactionManager for LocalTxnManager {
    fn next_transaction_id(&self) -> TxnId {
        self.inner.lock().next_id
    }

    fn oldest_active_transaction_id(&self, db_id: DbId) -> Option<TxnId> {
        self.inner
            .lock()
            .active
            .iter()
            .find(|(_, db)| **db == db_id)
            .map(|(id, _)| *id)
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;

use crate::{BoundedQueue, Event, PoolError, INFINITE_TIMEOUT};

/// Depth of the shared job queue unless overridden at construction.
const MAX_QUEUE_DEPTH: usize = 1024;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

/// Handle to a submitted job, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// Handle to a batch of jobs submitted together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Block until the job queue has space.
    Blocking,
    /// Fail with [`PoolError::Busy`] when the job queue is full.
    NonBlocking,
}

/// A job body: any callable taking the informational worker id and returning
/// whether it succeeded. Cloneable so the same body can be resubmitted.
#[derive(Clone)]
pub struct Invokable {
    func: Arc<dyn Fn(u32) -> bool + Send + Sync>,
}

impl Invokable {
    pub fn new(func: impl Fn(u32) -> bool + Send + Sync + 'static) -> Self {
        Self {
            func: Arc::new(func),
        }
    }

    /// Binds a shared context to a plain function, the closure-free spelling
    /// of [`Invokable::new`] for callers that already hold an `Arc`.
    pub fn with_context<C: Send + Sync + 'static>(context: Arc<C>, func: fn(&C, u32) -> bool) -> Self {
        Self::new(move |tid| func(&context, tid))
    }

    fn invoke(&self, tid: u32) -> bool {
        (self.func)(tid)
    }
}

struct PoolJob {
    invokable: Invokable,
    handle: u64,
    group: Option<u64>,
}

struct GroupState {
    remaining: usize,
    event: Arc<Event>,
}

#[derive(Default)]
struct PoolState {
    next_job: u64,
    next_group: u64,
    events: HashMap<u64, Arc<Event>>,
    groups: HashMap<u64, GroupState>,
}

struct PoolShared {
    queue: BoundedQueue<PoolJob>,
    state: Mutex<PoolState>,
    exit: AtomicBool,
}

struct WorkerStats {
    jobs_executed: u64,
    seconds: f64,
}

struct Worker {
    thread_id: ThreadId,
    join: Option<JoinHandle<WorkerStats>>,
}

/// A fixed-size pool of worker threads draining a shared job queue.
///
/// Completion of each job is signalled through a per-job [`Event`]. Dropping
/// the pool wakes and joins every worker, then logs per-worker throughput.
pub struct ThreadPool {
    id: u32,
    shared: Arc<PoolShared>,
    workers: Vec<Worker>,
}

impl ThreadPool {
    /// # Panics
    ///
    /// Panics if `threads` is zero.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self::with_queue_capacity(threads, MAX_QUEUE_DEPTH)
    }

    /// # Panics
    ///
    /// Panics if `threads` or `queue_capacity` is zero.
    #[must_use]
    pub fn with_queue_capacity(threads: usize, queue_capacity: usize) -> Self {
        assert!(threads > 0, "thread pool needs at least one worker");

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(PoolShared {
            queue: BoundedQueue::new(queue_capacity),
            state: Mutex::new(PoolState::default()),
            exit: AtomicBool::new(false),
        });

        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let tid = (id << 16) | u32::try_from(index).unwrap_or(u16::MAX.into());
                let join = thread::Builder::new()
                    .name(format!("taskpool-{id}:{index}"))
                    .spawn(move || worker_loop(&shared, tid))
                    .expect("failed to spawn worker thread");
                Worker {
                    thread_id: join.thread().id(),
                    join: Some(join),
                }
            })
            .collect();

        Self { id, shared, workers }
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// True when the calling thread is one of this pool's workers.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.workers.iter().any(|w| w.thread_id == current)
    }

    /// Enqueues a job and returns its handle. The job's completion event is
    /// reset under the pool lock before the job becomes visible to workers,
    /// so a wait issued immediately after submit blocks until completion.
    pub fn submit(&self, invokable: Invokable, mode: SubmitMode) -> Result<JobId, PoolError> {
        self.submit_inner(invokable, None, mode)
    }

    /// Enqueues a batch of jobs sharing one group event, which fires when the
    /// last member completes. In non-blocking mode a full queue fails the
    /// remaining members with [`PoolError::Busy`]; members already enqueued
    /// still run and still count toward the group.
    pub fn submit_group(
        &self,
        invokables: Vec<Invokable>,
        mode: SubmitMode,
    ) -> Result<GroupId, PoolError> {
        if invokables.is_empty() {
            return Err(PoolError::NotOwned);
        }

        let total = invokables.len();
        let group = {
            let mut state = self.shared.state.lock();
            let group = state.next_group;
            state.next_group += 1;
            state.groups.insert(
                group,
                GroupState {
                    remaining: total,
                    event: Arc::new(Event::new()),
                },
            );
            group
        };

        for (sent, invokable) in invokables.into_iter().enumerate() {
            if let Err(err) = self.submit_inner(invokable, Some(group), mode) {
                // Unsent members will never complete; shrink the group to the
                // members that made it into the queue.
                let unsent = total - sent;
                let mut state = self.shared.state.lock();
                if sent == 0 {
                    state.groups.remove(&group);
                } else if let Some(entry) = state.groups.get_mut(&group) {
                    entry.remaining = entry.remaining.saturating_sub(unsent);
                    if entry.remaining == 0 {
                        entry.event.set_all();
                    }
                }
                return Err(err);
            }
        }

        Ok(GroupId(group))
    }

    /// Waits for a single job to complete.
    ///
    /// Fails fast with [`PoolError::DeadlockGuard`] when called from one of
    /// this pool's own workers. On `Ok` the completion entry is removed; on
    /// [`PoolError::Timeout`] it is retained so the caller may wait again.
    pub fn wait_for_job(&self, job: JobId, timeout_ms: u32) -> Result<(), PoolError> {
        if self.is_worker_thread() {
            return Err(PoolError::DeadlockGuard);
        }

        let event = self
            .shared
            .state
            .lock()
            .events
            .get(&job.0)
            .cloned()
            .ok_or(PoolError::NotOwned)?;

        event.wait(timeout_ms)?;
        self.shared.state.lock().events.remove(&job.0);
        Ok(())
    }

    /// Waits for every job in a group to complete.
    pub fn wait_for_group(&self, group: GroupId, timeout_ms: u32) -> Result<(), PoolError> {
        if self.is_worker_thread() {
            return Err(PoolError::DeadlockGuard);
        }

        let event = self
            .shared
            .state
            .lock()
            .groups
            .get(&group.0)
            .map(|g| Arc::clone(&g.event))
            .ok_or(PoolError::NotOwned)?;

        event.wait(timeout_ms)?;
        self.shared.state.lock().groups.remove(&group.0);
        Ok(())
    }

    fn submit_inner(
        &self,
        invokable: Invokable,
        group: Option<u64>,
        mode: SubmitMode,
    ) -> Result<JobId, PoolError> {
        let handle = {
            let mut state = self.shared.state.lock();
            let handle = state.next_job;
            state.next_job += 1;
            state
                .events
                .entry(handle)
                .or_insert_with(|| Arc::new(Event::new()))
                .reset();
            handle
        };

        let job = PoolJob {
            invokable,
            handle,
            group,
        };

        // Never hold the pool lock across a blocking send: the workers need
        // it to signal completion, and that is what frees queue space.
        let sent = match mode {
            SubmitMode::Blocking => self
                .shared
                .queue
                .send_blocking(job)
                .map_err(|_| PoolError::Shutdown),
            SubmitMode::NonBlocking => self.shared.queue.send(job).map_err(|_| PoolError::Busy),
        };

        if let Err(err) = sent {
            self.shared.state.lock().events.remove(&handle);
            return Err(err);
        }

        Ok(JobId(handle))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.queue.notify_all();

        for (index, worker) in self.workers.iter_mut().enumerate() {
            let Some(join) = worker.join.take() else {
                continue;
            };
            match join.join() {
                Ok(stats) => {
                    let rate = stats.jobs_executed as f64 / stats.seconds.max(f64::EPSILON);
                    tracing::info!(
                        pool = self.id,
                        worker = index,
                        jobs = stats.jobs_executed,
                        seconds = stats.seconds,
                        rate,
                        "worker finished"
                    );
                }
                Err(_) => tracing::warn!(pool = self.id, worker = index, "worker panicked"),
            }
        }

        let mut state = self.shared.state.lock();
        state.events.clear();
        state.groups.clear();
    }
}

fn worker_loop(shared: &PoolShared, tid: u32) -> WorkerStats {
    let started = Instant::now();
    let mut jobs_executed = 0u64;

    loop {
        if shared.exit.load(Ordering::SeqCst) {
            break;
        }

        let job = match shared.queue.recv(INFINITE_TIMEOUT) {
            Ok(job) => job,
            Err(_) => continue,
        };
        if shared.exit.load(Ordering::SeqCst) {
            break;
        }

        if !job.invokable.invoke(tid) {
            tracing::warn!(tid, handle = job.handle, "job reported failure");
        }
        jobs_executed += 1;

        let mut state = shared.state.lock();
        if let Some(event) = state.events.get(&job.handle) {
            event.set();
        }
        if let Some(group) = job.group {
            if let Some(entry) = state.groups.get_mut(&group) {
                entry.remaining = entry.remaining.saturating_sub(1);
                if entry.remaining == 0 {
                    entry.event.set_all();
                }
            }
        }
    }

    WorkerStats {
        jobs_executed,
        seconds: started.elapsed().as_secs_f64(),
    }
}

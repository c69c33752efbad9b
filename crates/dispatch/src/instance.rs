//! The compute-instance registry and the public dispatcher operations.
//!
//! Instances live in a fixed slot table of
//! [`crate::limits::MAX_COMPUTE_INSTANCES`] entries, reference-counted per
//! device. Jobs are driven through their stages on a shared worker pool;
//! queue submission is serialized through the per-instance submit lock.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use taskpool::{Event, Invokable, SubmitMode, ThreadPool};

use crate::backend::{default_backend, GpuBackend};
use crate::error::{BackendError, DispatchError};
use crate::job::{Job, JobHandle, JobStage, JobState};
use crate::limits;
use crate::program;

/// Raw instance handle value; `u32::MAX` is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(u32);

impl InstanceHandle {
    pub const INVALID: InstanceHandle = InstanceHandle(u32::MAX);

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// The backend context a job inherits from its owning instance at bind time.
#[derive(Clone)]
pub struct InstanceContext {
    backend: Arc<dyn GpuBackend>,
    submit_lock: Arc<Mutex<()>>,
    instance: InstanceHandle,
    generation: u64,
}

impl InstanceContext {
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    #[must_use]
    pub fn instance(&self) -> InstanceHandle {
        self.instance
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn for_tests(backend: Arc<dyn GpuBackend>, generation: u64) -> Self {
        Self {
            backend,
            submit_lock: Arc::new(Mutex::new(())),
            instance: InstanceHandle(0),
            generation,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// Turn on the backend's diagnostic/validation layer.
    pub enable_validation: bool,
    /// Device selection hint for applications that take the default device.
    pub preferred_device: u32,
    /// Worker threads for the stage-driver pool; defaults to the available
    /// parallelism.
    pub worker_threads: Option<usize>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            enable_validation: false,
            preferred_device: 0,
            worker_threads: None,
        }
    }
}

struct SlotState {
    device_index: Option<u32>,
    refs: u32,
    generation: u64,
    released: bool,
    unusable: bool,
    ctx: Option<InstanceContext>,
    active_jobs: HashMap<u32, Weak<Job>>,
    active_events: HashMap<u32, Arc<Event>>,
    in_flight: u32,
}

struct InstanceSlot {
    state: Mutex<SlotState>,
    drained: Condvar,
}

impl InstanceSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                device_index: None,
                refs: 0,
                generation: 0,
                released: false,
                unusable: false,
                ctx: None,
                active_jobs: HashMap::new(),
                active_events: HashMap::new(),
                in_flight: 0,
            }),
            drained: Condvar::new(),
        }
    }
}

struct Core {
    slots: Vec<InstanceSlot>,
    pool: ThreadPool,
    options: InitOptions,
    /// Serializes slot allocation in `acquire`.
    registry_lock: Mutex<()>,
    next_generation: AtomicU64,
}

static CORE: OnceLock<Core> = OnceLock::new();
static NEXT_JOB_HANDLE: AtomicU32 = AtomicU32::new(0);

fn build_core(options: InitOptions) -> Core {
    let threads = options.worker_threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4)
    });
    Core {
        slots: (0..limits::MAX_COMPUTE_INSTANCES)
            .map(|_| InstanceSlot::new())
            .collect(),
        pool: ThreadPool::new(threads),
        options,
        registry_lock: Mutex::new(()),
        next_generation: AtomicU64::new(1),
    }
}

fn core() -> &'static Core {
    CORE.get_or_init(|| build_core(InitOptions::default()))
}

/// Prepares process-wide state. Idempotent; the options of the first call
/// win, later calls are ignored.
pub fn init(options: InitOptions) {
    if CORE.get().is_some() {
        tracing::debug!("dispatcher already initialized");
        return;
    }
    let _ = CORE.get_or_init(|| build_core(options));
}

fn slot(handle: InstanceHandle) -> Result<&'static InstanceSlot, DispatchError> {
    core()
        .slots
        .get(handle.raw() as usize)
        .ok_or(DispatchError::InvalidArg)
}

/// Returns a handle to an instance bound to `device_index`, initializing the
/// slot on first use and incrementing its reference count otherwise.
pub fn acquire(device_index: u32) -> Result<InstanceHandle, DispatchError> {
    let core = core();
    let _registry = core.registry_lock.lock();

    // Reuse the live slot already bound to this device.
    for (index, slot) in core.slots.iter().enumerate() {
        let mut state = slot.state.lock();
        if state.device_index == Some(device_index) && !state.released && state.refs > 0 {
            state.refs += 1;
            return Ok(InstanceHandle(index as u32));
        }
    }

    for (index, slot) in core.slots.iter().enumerate() {
        let mut state = slot.state.lock();
        if state.device_index.is_some() || state.released {
            continue;
        }

        let backend = default_backend(device_index, core.options.enable_validation)?;
        let info = backend.device_info();
        tracing::info!(
            instance = index,
            device = info.index,
            name = %info.name,
            "acquired compute device"
        );

        let generation = core.next_generation.fetch_add(1, Ordering::Relaxed);
        state.device_index = Some(device_index);
        state.refs = 1;
        state.generation = generation;
        state.unusable = false;
        state.ctx = Some(InstanceContext {
            backend,
            submit_lock: Arc::new(Mutex::new(())),
            instance: InstanceHandle(index as u32),
            generation,
        });
        return Ok(InstanceHandle(index as u32));
    }

    tracing::error!(device_index, "all compute instance slots are in use");
    Err(DispatchError::NoCapacity)
}

/// Decrements the instance's reference count. Dropping the last reference
/// wakes every outstanding waiter with `InstanceReleased`, drains in-flight
/// jobs (bounded by [`limits::MAX_COMPUTE_JOB_TIMEOUT_MS`]) and frees the
/// slot.
pub fn release(handle: InstanceHandle) -> Result<(), DispatchError> {
    let slot = slot(handle)?;
    let mut state = slot.state.lock();
    if state.device_index.is_none() || state.refs == 0 {
        return Err(DispatchError::InvalidArg);
    }

    state.refs -= 1;
    if state.refs > 0 {
        return Ok(());
    }

    state.released = true;
    for event in state.active_events.values() {
        event.set_all();
    }

    let deadline =
        Instant::now() + Duration::from_millis(u64::from(limits::MAX_COMPUTE_JOB_TIMEOUT_MS));
    while state.in_flight > 0 {
        if slot.drained.wait_until(&mut state, deadline).timed_out() {
            tracing::warn!(
                instance = handle.raw(),
                in_flight = state.in_flight,
                "release timed out waiting for active jobs to drain"
            );
            break;
        }
    }

    let device = state.device_index.take();
    state.active_jobs.clear();
    state.active_events.clear();
    state.ctx = None;
    state.released = false;
    state.unusable = false;
    tracing::info!(instance = handle.raw(), device = ?device, "released compute instance");
    Ok(())
}

/// The per-instance descriptor/command pool capacity.
pub fn max_jobs(handle: InstanceHandle) -> Result<u32, DispatchError> {
    let slot = slot(handle)?;
    let state = slot.state.lock();
    if state.device_index.is_none() {
        return Err(DispatchError::InvalidArg);
    }
    Ok(limits::MAX_JOBS)
}

/// Stores the instance's backend context into the job. Must precede the
/// first `submit_job`.
pub fn bind_job(job: &Arc<Job>, handle: InstanceHandle) -> Result<(), DispatchError> {
    let slot = slot(handle)?;
    let ctx = {
        let state = slot.state.lock();
        if state.released {
            return Err(DispatchError::InstanceReleased);
        }
        state.ctx.clone().ok_or(DispatchError::InvalidArg)?
    };

    let mut meta = job.meta.lock();
    meta.ctx = Some(ctx);
    if meta.state == JobState::Created {
        meta.state = JobState::Bound;
    }
    Ok(())
}

/// Submits a job, blocking while the worker queue is full.
pub fn submit_job(job: &Arc<Job>, handle: InstanceHandle) -> Result<JobHandle, DispatchError> {
    submit_impl(job, handle, SubmitMode::Blocking)
}

/// Submits a job, failing with `Busy` when the worker queue is full.
pub fn try_submit_job(job: &Arc<Job>, handle: InstanceHandle) -> Result<JobHandle, DispatchError> {
    submit_impl(job, handle, SubmitMode::NonBlocking)
}

fn submit_impl(
    job: &Arc<Job>,
    handle: InstanceHandle,
    mode: SubmitMode,
) -> Result<JobHandle, DispatchError> {
    let core = core();
    let slot_ref = slot(handle)?;

    let job_handle = {
        let mut state = slot_ref.state.lock();
        if state.device_index.is_none() {
            return Err(DispatchError::InvalidArg);
        }
        if state.released {
            return Err(DispatchError::InstanceReleased);
        }
        if state.unusable {
            tracing::error!(
                instance = handle.raw(),
                "instance is unusable after a device loss"
            );
            return Err(DispatchError::Fail);
        }

        let mut meta = job.meta.lock();
        let ctx = meta.ctx.as_ref().ok_or(DispatchError::InvalidArg)?;
        if ctx.generation != state.generation {
            // Bound to a different instance or an earlier incarnation.
            return Err(DispatchError::InvalidArg);
        }

        // The dispatcher owns handle assignment: dispensed at first
        // submission from a process-wide counter, reused on resubmission.
        let job_handle = *meta
            .handle
            .get_or_insert_with(|| JobHandle(NEXT_JOB_HANDLE.fetch_add(1, Ordering::Relaxed)));
        meta.state = JobState::Queued;
        meta.last_error = None;
        drop(meta);

        state.active_jobs.insert(job_handle.raw(), Arc::downgrade(job));
        state
            .active_events
            .entry(job_handle.raw())
            .or_insert_with(|| Arc::new(Event::new()))
            .reset();
        state.in_flight += 1;
        job_handle
    };

    // The queue send must happen outside the slot lock: workers need the
    // lock to retire jobs, and retiring jobs is what frees queue space.
    let weak = Arc::downgrade(job);
    let invokable = Invokable::new(move |tid| {
        drive_job(&weak, handle, job_handle, tid);
        true
    });

    match core.pool.submit(invokable, mode) {
        Ok(pool_job) => {
            job.meta.lock().pool_job = Some(pool_job);
            Ok(job_handle)
        }
        Err(err) => {
            let mut state = slot_ref.state.lock();
            state.active_jobs.remove(&job_handle.raw());
            state.active_events.remove(&job_handle.raw());
            state.in_flight = state.in_flight.saturating_sub(1);
            drop(state);
            slot_ref.drained.notify_all();
            job.meta.lock().state = JobState::Bound;
            tracing::error!(instance = handle.raw(), ?err, "submit_job failed");
            Err(err.into())
        }
    }
}

/// Blocks the caller on the job's completion event.
///
/// The completion event fires even when a stage failed; callers distinguish
/// success from failure through [`Job::last_error`]. `Timeout` retains the
/// completion entry so the caller may wait again.
pub fn wait_for_job(
    job: JobHandle,
    timeout_ms: u32,
    handle: InstanceHandle,
) -> Result<(), DispatchError> {
    let core = core();
    if core.pool.is_worker_thread() {
        return Err(DispatchError::DeadlockGuard);
    }

    let slot_ref = slot(handle)?;
    let (event, generation) = {
        let state = slot_ref.state.lock();
        if state.device_index.is_none() {
            return Err(DispatchError::InvalidArg);
        }
        if state.released {
            return Err(DispatchError::InstanceReleased);
        }
        let event = state
            .active_events
            .get(&job.raw())
            .cloned()
            .ok_or_else(|| {
                tracing::error!(
                    instance = handle.raw(),
                    job = job.raw(),
                    "wait_for_job: handle is not owned by this instance"
                );
                DispatchError::NotOwned
            })?;
        (event, state.generation)
    };

    event.wait(timeout_ms)?;

    let mut state = slot_ref.state.lock();
    if state.released || state.device_index.is_none() || state.generation != generation {
        return Err(DispatchError::InstanceReleased);
    }
    state.active_events.remove(&job.raw());
    Ok(())
}

/// Live reference count of the shared program for `path` on this instance,
/// `None` once the program is torn down.
#[must_use]
pub fn shader_program_refs(handle: InstanceHandle, path: &Path) -> Option<u32> {
    let slot = slot(handle).ok()?;
    let state = slot.state.lock();
    state.device_index?;
    program::refs_for(handle.raw(), state.generation, path)
}

/// Whether the shared program for `path` currently holds a live pipeline.
#[must_use]
pub fn shader_program_is_built(handle: InstanceHandle, path: &Path) -> bool {
    let Ok(slot) = slot(handle) else {
        return false;
    };
    let state = slot.state.lock();
    if state.device_index.is_none() {
        return false;
    }
    program::built_for(handle.raw(), state.generation, path)
}

/// Drives one run of a job's stage pipeline on a worker thread, then signals
/// completion. Runs the bookkeeping even when the application already
/// dropped the job.
fn drive_job(job: &Weak<Job>, handle: InstanceHandle, job_handle: JobHandle, tid: u32) {
    let Ok(slot_ref) = slot(handle) else {
        return;
    };

    if let Some(job) = job.upgrade() {
        run_stages(&job, slot_ref, job_handle, tid);
    } else {
        tracing::warn!(job = job_handle.raw(), "job dropped before execution");
    }

    let mut state = slot_ref.state.lock();
    state.in_flight = state.in_flight.saturating_sub(1);
    if let Some(event) = state.active_events.get(&job_handle.raw()) {
        event.set();
    }
    drop(state);
    slot_ref.drained.notify_all();
}

fn run_stages(job: &Arc<Job>, slot_ref: &InstanceSlot, job_handle: JobHandle, tid: u32) {
    let Some(ctx) = job.meta.lock().ctx.clone() else {
        return;
    };

    // The stage lock serializes overlapping runs of a resubmitted job.
    let mut stages = job.stages.lock();

    let set_state = |state: JobState| job.meta.lock().state = state;
    let result = (|| -> Result<(), DispatchError> {
        set_state(JobState::Running(JobStage::Init));
        stages.init(&ctx)?;

        set_state(JobState::Running(JobStage::Presubmit));
        stages.presubmit(&ctx)?;

        set_state(JobState::Running(JobStage::Submit));
        {
            // Resource creation is safe from many threads, but queue
            // submission must be serialized per instance.
            let _submit = ctx.submit_lock.lock();
            stages.submit(&ctx)?;
        }

        set_state(JobState::Running(JobStage::Postsubmit));
        stages.postsubmit(&ctx, limits::MAX_COMPUTE_JOB_TIMEOUT_MS)?;
        Ok(())
    })();

    // Slot state strictly before job meta, matching the submit path.
    if matches!(
        result,
        Err(DispatchError::Backend(BackendError::DeviceLost))
    ) {
        slot_ref.state.lock().unusable = true;
    }

    let mut meta = job.meta.lock();
    match result {
        Ok(()) => meta.state = JobState::Completed,
        Err(DispatchError::Timeout) if meta.state == JobState::Running(JobStage::Postsubmit) => {
            // Non-fatal: the fence was not reset, a longer wait may still
            // succeed. The job stays in its running state.
            tracing::warn!(
                tid,
                job = job_handle.raw(),
                timeout_ms = limits::MAX_COMPUTE_JOB_TIMEOUT_MS,
                "fence wait timed out"
            );
            meta.last_error = Some(DispatchError::Timeout);
        }
        Err(err) => {
            tracing::error!(tid, job = job_handle.raw(), ?err, "job stage failed");
            meta.last_error = Some(err);
            meta.state = JobState::Completed;
        }
    }
}

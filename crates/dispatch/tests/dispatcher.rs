//! End-to-end dispatcher scenarios on the host simulation backend.
//!
//! The instance slot table is process-wide, so every test serializes on one
//! mutex and releases whatever it acquired before returning.

use std::mem::size_of;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};
use std::time::Duration;

use dispatch::jobs::mandelbrot::{MandelbrotJob, Pixel, MANDELBROT_SHADER};
use dispatch::jobs::scale::{ScaleJob, SCALE_SHADER};
use dispatch::{
    limits, BackendError, DispatchError, InstanceContext, InstanceHandle, Job, JobHandle,
    JobStages, INFINITE_TIMEOUT,
};
use rand::{Rng, SeedableRng};

static TEST_LOCK: OnceLock<StdMutex<()>> = OnceLock::new();

fn serial() -> MutexGuard<'static, ()> {
    TEST_LOCK
        .get_or_init(|| StdMutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Stage set that only burns wall-clock time; no device resources.
struct SleepJob {
    millis: u64,
}

impl JobStages for SleepJob {
    fn init(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        Ok(())
    }

    fn presubmit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        std::thread::sleep(Duration::from_millis(self.millis));
        Ok(())
    }

    fn submit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        Ok(())
    }

    fn postsubmit(&mut self, _ctx: &InstanceContext, _timeout_ms: u32) -> Result<(), DispatchError> {
        Ok(())
    }
}

fn read_pixel(bytes: &[u8], index: usize) -> Pixel {
    let offset = index * size_of::<Pixel>();
    bytemuck::pod_read_unaligned(&bytes[offset..offset + size_of::<Pixel>()])
}

#[test]
fn single_mandelbrot_job() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let (width, height) = (256u32, 256u32);
    let mandelbrot = MandelbrotJob::new(width, height);
    let output = mandelbrot.output();
    {
        let params = mandelbrot.params();
        let mut params = params.lock();
        params.max_iterations = 128;
        params.enable_gamma_correction = true;
    }

    let job = Job::new(mandelbrot);
    dispatch::bind_job(&job, instance).unwrap();
    let handle = dispatch::submit_job(&job, instance).unwrap();
    dispatch::wait_for_job(handle, INFINITE_TIMEOUT, instance).unwrap();
    assert_eq!(job.last_error(), None);

    {
        let mapped = output.map().unwrap();
        let first = read_pixel(&mapped, 0);
        assert!(
            first.g > 0.0,
            "exterior pixel should have a green component, got {first:?}"
        );

        let center = read_pixel(&mapped, ((height / 2) * width + width / 2) as usize);
        assert_eq!(center.r, 0.0, "set interior should be black, got {center:?}");
        assert_eq!(center.g, 0.0);
        assert_eq!(center.b, 0.0);
    }

    drop(job);
    dispatch::release(instance).unwrap();
}

#[test]
fn saturation_randomized_resubmission() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    let job_count = 40;
    let iterations = 5;
    let jobs: Vec<(Arc<Job>, Arc<parking_lot::Mutex<dispatch::jobs::MandelbrotParams>>)> = (0
        ..job_count)
        .map(|_| {
            let mandelbrot = MandelbrotJob::new(64, 64);
            let params = mandelbrot.params();
            let job = Job::new(mandelbrot);
            dispatch::bind_job(&job, instance).unwrap();
            (job, params)
        })
        .collect();

    for iteration in 0..iterations {
        let handles: Vec<JobHandle> = jobs
            .iter()
            .map(|(job, params)| {
                {
                    let mut params = params.lock();
                    params.max_iterations = rng.gen_range(0..64);
                    params.enable_gamma_correction = iteration % 2 == 1;
                }
                dispatch::submit_job(job, instance).unwrap()
            })
            .collect();

        for (handle, (job, _)) in handles.iter().zip(&jobs) {
            assert_eq!(
                dispatch::wait_for_job(*handle, 60_000, instance),
                Ok(()),
                "iteration {iteration}"
            );
            assert_eq!(job.last_error(), None);
        }
    }

    drop(jobs);
    dispatch::release(instance).unwrap();
}

#[test]
fn resize_mid_life_re_records() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let mandelbrot = MandelbrotJob::new(1, 1);
    let output = mandelbrot.output();
    let job = Job::new(mandelbrot);
    dispatch::bind_job(&job, instance).unwrap();

    let first_handle = dispatch::submit_job(&job, instance).unwrap();
    dispatch::wait_for_job(first_handle, INFINITE_TIMEOUT, instance).unwrap();
    assert_eq!(job.last_error(), None);

    output
        .resize(dispatch::BufferDims::new(640, 480, size_of::<Pixel>()))
        .unwrap();
    assert!(output.size_changed(), "resize must flag the re-record");

    let second_handle = dispatch::submit_job(&job, instance).unwrap();
    assert_eq!(first_handle, second_handle, "resubmission reuses the handle");
    dispatch::wait_for_job(second_handle, INFINITE_TIMEOUT, instance).unwrap();
    assert_eq!(job.last_error(), None);
    assert!(
        !output.size_changed(),
        "presubmit consumes the flag when it re-records"
    );

    {
        let mapped = output.map().unwrap();
        assert_eq!(mapped.len(), 640 * 480 * size_of::<Pixel>());
        let first = read_pixel(&mapped, 0);
        assert!(first.g > 0.0, "re-recorded dispatch covers the new extent");
    }

    drop(job);
    dispatch::release(instance).unwrap();
}

/// Stage set whose body waits on a sibling job, which must be rejected.
struct ReentrantWait {
    instance: InstanceHandle,
    sibling: JobHandle,
    observed: Arc<StdMutex<Option<Result<(), DispatchError>>>>,
}

impl JobStages for ReentrantWait {
    fn init(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        Ok(())
    }

    fn presubmit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        let result = dispatch::wait_for_job(self.sibling, INFINITE_TIMEOUT, self.instance);
        *self.observed.lock().unwrap() = Some(result);
        Ok(())
    }

    fn submit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        Ok(())
    }

    fn postsubmit(&mut self, _ctx: &InstanceContext, _timeout_ms: u32) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[test]
fn worker_reentrancy_guard() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let sibling = Job::new(SleepJob { millis: 100 });
    dispatch::bind_job(&sibling, instance).unwrap();
    let sibling_handle = dispatch::submit_job(&sibling, instance).unwrap();

    let observed = Arc::new(StdMutex::new(None));
    let probe = Job::new(ReentrantWait {
        instance,
        sibling: sibling_handle,
        observed: Arc::clone(&observed),
    });
    dispatch::bind_job(&probe, instance).unwrap();
    let probe_handle = dispatch::submit_job(&probe, instance).unwrap();

    dispatch::wait_for_job(probe_handle, 30_000, instance).unwrap();
    assert_eq!(probe.last_error(), None, "the outer job still completes");
    assert_eq!(
        *observed.lock().unwrap(),
        Some(Err(DispatchError::DeadlockGuard)),
        "the inner wait from a worker thread must fail fast"
    );

    dispatch::wait_for_job(sibling_handle, 30_000, instance).unwrap();
    drop((sibling, probe));
    dispatch::release(instance).unwrap();
}

#[test]
fn release_with_pending_job_interrupts_waiter() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let job = Job::new(SleepJob { millis: 500 });
    dispatch::bind_job(&job, instance).unwrap();
    let handle = dispatch::submit_job(&job, instance).unwrap();

    let waiter = std::thread::spawn(move || dispatch::wait_for_job(handle, 30_000, instance));
    std::thread::sleep(Duration::from_millis(50));

    dispatch::release(instance).unwrap();
    assert_eq!(
        waiter.join().unwrap(),
        Err(DispatchError::InstanceReleased),
        "outstanding waits terminate when the instance goes away"
    );
}

#[test]
fn shader_class_lifecycle() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();
    let shader_a = Path::new(MANDELBROT_SHADER);
    let shader_b = Path::new(SCALE_SHADER);

    let first_a = Job::new(MandelbrotJob::new(32, 32));
    let second_a = Job::new(MandelbrotJob::new(32, 32));
    let job_b = Job::new(ScaleJob::new(16));

    let mut handles = Vec::new();
    for job in [&first_a, &second_a, &job_b] {
        dispatch::bind_job(job, instance).unwrap();
        handles.push(dispatch::submit_job(job, instance).unwrap());
    }
    for handle in handles {
        dispatch::wait_for_job(handle, 30_000, instance).unwrap();
    }

    assert_eq!(dispatch::shader_program_refs(instance, shader_a), Some(2));
    assert_eq!(dispatch::shader_program_refs(instance, shader_b), Some(1));
    assert!(dispatch::shader_program_is_built(instance, shader_a));

    drop(first_a);
    assert_eq!(
        dispatch::shader_program_refs(instance, shader_a),
        Some(1),
        "program A survives while one job remains"
    );
    assert!(dispatch::shader_program_is_built(instance, shader_a));

    drop(second_a);
    assert_eq!(
        dispatch::shader_program_refs(instance, shader_a),
        None,
        "last job tears program A down"
    );
    assert_eq!(dispatch::shader_program_refs(instance, shader_b), Some(1));
    assert!(dispatch::shader_program_is_built(instance, shader_b));

    drop(job_b);
    assert_eq!(dispatch::shader_program_refs(instance, shader_b), None);

    dispatch::release(instance).unwrap();
}

#[test]
fn scale_job_end_to_end() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let scale = ScaleJob::new(8);
    let input = scale.input();
    let output = scale.output();
    *scale.factor().lock() = 3.0;

    let job = Job::new(scale);
    dispatch::bind_job(&job, instance).unwrap();

    // First run allocates; fill the input and run again with real data.
    let handle = dispatch::submit_job(&job, instance).unwrap();
    dispatch::wait_for_job(handle, 30_000, instance).unwrap();

    {
        let mut mapped = input.map().unwrap();
        for (i, chunk) in mapped.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&(i as f32).to_le_bytes());
        }
    }
    dispatch::submit_job(&job, instance).unwrap();
    dispatch::wait_for_job(handle, 30_000, instance).unwrap();
    assert_eq!(job.last_error(), None);

    {
        let mapped = output.map().unwrap();
        for (i, chunk) in mapped.chunks_exact(4).enumerate() {
            let value = f32::from_le_bytes(chunk.try_into().unwrap());
            assert!((value - i as f32 * 3.0).abs() < f32::EPSILON * 8.0, "lane {i}: {value}");
        }
    }

    drop(job);
    dispatch::release(instance).unwrap();
}

#[test]
fn wait_boundaries() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    // Zero timeout returns immediately with Timeout while running, and the
    // completion entry survives for a later wait.
    let job = Job::new(SleepJob { millis: 200 });
    dispatch::bind_job(&job, instance).unwrap();
    let handle = dispatch::submit_job(&job, instance).unwrap();
    assert_eq!(
        dispatch::wait_for_job(handle, 0, instance),
        Err(DispatchError::Timeout)
    );
    assert_eq!(
        dispatch::wait_for_job(handle, 30_000, instance),
        Ok(())
    );

    // A consumed entry is no longer owned.
    assert_eq!(
        dispatch::wait_for_job(handle, 0, instance),
        Err(DispatchError::NotOwned)
    );

    drop(job);
    dispatch::release(instance).unwrap();
}

#[test]
fn wait_on_foreign_instance_is_not_owned() {
    let _serial = serial();
    let first = dispatch::acquire(0).unwrap();
    let second = dispatch::acquire(1).unwrap();

    let job = Job::new(SleepJob { millis: 50 });
    dispatch::bind_job(&job, first).unwrap();
    let handle = dispatch::submit_job(&job, first).unwrap();

    assert_eq!(
        dispatch::wait_for_job(handle, 1000, second),
        Err(DispatchError::NotOwned),
        "job handles are scoped to their owning instance"
    );
    dispatch::wait_for_job(handle, 30_000, first).unwrap();

    drop(job);
    dispatch::release(first).unwrap();
    dispatch::release(second).unwrap();
}

#[test]
fn resubmission_reuses_handle_and_completes_twice() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let job = Job::new(SleepJob { millis: 10 });
    dispatch::bind_job(&job, instance).unwrap();

    let first = dispatch::submit_job(&job, instance).unwrap();
    dispatch::wait_for_job(first, 30_000, instance).unwrap();

    let second = dispatch::submit_job(&job, instance).unwrap();
    assert_eq!(first, second);
    dispatch::wait_for_job(second, 30_000, instance).unwrap();

    drop(job);
    dispatch::release(instance).unwrap();
}

#[test]
fn acquire_release_acquire_cycles() {
    let _serial = serial();

    let first = dispatch::acquire(0).unwrap();
    assert_eq!(dispatch::max_jobs(first), Ok(limits::MAX_JOBS));
    dispatch::release(first).unwrap();

    let second = dispatch::acquire(0).unwrap();
    assert_eq!(dispatch::max_jobs(second), Ok(limits::MAX_JOBS));
    dispatch::release(second).unwrap();
}

#[test]
fn acquire_fails_with_no_capacity() {
    let _serial = serial();

    // Same device is refcounted, not a new slot.
    let shared_a = dispatch::acquire(7).unwrap();
    let shared_b = dispatch::acquire(7).unwrap();
    assert_eq!(shared_a, shared_b);

    let other = dispatch::acquire(8).unwrap();
    assert_eq!(dispatch::acquire(9), Err(DispatchError::NoCapacity));

    dispatch::release(shared_a).unwrap();
    dispatch::release(shared_b).unwrap();
    dispatch::release(other).unwrap();
}

#[test]
fn submit_without_bind_is_invalid() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let job = Job::new(SleepJob { millis: 1 });
    assert_eq!(
        dispatch::submit_job(&job, instance),
        Err(DispatchError::InvalidArg)
    );

    dispatch::release(instance).unwrap();
}

/// Stage set that reports a lost device from its presubmit stage.
struct DeviceLossJob;

impl JobStages for DeviceLossJob {
    fn init(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        Ok(())
    }

    fn presubmit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        Err(DispatchError::Backend(BackendError::DeviceLost))
    }

    fn submit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        Ok(())
    }

    fn postsubmit(&mut self, _ctx: &InstanceContext, _timeout_ms: u32) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[test]
fn device_loss_marks_instance_unusable() {
    let _serial = serial();
    let instance = dispatch::acquire(0).unwrap();

    let doomed = Job::new(DeviceLossJob);
    dispatch::bind_job(&doomed, instance).unwrap();
    let handle = dispatch::submit_job(&doomed, instance).unwrap();

    // The completion event still fires; the error rides on the job.
    dispatch::wait_for_job(handle, 30_000, instance).unwrap();
    assert_eq!(
        doomed.last_error(),
        Some(DispatchError::Backend(BackendError::DeviceLost))
    );

    let next = Job::new(SleepJob { millis: 1 });
    dispatch::bind_job(&next, instance).unwrap();
    assert_eq!(
        dispatch::submit_job(&next, instance),
        Err(DispatchError::Fail),
        "an instance stays unusable after a device loss"
    );

    drop((doomed, next));
    dispatch::release(instance).unwrap();
}

//! Job implementation
//!
//! A [`Job`] drives I/O against one range of one device. It owns its task
//! pool, its counters, the outstanding-slot bitmap used by verify workloads
//! and its run/reset deadlines. Nothing in a job is shared: every entry point
//! takes `&mut self` and is called from the job's own execution context (see
//! [`context`]), either for a message from the controller, a backend event or
//! an expired deadline.
//!
//! # Task cycle
//!
//! ```text
//! Free -> InFlight(stage) [-> IoWait(step) -> InFlight(stage)]* -> completion -> Free or resubmit
//! ```
//!
//! A verify cycle is a pattern write followed by a read-back of the same slot
//! and a byte-exact comparison. With zero-copy enabled, writes go through a
//! leased backend buffer and reads through a populated lease.
//!
//! # Accounting
//!
//! The in-flight count is raised once per task cycle when the backend first
//! accepts work for it, and lowered once when the cycle ends. Tasks parked on
//! an io-wait registration are tracked separately so a draining job only
//! finishes once nothing is outstanding at the backend.

pub mod affinity;
pub mod context;
pub mod reactor;
pub mod task;

use crate::bdev::{
    BdevDescriptor, BdevEvent, BdevIo, BlockDevice, DifType, EventSink, Geometry, IoChannel,
    IoRequest, IoTag, IoType, RejectReason, Rejected,
};
use crate::config::JobOptions;
use crate::coordinator::ControlEvent;
use crate::distribution::{self, Distribution};
use crate::error::{FailureCode, PerfError, PerfResult};
use crate::stats::{JobCounters, JobIdentity, JobReport, SampleWindow};
use crate::util::bitmap::SlotBitmap;
use crate::util::verification::{
    copy_data, generate_data, verify_data, BlockLayout, Region, VerificationResult,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use std::time::Duration;
use task::{task_count, IoStage, RetryStep, TaskPool, TaskState};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Interval between injected resets
pub const RESET_PERIOD: Duration = Duration::from_secs(10);

/// Where and how a job runs
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Index of the job in the controller's job list
    pub id: usize,
    pub name: String,
    /// Execution context the job lives on
    pub core: usize,
    pub device: Arc<dyn BlockDevice>,
    pub options: JobOptions,
    /// First block of the job's range
    pub offset_blocks: u64,
    /// Length of the job's range in blocks, 0 for the whole device
    pub length_blocks: u64,
    /// Seed for the job's generators; `None` seeds from entropy
    pub seed: Option<u64>,
}

/// A job's line back to the controller
#[derive(Debug, Clone)]
pub struct Notifier {
    job: usize,
    control: UnboundedSender<ControlEvent>,
}

impl Notifier {
    pub fn new(job: usize, control: UnboundedSender<ControlEvent>) -> Self {
        Notifier { job, control }
    }

    fn send(&self, event: ControlEvent) {
        // A closed controller means the process is already tearing down.
        let _ = self.control.send(event);
    }

    pub fn constructed(&self, result: Result<(), FailureCode>) {
        self.send(ControlEvent::Constructed {
            job: self.job,
            result,
        });
    }

    fn failure(&self, code: FailureCode) {
        self.send(ControlEvent::Failure { job: self.job, code });
    }

    fn job_end(&self) {
        self.send(ControlEvent::JobEnd { job: self.job });
    }
}

/// One worker driving I/O against a range of a device
#[derive(Debug)]
pub struct Job {
    id: usize,
    name: String,
    core: usize,
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    options: JobOptions,
    zcopy: bool,
    /// Compare metadata on read-back (only without protection information)
    md_check: bool,
    io_size_blocks: u64,
    size_in_ios: u64,
    ios_base: u64,
    /// Slots with an I/O outstanding; verify workloads only
    outstanding: Option<SlotBitmap>,
    distribution: Box<dyn Distribution>,
    rng: Xoshiro256PlusPlus,
    tasks: TaskPool,
    // Declared before the descriptor so the channel is released first.
    channel: Option<Box<dyn IoChannel>>,
    descriptor: Option<Box<dyn BdevDescriptor>>,
    counters: JobCounters,
    in_flight: usize,
    waiting: usize,
    started: bool,
    draining: bool,
    finished: bool,
    run_deadline: Option<Instant>,
    reset_deadline: Option<Instant>,
    notifier: Notifier,
}

fn construction_error(spec: &JobSpec, code: FailureCode, reason: impl Into<String>) -> PerfError {
    PerfError::Construction {
        device: spec.device.name().to_string(),
        code,
        reason: reason.into(),
    }
}

impl Job {
    /// Size the job for its device and allocate its task pool
    ///
    /// # Errors
    ///
    /// Returns [`PerfError::Construction`] when the I/O size is not a multiple
    /// of the data block size (`-ENOTSUP`), the device cannot unmap for an
    /// unmap workload (`-ENOTSUP`), or the range holds too few slots
    /// (`-EINVAL`).
    pub fn new(spec: JobSpec, notifier: Notifier) -> PerfResult<Job> {
        let geometry = spec.device.geometry();
        let options = spec.options.clone();
        let data_block_size = geometry.data_block_size() as usize;

        if data_block_size == 0 || options.io_size % data_block_size != 0 {
            error!(
                device = %spec.device.name(),
                io_size = options.io_size,
                data_block_size,
                "IO size is not a multiple of data block size"
            );
            return Err(construction_error(
                &spec,
                FailureCode::not_supported(),
                format!(
                    "IO size ({}) is not a multiple of data block size of bdev {}",
                    options.io_size,
                    spec.device.name()
                ),
            ));
        }
        if options.unmap && !spec.device.io_type_supported(IoType::Unmap) {
            warn!(device = %spec.device.name(), "Skipping, it does not support unmap");
            return Err(construction_error(
                &spec,
                FailureCode::not_supported(),
                "device does not support unmap",
            ));
        }

        let io_size_blocks = (options.io_size / data_block_size) as u64;
        let buf_size = io_size_blocks as usize * geometry.block_size as usize;
        let size_in_ios = if spec.length_blocks == 0 {
            geometry.num_blocks / io_size_blocks
        } else {
            spec.length_blocks / io_size_blocks
        };
        let ios_base = spec.offset_blocks / io_size_blocks;

        if size_in_ios == 0 || (options.verify && size_in_ios < options.queue_depth as u64) {
            return Err(construction_error(
                &spec,
                FailureCode::invalid(),
                format!(
                    "range of {} I/Os cannot sustain queue depth {}",
                    size_in_ios, options.queue_depth
                ),
            ));
        }

        let md_len = if geometry.md_separate() {
            io_size_blocks as usize * geometry.md_size as usize
        } else {
            0
        };
        let tasks = TaskPool::new(
            task_count(options.queue_depth, options.reset, options.abort),
            buf_size,
            md_len,
            geometry.buf_align,
        );

        let rng = match spec.seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed ^ 0x5eed_0f_da7a),
            None => Xoshiro256PlusPlus::from_entropy(),
        };

        debug!(
            job = %spec.name,
            core = spec.core,
            io_size_blocks,
            size_in_ios,
            ios_base,
            tasks = tasks.len(),
            "job constructed"
        );

        Ok(Job {
            id: spec.id,
            zcopy: options.zcopy && spec.device.io_type_supported(IoType::Zcopy),
            md_check: geometry.dif_type == DifType::Disabled,
            outstanding: options.verify.then(|| SlotBitmap::new(size_in_ios)),
            distribution: distribution::for_job(options.random, spec.seed),
            name: spec.name,
            core: spec.core,
            device: spec.device,
            geometry,
            options,
            io_size_blocks,
            size_in_ios,
            ios_base,
            rng,
            tasks,
            channel: None,
            descriptor: None,
            counters: JobCounters::default(),
            in_flight: 0,
            waiting: 0,
            started: false,
            draining: false,
            finished: false,
            run_deadline: None,
            reset_deadline: None,
            notifier,
        })
    }

    /// Open the device and take an I/O channel
    ///
    /// Must be called on the job's own context; every backend event for the
    /// job is delivered to `events`.
    pub fn open(&mut self, events: EventSink) -> Result<(), FailureCode> {
        let descriptor = self.device.open(events).map_err(|code| {
            error!(device = %self.device.name(), %code, "Could not open leaf bdev");
            FailureCode::invalid()
        })?;
        let channel = descriptor.io_channel().ok_or_else(|| {
            error!(device = %self.device.name(), "Could not get io_channel");
            FailureCode::no_memory()
        })?;
        self.descriptor = Some(descriptor);
        self.channel = Some(channel);
        Ok(())
    }

    /// Start the run: arm deadlines and seed one request per queue slot
    pub fn start(&mut self, run_time: Duration) {
        let now = Instant::now();
        self.started = true;
        if !self.draining {
            self.run_deadline = Some(now + run_time);
            if self.options.reset {
                self.reset_deadline = Some(now + RESET_PERIOD);
            }
        }
        if let (Some(timeout), Some(channel)) = (self.options.timeout, self.channel.as_mut()) {
            channel.set_timeout(timeout);
        }

        for _ in 0..self.options.queue_depth {
            if self.draining {
                break;
            }
            let tag = self.tasks.acquire();
            self.submit_single(tag);
        }
        self.check_finished();
    }

    /// Stop issuing new I/O; idempotent
    pub fn drain(&mut self) {
        self.begin_drain();
        self.check_finished();
    }

    /// The run deadline passed
    pub fn on_run_timer(&mut self) {
        self.run_deadline = None;
        self.drain();
    }

    /// The reset deadline passed: issue a device reset from the reserve task
    pub fn on_reset_timer(&mut self) {
        self.reset_deadline = None;
        if !self.draining {
            let tag = self.tasks.acquire();
            self.tasks[tag].io_type = IoType::Reset;
            self.submit_reset(tag);
        }
        self.check_finished();
    }

    /// Dispatch one backend event
    pub fn handle_event(&mut self, event: BdevEvent) {
        match event {
            BdevEvent::Complete(io) => self.on_completion(io),
            BdevEvent::IoWaitReady(tag) => self.on_io_wait_ready(tag),
            BdevEvent::Timeout(tag) => self.on_timeout(tag),
            BdevEvent::Removed => {
                warn!(job = %self.name, "device removed, draining job");
                self.begin_drain();
            }
        }
        self.check_finished();
    }

    /// This job's report row for a statistics walk
    pub fn report(&mut self, window: &SampleWindow) -> JobReport {
        let identity = JobIdentity {
            name: self.name.clone(),
            core: self.core,
        };
        self.counters.report(identity, self.options.io_size, window)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn counters(&self) -> &JobCounters {
        &self.counters
    }

    /// Tasks handed to the backend or parked on an io-wait registration
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Tasks parked on an io-wait registration, a subset of [`Job::in_flight`]
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Drained with nothing outstanding; channel and descriptor released
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn size_in_ios(&self) -> u64 {
        self.size_in_ios
    }

    pub fn io_size_blocks(&self) -> u64 {
        self.io_size_blocks
    }

    /// Number of slots marked outstanding (verify workloads)
    pub fn outstanding_slots(&self) -> Option<u64> {
        self.outstanding.as_ref().map(SlotBitmap::count_ones)
    }

    /// Upper bound on the in-flight count: one per queue slot plus the
    /// reset and abort reserves
    pub fn max_in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn run_deadline(&self) -> Option<Instant> {
        self.run_deadline
    }

    pub fn reset_deadline(&self) -> Option<Instant> {
        self.reset_deadline
    }

    fn verify_cycle(&self) -> bool {
        self.options.verify || self.options.reset
    }

    fn layout(&self) -> BlockLayout {
        BlockLayout {
            block_size: self.geometry.block_size as usize,
            md_size: self.geometry.md_size as usize,
            num_blocks: self.io_size_blocks as usize,
        }
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        debug!(job = %self.name, in_flight = self.in_flight, "draining job");
        self.draining = true;
        self.run_deadline = None;
        self.reset_deadline = None;
    }

    fn record_failure(&self, code: FailureCode) {
        self.notifier.failure(code);
    }

    fn check_finished(&mut self) {
        if !self.started || !self.draining || self.finished {
            return;
        }
        if self.in_flight > 0 || self.waiting > 0 {
            return;
        }
        self.finished = true;
        self.channel = None;
        self.descriptor = None;
        debug!(
            job = %self.name,
            completed = self.counters.io_completed,
            failed = self.counters.io_failed,
            "job finished"
        );
        self.notifier.job_end();
    }

    fn count(&mut self, tag: IoTag) {
        let task = &mut self.tasks[tag];
        if !task.counted {
            task.counted = true;
            self.in_flight += 1;
        }
    }

    fn uncount(&mut self, tag: IoTag) {
        let task = &mut self.tasks[tag];
        if task.counted {
            task.counted = false;
            self.in_flight -= 1;
        }
    }

    /// Pick the next slot; verify workloads skip slots still outstanding
    ///
    /// The skip is a linear scan, so with a queue depth close to the number
    /// of slots a submission may walk most of the range.
    fn next_slot(&mut self) -> u64 {
        if self.options.random {
            return self.distribution.next_slot(self.size_in_ios);
        }
        let mut slot = self.distribution.next_slot(self.size_in_ios);
        if let Some(outstanding) = self.outstanding.as_mut() {
            debug_assert!(outstanding.first_clear().is_some());
            while outstanding.get(slot) {
                slot = self.distribution.next_slot(self.size_in_ios);
            }
            outstanding.set(slot);
        }
        slot
    }

    fn clear_slot(&mut self, offset_blocks: u64) {
        if let Some(outstanding) = self.outstanding.as_mut() {
            let slot = offset_blocks / self.io_size_blocks - self.ios_base;
            debug_assert!(outstanding.get(slot));
            outstanding.clear(slot);
        }
    }

    /// Whether a task holds a slot in the outstanding bitmap
    fn holds_slot(&self, tag: IoTag) -> bool {
        self.outstanding.is_some() && !matches!(self.tasks[tag].io_type, IoType::Abort | IoType::Reset)
    }

    /// Start a fresh request on `tag`
    fn submit_single(&mut self, tag: IoTag) {
        let slot = self.next_slot();
        let offset_blocks = (slot + self.ios_base) * self.io_size_blocks;
        self.tasks[tag].offset_blocks = offset_blocks;

        let rw = self.options.rw_percentage;
        if self.verify_cycle() {
            let seed: u8 = self.rng.gen();
            let layout = self.layout();
            if let Some(buffers) = self.tasks[tag].buffers.as_mut() {
                let (data, md) = buffers.split_mut();
                generate_data(data, md, layout, seed);
            }
            self.tasks[tag].io_type = IoType::Write;
            if self.zcopy {
                self.prep_zcopy_write(tag);
                return;
            }
        } else if self.options.flush {
            self.tasks[tag].io_type = IoType::Flush;
        } else if self.options.unmap {
            self.tasks[tag].io_type = IoType::Unmap;
        } else if self.options.write_zeroes {
            self.tasks[tag].io_type = IoType::WriteZeroes;
        } else if rw == 100 || (rw != 0 && self.rng.gen_range(0..100u8) < rw) {
            self.tasks[tag].io_type = IoType::Read;
        } else {
            self.tasks[tag].io_type = IoType::Write;
            if self.zcopy {
                self.prep_zcopy_write(tag);
                return;
            }
        }
        self.submit_task(tag);
    }

    /// Lease a backend buffer for a zero-copy write
    fn prep_zcopy_write(&mut self, tag: IoTag) {
        let offset_blocks = self.tasks[tag].offset_blocks;
        let result = match self.channel.as_mut() {
            Some(channel) => channel.zcopy_start(tag, offset_blocks, self.io_size_blocks, false),
            None => Err(RejectReason::Failed(FailureCode::no_device())),
        };
        match result {
            Ok(()) => {
                self.count(tag);
                self.tasks[tag].state = TaskState::InFlight(IoStage::ZcopyAcquire);
            }
            Err(RejectReason::NoMem) => self.io_wait(tag, RetryStep::ZcopyAcquire),
            Err(RejectReason::Failed(code)) => self.fail_submission(tag, code),
        }
    }

    /// Issue the task's current I/O type
    fn submit_task(&mut self, tag: IoTag) {
        let (io_type, offset_blocks, abort_target) = {
            let task = &self.tasks[tag];
            (task.io_type, task.offset_blocks, task.abort_target)
        };
        let num_blocks = self.io_size_blocks;

        match io_type {
            IoType::Write => {
                if self.geometry.md_size != 0 && !self.geometry.dif_check.is_empty() {
                    if let Err(code) = self.generate_dif(tag) {
                        error!(job = %self.name, offset_blocks, %code, "Generation of DIF/DIX failed");
                        self.fail_submission(tag, code);
                        return;
                    }
                }
                if self.zcopy {
                    let lease = self.tasks[tag].lease.take();
                    match (lease, self.channel.as_mut()) {
                        (Some(lease), Some(channel)) => {
                            channel.zcopy_end(lease, true);
                            self.count(tag);
                            self.tasks[tag].state = TaskState::InFlight(IoStage::ZcopyCommit);
                        }
                        _ => self.fail_submission(tag, FailureCode::invalid()),
                    }
                    return;
                }
                let stage = if self.verify_cycle() {
                    IoStage::VerifyWrite
                } else {
                    IoStage::Io(IoType::Write)
                };
                let mut request = IoRequest::new(tag, IoType::Write, offset_blocks, num_blocks);
                request.buffers = self.tasks[tag].buffers.take();
                self.submit_request(tag, request, stage, RetryStep::Submit);
            }
            IoType::Read if self.zcopy => {
                let result = match self.channel.as_mut() {
                    Some(channel) => channel.zcopy_start(tag, offset_blocks, num_blocks, true),
                    None => Err(RejectReason::Failed(FailureCode::no_device())),
                };
                match result {
                    Ok(()) => {
                        self.count(tag);
                        self.tasks[tag].state = TaskState::InFlight(IoStage::ZcopyPopulate);
                    }
                    Err(RejectReason::NoMem) => self.io_wait(tag, RetryStep::Submit),
                    Err(RejectReason::Failed(code)) => self.fail_submission(tag, code),
                }
            }
            IoType::Read => {
                let mut request = IoRequest::new(tag, IoType::Read, offset_blocks, num_blocks);
                request.buffers = self.tasks[tag].buffers.take();
                self.submit_request(tag, request, IoStage::Io(IoType::Read), RetryStep::Submit);
            }
            io_type @ (IoType::Flush | IoType::Unmap | IoType::WriteZeroes) => {
                let request = IoRequest::new(tag, io_type, offset_blocks, num_blocks);
                self.submit_request(tag, request, IoStage::Io(io_type), RetryStep::Submit);
            }
            IoType::Abort => {
                let mut request = IoRequest::new(tag, IoType::Abort, 0, 0);
                request.abort_target = abort_target;
                self.submit_request(tag, request, IoStage::Abort, RetryStep::Submit);
            }
            IoType::Reset => self.submit_reset(tag),
            IoType::Zcopy => self.fail_submission(tag, FailureCode::invalid()),
        }
    }

    fn submit_reset(&mut self, tag: IoTag) {
        let request = IoRequest::new(tag, IoType::Reset, 0, 0);
        self.submit_request(tag, request, IoStage::Reset, RetryStep::Reset);
    }

    /// Read back a slot just written by a verify cycle into a backend buffer
    fn submit_verify_read(&mut self, tag: IoTag) {
        let request = IoRequest::new(tag, IoType::Read, self.tasks[tag].offset_blocks, self.io_size_blocks);
        self.submit_request(tag, request, IoStage::VerifyRead, RetryStep::VerifyRead);
    }

    fn submit_request(&mut self, tag: IoTag, request: IoRequest, stage: IoStage, retry: RetryStep) {
        let result = match self.channel.as_mut() {
            Some(channel) => channel.submit(request),
            None => Err(Rejected::new(RejectReason::Failed(FailureCode::no_device()), request)),
        };
        match result {
            Ok(()) => {
                self.count(tag);
                self.tasks[tag].state = TaskState::InFlight(stage);
            }
            Err(Rejected { reason, request }) => {
                let task = &mut self.tasks[tag];
                if task.buffers.is_none() {
                    task.buffers = request.buffers;
                }
                match reason {
                    RejectReason::NoMem => self.io_wait(tag, retry),
                    RejectReason::Failed(code) => {
                        if stage == IoStage::Reset {
                            error!(job = %self.name, %code, "Reset failed");
                            self.fail_submission(tag, FailureCode::GENERIC);
                        } else {
                            self.fail_submission(tag, code);
                        }
                    }
                }
            }
        }
    }

    fn generate_dif(&mut self, tag: IoTag) -> Result<(), FailureCode> {
        let task = &mut self.tasks[tag];
        let offset_blocks = task.offset_blocks;
        let buffers = if self.zcopy {
            task.lease.as_mut().and_then(|lease| lease.buffers.as_mut())
        } else {
            task.buffers.as_mut()
        };
        match buffers {
            Some(buffers) => {
                let (data, md) = buffers.split_mut();
                self.device.generate_dif(
                    data,
                    md,
                    offset_blocks,
                    self.io_size_blocks,
                    self.geometry.dif_check,
                )
            }
            None => Err(FailureCode::invalid()),
        }
    }

    /// Park a task until the backend signals free resources
    ///
    /// A parked task stays in flight: it may still hold a verify slot.
    fn io_wait(&mut self, tag: IoTag, step: RetryStep) {
        if matches!(self.tasks[tag].state, TaskState::IoWait(_)) {
            return;
        }
        self.count(tag);
        self.tasks[tag].state = TaskState::IoWait(step);
        self.waiting += 1;
        if let Some(channel) = self.channel.as_mut() {
            channel.queue_io_wait(tag);
        }
    }

    /// A submission failed hard: give the task back and stop the job
    fn fail_submission(&mut self, tag: IoTag, code: FailureCode) {
        let offset_blocks = self.tasks[tag].offset_blocks;
        error!(
            job = %self.name,
            offset_blocks,
            io_type = ?self.tasks[tag].io_type,
            %code,
            "Failed to submit bdev_io"
        );
        self.abandon(tag);
        self.begin_drain();
        self.record_failure(code);
    }

    /// Return a task to the pool without completing it
    fn abandon(&mut self, tag: IoTag) {
        if self.holds_slot(tag) {
            self.clear_slot(self.tasks[tag].offset_blocks);
        }
        self.uncount(tag);
        self.tasks.release(tag);
    }

    fn on_io_wait_ready(&mut self, tag: IoTag) {
        let step = match self.tasks.get(tag).map(|task| task.state) {
            Some(TaskState::IoWait(step)) => step,
            other => {
                warn!(job = %self.name, tag = tag.0, state = ?other, "unexpected io wait signal");
                return;
            }
        };
        self.waiting -= 1;
        self.tasks[tag].state = TaskState::Free;

        if self.draining {
            self.abandon(tag);
            return;
        }
        match step {
            RetryStep::Submit => self.submit_task(tag),
            RetryStep::VerifyRead => self.submit_verify_read(tag),
            RetryStep::ZcopyAcquire => self.prep_zcopy_write(tag),
            RetryStep::Reset => self.submit_reset(tag),
        }
    }

    fn on_timeout(&mut self, target: IoTag) {
        self.counters.io_timeout += 1;
        if self.draining || !self.options.abort || !self.device.io_type_supported(IoType::Abort) {
            return;
        }
        let tag = self.tasks.acquire();
        let task = &mut self.tasks[tag];
        task.io_type = IoType::Abort;
        task.abort_target = Some(target);
        self.submit_task(tag);
    }

    fn on_completion(&mut self, mut io: BdevIo) {
        let tag = io.tag;
        let stage = match self.tasks.get(tag).map(|task| task.state) {
            Some(TaskState::InFlight(stage)) => stage,
            other => {
                warn!(job = %self.name, tag = tag.0, state = ?other, "unexpected completion");
                return;
            }
        };
        let task = &mut self.tasks[tag];
        if task.buffers.is_none() {
            task.buffers = io.buffers.take();
        }

        match stage {
            IoStage::VerifyWrite | IoStage::ZcopyCommit if io.success && self.verify_cycle() => {
                self.submit_verify_read(tag)
            }
            IoStage::ZcopyAcquire => self.zcopy_acquired(tag, io),
            IoStage::ZcopyPopulate if io.success => match self.channel.as_mut() {
                Some(channel) => {
                    self.tasks[tag].state = TaskState::InFlight(IoStage::ZcopyRelease);
                    channel.zcopy_end(io, false);
                }
                None => {
                    io.success = false;
                    self.complete(tag, stage, io);
                }
            },
            IoStage::Abort => self.abort_complete(tag, io.success),
            IoStage::Reset => self.reset_complete(tag, io.success),
            _ => self.complete(tag, stage, io),
        }
    }

    fn zcopy_acquired(&mut self, tag: IoTag, mut lease: BdevIo) {
        if !lease.success {
            error!(job = %self.name, offset_blocks = lease.offset_blocks, "zero-copy buffer lease failed");
            self.abandon(tag);
            self.begin_drain();
            self.record_failure(FailureCode::GENERIC);
            return;
        }

        if self.verify_cycle() {
            // The write has to come from backend memory, so stage the
            // generated pattern into the lease.
            let layout = self.layout();
            let task = &self.tasks[tag];
            let copied = match (lease.buffers.as_mut(), task.buffers.as_ref()) {
                (Some(dst), Some(src)) => {
                    let (dst_data, dst_md) = dst.split_mut();
                    copy_data(dst_data, dst_md, src.data.as_slice(), src.md_slice(), layout)
                }
                _ => false,
            };
            if !copied {
                error!(job = %self.name, "zero-copy lease does not match the task layout");
                self.abandon(tag);
                self.begin_drain();
                self.record_failure(FailureCode::invalid());
                return;
            }
        }

        let task = &mut self.tasks[tag];
        task.io_type = IoType::Write;
        task.lease = Some(lease);
        self.submit_task(tag);
    }

    /// End of an ordinary I/O cycle
    fn complete(&mut self, tag: IoTag, stage: IoStage, io: BdevIo) {
        let offset_blocks = self.tasks[tag].offset_blocks;
        let mut success = io.success;

        if !io.success {
            if !self.options.reset && !self.options.continue_on_failure {
                self.begin_drain();
                self.record_failure(FailureCode::GENERIC);
                error!(job = %self.name, offset_blocks, "task offset: {} on job bdev={} fails", offset_blocks, self.name);
            }
        } else if stage == IoStage::VerifyRead {
            if let VerificationResult::Failure { block, region, offset, expected, actual } = self.verify(tag, &io) {
                error!(
                    job = %self.name,
                    offset_blocks,
                    block,
                    ?region,
                    offset,
                    "Buffer mismatch! Target: {} Disk Offset: {}, first dword expected {:#x} got {:#x}",
                    self.name,
                    offset_blocks,
                    expected,
                    actual
                );
                self.begin_drain();
                self.record_failure(FailureCode::GENERIC);
                success = false;
            }
        }

        self.uncount(tag);
        if success {
            self.counters.io_completed += 1;
        } else {
            self.counters.io_failed += 1;
        }
        if self.holds_slot(tag) {
            self.clear_slot(offset_blocks);
        }

        if self.draining {
            self.tasks.release(tag);
        } else {
            self.tasks[tag].state = TaskState::Free;
            self.submit_single(tag);
        }
    }

    fn verify(&self, tag: IoTag, io: &BdevIo) -> VerificationResult {
        let layout = self.layout();
        match (self.tasks[tag].buffers.as_ref(), io.buffers.as_ref()) {
            (Some(written), Some(read)) => verify_data(
                written.data.as_slice(),
                written.md_slice(),
                read.data.as_slice(),
                read.md_slice(),
                layout,
                self.md_check,
            ),
            _ => VerificationResult::Failure {
                block: 0,
                region: Region::Data,
                offset: 0,
                expected: 0,
                actual: 0,
            },
        }
    }

    fn abort_complete(&mut self, tag: IoTag, success: bool) {
        self.uncount(tag);
        if success {
            self.counters.io_completed += 1;
        } else {
            self.counters.io_failed += 1;
            if !self.options.continue_on_failure {
                self.begin_drain();
                self.record_failure(FailureCode::GENERIC);
            }
        }
        // Aborts are issued on demand, never resubmitted.
        self.tasks.release(tag);
    }

    fn reset_complete(&mut self, tag: IoTag, success: bool) {
        self.uncount(tag);
        if !success {
            error!(job = %self.name, device = %self.device.name(), "Reset blockdev failed");
            self.begin_drain();
            self.record_failure(FailureCode::GENERIC);
        }
        self.tasks.release(tag);
        if !self.draining {
            self.reset_deadline = Some(Instant::now() + RESET_PERIOD);
        }
    }
}

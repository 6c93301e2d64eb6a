//! Lifecycle controller
//!
//! The controller is an actor running on the first execution context. It
//! builds jobs, starts them, collects their failure and completion notices,
//! drives live and final statistics walks, and answers control requests.
//! All run state lives in a per-run [`RunState`], so a new control request
//! always starts from a clean slate.
//!
//! ```text
//! CONSTRUCTING -> RUNNING -> DRAINING -> DONE [-> CONSTRUCTING ...]
//! ```
//!
//! Every job reports back with [`ControlEvent`]s; the controller never
//! touches job state directly.

use crate::bdev::{BdevRegistry, BlockDevice};
use crate::config::RunConfig;
use crate::error::{FailureCode, PerfError};
use crate::output::{self, OutputFormat};
use crate::stats::aggregator::{AggregateStats, StatsWalk, WalkKind};
use crate::stats::SampleWindow;
use crate::util::time::as_usec;
use crate::worker::context::{spawn_job, JobHandle, JobMessage};
use crate::worker::{JobSpec, Notifier};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Reply channel of a control request
pub type TestsReply = oneshot::Sender<std::result::Result<(), PerfError>>;

/// Messages handled by the controller
#[derive(Debug)]
pub enum ControlEvent {
    /// Control request: construct and run the configured jobs
    PerformTests(TestsReply),
    /// A job finished (or failed) opening its device
    Constructed {
        job: usize,
        result: std::result::Result<(), FailureCode>,
    },
    /// A job recorded a failure; the first one of a run is its result
    Failure { job: usize, code: FailureCode },
    /// A job drained and released its device
    JobEnd { job: usize },
    /// Live report period elapsed
    PerfTick,
    /// A statistics walk visited every job
    DumpDone(Box<StatsWalk>),
    /// External shutdown
    Shutdown,
}

/// Result of the last run the controller completed
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// First failure recorded, `None` on success
    pub result: Option<FailureCode>,
    /// Final statistics; absent when no job ever ran
    pub stats: Option<AggregateStats>,
}

impl RunOutcome {
    pub fn exit_status(&self) -> u8 {
        self.result.map_or(0, FailureCode::exit_status)
    }
}

/// Sending side used by the control surface and the signal handler
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: UnboundedSender<ControlEvent>,
}

impl ControlHandle {
    /// Run the configured jobs and wait for the outcome
    ///
    /// # Errors
    ///
    /// [`PerfError::InProgress`] while another run is pending, or
    /// [`PerfError::RunFailed`] with the run's first failure code.
    pub async fn perform_tests(&self) -> std::result::Result<(), PerfError> {
        let (reply, response) = oneshot::channel();
        if self.tx.send(ControlEvent::PerformTests(reply)).is_err() {
            return Err(PerfError::RunFailed(FailureCode::GENERIC));
        }
        response
            .await
            .unwrap_or(Err(PerfError::RunFailed(FailureCode::GENERIC)))
    }

    /// Drain every job and stop; repeated calls are harmless
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlEvent::Shutdown);
    }
}

/// State of one run, from construction to the final report
#[derive(Debug)]
struct RunState {
    jobs: Vec<JobHandle>,
    ended: Vec<bool>,
    construct_pending: usize,
    construct_rc: Option<FailureCode>,
    running_jobs: usize,
    rc: Option<FailureCode>,
    started_at: Option<Instant>,
    /// Actual elapsed time when a shutdown cut the run short
    shutdown_elapsed: Option<Duration>,
    io_time_usec: u64,
    dump_active: bool,
    final_pending: bool,
    period_num: u64,
    ticker: Option<JoinHandle<()>>,
    request: Option<TestsReply>,
}

impl RunState {
    fn new(request: Option<TestsReply>) -> Self {
        RunState {
            jobs: Vec::new(),
            ended: Vec::new(),
            construct_pending: 0,
            construct_rc: None,
            running_jobs: 0,
            rc: None,
            started_at: None,
            shutdown_elapsed: None,
            io_time_usec: 0,
            dump_active: false,
            final_pending: false,
            period_num: 0,
            ticker: None,
            request,
        }
    }

    fn record_failure(&mut self, code: FailureCode) {
        if self.rc.is_none() {
            self.rc = Some(code);
        }
    }
}

/// Whether the controller should keep serving after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// The lifecycle controller actor
#[derive(Debug)]
pub struct Controller {
    config: RunConfig,
    registry: BdevRegistry,
    contexts: Vec<Handle>,
    format: OutputFormat,
    tx: UnboundedSender<ControlEvent>,
    rx: UnboundedReceiver<ControlEvent>,
    run: Option<RunState>,
    shutdown: bool,
    last: RunOutcome,
}

impl Controller {
    /// Controller placing jobs on `contexts`, plus the handle to drive it
    pub fn new(
        config: RunConfig,
        registry: BdevRegistry,
        contexts: Vec<Handle>,
        format: OutputFormat,
    ) -> Result<(Controller, ControlHandle)> {
        if contexts.is_empty() {
            anyhow::bail!("controller needs at least one execution context");
        }
        let (tx, rx) = unbounded_channel();
        let handle = ControlHandle { tx: tx.clone() };
        Ok((
            Controller {
                config,
                registry,
                contexts,
                format,
                tx,
                rx,
                run: None,
                shutdown: false,
                last: RunOutcome::default(),
            },
            handle,
        ))
    }

    /// Serve until the run ends, or in wait-for-tests mode until shutdown
    pub async fn run(mut self) -> RunOutcome {
        if self.config.wait_for_tests {
            info!("waiting for perform_tests request");
        } else if self.begin(None) == Flow::Exit {
            return self.last;
        }

        while let Some(event) = self.rx.recv().await {
            if self.handle_event(event) == Flow::Exit {
                break;
            }
        }
        self.last
    }

    fn handle_event(&mut self, event: ControlEvent) -> Flow {
        match event {
            ControlEvent::PerformTests(reply) => self.begin(Some(reply)),
            ControlEvent::Constructed { job, result } => self.constructed(job, result),
            ControlEvent::Failure { job, code } => {
                debug!(job, %code, "job reported failure");
                if let Some(run) = self.run.as_mut() {
                    run.record_failure(code);
                }
                Flow::Continue
            }
            ControlEvent::JobEnd { job } => self.job_end(job),
            ControlEvent::PerfTick => {
                self.periodic_dump();
                Flow::Continue
            }
            ControlEvent::DumpDone(walk) => self.dump_done(walk),
            ControlEvent::Shutdown => self.begin_shutdown(),
        }
    }

    fn targets(&self) -> std::result::Result<Vec<Arc<dyn BlockDevice>>, PerfError> {
        match &self.config.target {
            Some(name) => self
                .registry
                .get_by_name(name)
                .map(|device| vec![device])
                .ok_or_else(|| PerfError::DeviceNotFound(name.clone())),
            None if self.registry.is_empty() => Err(PerfError::DeviceNotFound("(none configured)".into())),
            None => Ok(self.registry.devices().cloned().collect()),
        }
    }

    /// Split the targets into job specs
    ///
    /// One job per device round-robin over the contexts, or in multithread
    /// mode one job per device per context on an even slice of the device.
    fn job_specs(&self, devices: Vec<Arc<dyn BlockDevice>>) -> std::result::Result<Vec<JobSpec>, PerfError> {
        let contexts = self.contexts.len();
        let mut specs = Vec::new();
        let mut next_context = 0;

        for device in devices {
            let placements: Vec<(usize, u64, u64)> = if self.config.multithread {
                let blocks_per_job = device.geometry().num_blocks / contexts as u64;
                if blocks_per_job == 0 {
                    return Err(PerfError::Construction {
                        device: device.name().to_string(),
                        code: FailureCode::invalid(),
                        reason: format!("too few blocks to split across {} contexts", contexts),
                    });
                }
                (0..contexts)
                    .map(|core| (core, core as u64 * blocks_per_job, blocks_per_job))
                    .collect()
            } else {
                let core = next_context;
                next_context = (next_context + 1) % contexts;
                vec![(core, 0, 0)]
            };

            for (core, offset_blocks, length_blocks) in placements {
                let id = specs.len();
                specs.push(JobSpec {
                    id,
                    name: device.name().to_string(),
                    core,
                    device: Arc::clone(&device),
                    options: self.config.job.clone(),
                    offset_blocks,
                    length_blocks,
                    seed: self.config.seed.map(|seed| seed.wrapping_add(id as u64)),
                });
            }
        }
        Ok(specs)
    }

    /// Start constructing a run, unless one is already pending
    fn begin(&mut self, request: Option<TestsReply>) -> Flow {
        if self.run.is_some() {
            warn!("perform_tests rejected: a test is already in progress");
            if let Some(reply) = request {
                let _ = reply.send(Err(PerfError::InProgress));
            }
            return Flow::Continue;
        }
        if self.shutdown {
            if let Some(reply) = request {
                let _ = reply.send(Err(PerfError::RunFailed(FailureCode::GENERIC)));
            }
            return Flow::Exit;
        }

        let mut run = RunState::new(request);
        let specs = match self.targets().and_then(|devices| self.job_specs(devices)) {
            Ok(specs) => specs,
            Err(err) => {
                error!("{}", err);
                run.record_failure(err.code());
                self.run = Some(run);
                return self.finish(None);
            }
        };

        run.construct_pending = specs.len();
        run.ended = vec![false; specs.len()];
        for spec in specs {
            let notifier = Notifier::new(spec.id, self.tx.clone());
            let context = &self.contexts[spec.core];
            run.jobs.push(spawn_job(spec, notifier, context));
        }
        debug!(jobs = run.jobs.len(), "constructing jobs");
        self.run = Some(run);
        Flow::Continue
    }

    fn constructed(&mut self, job: usize, result: std::result::Result<(), FailureCode>) -> Flow {
        let Some(run) = self.run.as_mut() else {
            return Flow::Continue;
        };
        if let Err(code) = result {
            error!(job, %code, "job construction failed");
            if run.construct_rc.is_none() {
                run.construct_rc = Some(code);
            }
        }
        run.construct_pending = run.construct_pending.saturating_sub(1);
        if run.construct_pending > 0 {
            return Flow::Continue;
        }

        if let Some(code) = run.construct_rc {
            error!("bdevperf construction failed, aborting the run");
            run.record_failure(code);
            // Dropping the handles closes every mailbox; constructed jobs
            // release their devices as their contexts exit.
            run.jobs.clear();
            return self.finish(None);
        }
        self.start_jobs();
        Flow::Continue
    }

    fn start_jobs(&mut self) {
        let run_time = self.config.run_time;
        let show_period = self.config.show_period;
        let shutdown = self.shutdown;
        let tx = self.tx.clone();
        let Some(run) = self.run.as_mut() else {
            return;
        };

        info!("Running I/O for {} seconds...", run_time.as_secs());
        run.started_at = Some(Instant::now());
        run.running_jobs = run.jobs.len();
        for job in &run.jobs {
            job.send(JobMessage::Run { duration: run_time });
        }

        if let Some(period) = show_period {
            run.ticker = Some(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.send(ControlEvent::PerfTick).is_err() {
                        break;
                    }
                }
            }));
        }

        if shutdown {
            run.shutdown_elapsed = Some(Duration::ZERO);
            for job in &run.jobs {
                job.send(JobMessage::Drain);
            }
        }
    }

    fn job_end(&mut self, job: usize) -> Flow {
        let Some(run) = self.run.as_mut() else {
            return Flow::Continue;
        };
        match run.ended.get_mut(job) {
            Some(ended) if !*ended => *ended = true,
            _ => return Flow::Continue,
        }
        run.running_jobs = run.running_jobs.saturating_sub(1);
        debug!(job, running = run.running_jobs, "job ended");
        if run.running_jobs == 0 {
            self.test_done();
        }
        Flow::Continue
    }

    fn periodic_dump(&mut self) {
        let Some(period) = self.config.show_period else {
            return;
        };
        let ema_period = self.config.ema_period;
        let tx = self.tx.clone();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.dump_active || run.final_pending || run.running_jobs == 0 {
            debug!("dropping live report tick");
            return;
        }

        run.period_num += 1;
        run.dump_active = true;
        let period_usec = as_usec(period);
        let window = SampleWindow {
            io_time_usec: run.period_num * period_usec,
            ema_period,
            period_usec,
        };
        StatsWalk::new(WalkKind::Periodic, window, run.jobs.clone(), tx).forward();
    }

    /// Every job has drained
    fn test_done(&mut self) {
        let run_time = self.config.run_time;
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if let Some(ticker) = run.ticker.take() {
            ticker.abort();
        }

        run.io_time_usec = match run.shutdown_elapsed {
            Some(elapsed) => {
                println!(
                    "Received shutdown signal, test time was about {:.6} seconds",
                    elapsed.as_secs_f64()
                );
                as_usec(elapsed)
            }
            None => as_usec(run_time),
        };

        if run.dump_active {
            run.final_pending = true;
        } else {
            self.final_dump();
        }
    }

    fn final_dump(&mut self) {
        let tx = self.tx.clone();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.final_pending = false;
        run.dump_active = true;
        let window = SampleWindow {
            io_time_usec: run.io_time_usec,
            ema_period: 0,
            period_usec: 0,
        };
        StatsWalk::new(WalkKind::Final, window, run.jobs.clone(), tx).forward();
    }

    fn dump_done(&mut self, walk: Box<StatsWalk>) -> Flow {
        let Some(run) = self.run.as_mut() else {
            return Flow::Continue;
        };
        run.dump_active = false;
        match walk.kind {
            WalkKind::Periodic => {
                output::print_periodic(&walk.stats);
                if run.final_pending {
                    self.final_dump();
                }
                Flow::Continue
            }
            WalkKind::Final => self.finish(Some(walk.stats)),
        }
    }

    /// Report the run and either reply to its request or stop
    fn finish(&mut self, stats: Option<AggregateStats>) -> Flow {
        let Some(mut run) = self.run.take() else {
            return Flow::Continue;
        };
        if let Some(ticker) = run.ticker.take() {
            ticker.abort();
        }

        let result = run.rc;
        if let Some(stats) = &stats {
            if let Err(err) = output::print_final(self.format, stats, result) {
                warn!("failed to print report: {:#}", err);
            }
        }
        if let Some(code) = result {
            error!("bdevperf failed with error {}", code);
        }
        self.last = RunOutcome { result, stats };

        match run.request.take() {
            Some(reply) => {
                let _ = reply.send(match result {
                    None => Ok(()),
                    Some(code) => Err(PerfError::RunFailed(code)),
                });
                if self.shutdown {
                    Flow::Exit
                } else {
                    Flow::Continue
                }
            }
            None => Flow::Exit,
        }
    }

    fn begin_shutdown(&mut self) -> Flow {
        if self.shutdown {
            return Flow::Continue;
        }
        self.shutdown = true;
        let Some(run) = self.run.as_mut() else {
            return Flow::Exit;
        };
        if let Some(started_at) = run.started_at {
            if run.shutdown_elapsed.is_none() {
                run.shutdown_elapsed = Some(started_at.elapsed());
            }
            for job in &run.jobs {
                job.send(JobMessage::Drain);
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::malloc::{MallocBdev, MallocOptions};
    use crate::config::{JobOptions, WorkloadType};

    fn registry(devices: &[&MallocBdev]) -> BdevRegistry {
        let mut registry = BdevRegistry::new();
        for dev in devices {
            registry.register(Arc::new((*dev).clone()));
        }
        registry
    }

    fn config(workload: WorkloadType, run_time: Duration) -> RunConfig {
        let mut job = JobOptions::new(workload, 512, 4);
        job.zcopy = false;
        let mut config = RunConfig::new(job, run_time);
        config.seed = Some(3);
        config
    }

    async fn run_to_end(config: RunConfig, registry: BdevRegistry, contexts: usize) -> RunOutcome {
        let contexts = vec![Handle::current(); contexts];
        let (controller, _handle) = Controller::new(config, registry, contexts, OutputFormat::Text).unwrap();
        tokio::time::timeout(Duration::from_secs(10), controller.run())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_others() {
        let bad = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        let good = MallocBdev::new(MallocOptions::new("Malloc1", 256, 512));
        bad.fail_next_completions(1);

        let outcome = run_to_end(
            config(WorkloadType::RandRead, Duration::from_millis(100)),
            registry(&[&bad, &good]),
            1,
        )
        .await;

        assert_eq!(outcome.result, Some(FailureCode::GENERIC));
        assert_eq!(outcome.exit_status(), 1);
        let stats = outcome.stats.unwrap();
        assert_eq!(stats.jobs.len(), 2);
        assert_eq!(stats.jobs[0].name, "Malloc0");
        assert!(stats.jobs[0].failed_per_second > 0.0);
        assert!(stats.jobs[1].io_per_second > 0.0);
        assert_eq!(stats.jobs[1].failed_per_second, 0.0);
        assert!(good.submitted_count() > bad.submitted_count());
        assert_eq!(stats.window.io_time_usec, 100_000);
        assert_eq!(good.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        let mut config = config(WorkloadType::Verify, Duration::from_millis(50));
        config.show_period = Some(Duration::from_millis(10));
        config.ema_period = 2;

        let outcome = run_to_end(config, registry(&[&dev]), 1).await;
        assert_eq!(outcome.result, None);
        assert_eq!(outcome.exit_status(), 0);
        assert!(outcome.stats.unwrap().total_io_per_second > 0.0);
        assert_eq!(dev.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn test_missing_target() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        let mut config = config(WorkloadType::Read, Duration::from_millis(50));
        config.target = Some("Nvme0n1".into());

        let outcome = run_to_end(config, registry(&[&dev]), 1).await;
        assert_eq!(outcome.result, Some(FailureCode::no_device()));
        assert!(outcome.stats.is_none());
        assert_eq!(dev.submitted_count(), 0);
    }

    #[tokio::test]
    async fn test_construction_failure_aborts_run() {
        let ok = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        let wide = MallocBdev::new(MallocOptions::new("Malloc1", 256, 4096));

        let outcome = run_to_end(
            config(WorkloadType::Write, Duration::from_millis(50)),
            registry(&[&ok, &wide]),
            1,
        )
        .await;
        assert_eq!(outcome.result, Some(FailureCode::not_supported()));
        assert!(outcome.stats.is_none());
        assert_eq!(ok.submitted_count(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ok.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn test_multithread_slices_device() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 64, 512).record_operations(true));
        let mut config = config(WorkloadType::Write, Duration::from_millis(30));
        config.multithread = true;
        config.job.queue_depth = 1;

        let outcome = run_to_end(config, registry(&[&dev]), 2).await;
        assert_eq!(outcome.result, None);
        let stats = outcome.stats.unwrap();
        assert_eq!(stats.jobs.len(), 2);
        assert_eq!((stats.jobs[0].core, stats.jobs[1].core), (0, 1));

        let ops = dev.submitted_operations();
        let first = ops.iter().find(|op| op.offset_blocks >= 32);
        assert!(first.is_some());
        assert!(ops.iter().all(|op| op.offset_blocks < 64));
    }

    #[tokio::test]
    async fn test_shutdown_uses_elapsed_time() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        let config = config(WorkloadType::RandWrite, Duration::from_secs(60));
        let (controller, handle) =
            Controller::new(config, registry(&[&dev]), vec![Handle::current()], OutputFormat::Text).unwrap();
        let task = tokio::spawn(controller.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        handle.shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.result, None);
        let io_time = outcome.stats.unwrap().window.io_time_usec;
        assert!(io_time > 0 && io_time < 60_000_000);
    }

    #[tokio::test]
    async fn test_control_requests() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        let mut config = config(WorkloadType::RandRead, Duration::from_millis(30));
        config.wait_for_tests = true;
        let (controller, handle) =
            Controller::new(config, registry(&[&dev]), vec![Handle::current()], OutputFormat::Json).unwrap();
        let task = tokio::spawn(controller.run());

        let (first, second) = tokio::join!(handle.perform_tests(), handle.perform_tests());
        assert!(first.is_ok());
        assert!(matches!(second, Err(PerfError::InProgress)));

        // the failure of one run does not leak into the next
        dev.fail_next_completions(1);
        let failed = handle.perform_tests().await;
        assert_eq!(failed.unwrap_err().code(), FailureCode::GENERIC);
        assert!(handle.perform_tests().await.is_ok());

        handle.shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.result, None);
    }
}

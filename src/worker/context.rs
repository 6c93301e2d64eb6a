//! Per-job execution context
//!
//! Each job runs as one task on its reactor. The task owns the [`Job`] and
//! multiplexes three sources: the mailbox fed by the controller and by
//! statistics walks, the backend event queue, and the job's run and reset
//! deadlines. Everything reaches the job through this loop, so the job state
//! has a single writer.

use super::{Job, JobSpec, Notifier};
use crate::stats::aggregator::{StatsWalk, WalkKind};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

/// Messages posted to a job's context
#[derive(Debug)]
pub enum JobMessage {
    /// Start issuing I/O for `duration`
    Run { duration: Duration },
    /// Stop issuing I/O and finish once nothing is outstanding
    Drain,
    /// A statistics walk arriving at this job
    Visit(Box<StatsWalk>),
}

/// Address of a job's context
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: usize,
    pub name: String,
    pub core: usize,
    tx: UnboundedSender<JobMessage>,
}

impl JobHandle {
    pub fn new(id: usize, name: String, core: usize, tx: UnboundedSender<JobMessage>) -> Self {
        JobHandle { id, name, core, tx }
    }

    /// Post a message; false when the context has already exited
    pub fn send(&self, message: JobMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Hand a walk to this job, or give it back if the job is gone
    pub fn visit(&self, walk: Box<StatsWalk>) -> Result<(), Box<StatsWalk>> {
        match self.tx.send(JobMessage::Visit(walk)) {
            Ok(()) => Ok(()),
            Err(SendError(JobMessage::Visit(walk))) => Err(walk),
            Err(SendError(other)) => unreachable!("sent a visit, got back {:?}", other),
        }
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Spawn a job on `runtime`
///
/// The job is built and its device opened on the target context; the
/// outcome is posted to the controller as a construction result. The context
/// exits after the job is visited by the final statistics walk, releasing
/// whatever the job still holds.
pub fn spawn_job(spec: JobSpec, notifier: Notifier, runtime: &Handle) -> JobHandle {
    let (tx, mailbox) = unbounded_channel();
    let handle = JobHandle::new(spec.id, spec.name.clone(), spec.core, tx);
    runtime.spawn(run_job(spec, notifier, mailbox));
    handle
}

async fn run_job(spec: JobSpec, notifier: Notifier, mut mailbox: UnboundedReceiver<JobMessage>) {
    let mut job = match Job::new(spec, notifier.clone()) {
        Ok(job) => job,
        Err(err) => {
            error!("{}", err);
            notifier.constructed(Err(err.code()));
            return;
        }
    };
    let (events_tx, mut events) = unbounded_channel();
    if let Err(code) = job.open(events_tx) {
        notifier.constructed(Err(code));
        return;
    }
    notifier.constructed(Ok(()));

    loop {
        tokio::select! {
            message = mailbox.recv() => match message {
                Some(JobMessage::Run { duration }) => job.start(duration),
                Some(JobMessage::Drain) => job.drain(),
                Some(JobMessage::Visit(mut walk)) => {
                    let window = walk.stats.window;
                    walk.stats.accumulate(job.report(&window));
                    let last = walk.kind == WalkKind::Final;
                    walk.forward();
                    if last {
                        break;
                    }
                }
                None => break,
            },
            Some(event) = events.recv() => job.handle_event(event),
            _ = deadline(job.run_deadline()) => job.on_run_timer(),
            _ = deadline(job.reset_deadline()) => job.on_reset_timer(),
        }
    }
    debug!(job = %job.name(), core = job.core(), "job context exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::malloc::{MallocBdev, MallocOptions};
    use crate::config::{JobOptions, WorkloadType};
    use crate::coordinator::ControlEvent;
    use crate::stats::SampleWindow;
    use std::sync::Arc;

    fn spec(dev: &MallocBdev, workload: WorkloadType) -> JobSpec {
        JobSpec {
            id: 0,
            name: "Malloc0".into(),
            core: 0,
            device: Arc::new(dev.clone()),
            options: JobOptions::new(workload, 512, 2),
            offset_blocks: 0,
            length_blocks: 0,
            seed: Some(7),
        }
    }

    #[tokio::test]
    async fn test_job_runs_until_deadline() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        let (control_tx, mut control) = unbounded_channel();
        let handle = spawn_job(
            spec(&dev, WorkloadType::RandRead),
            Notifier::new(0, control_tx.clone()),
            &Handle::current(),
        );

        match control.recv().await {
            Some(ControlEvent::Constructed { job: 0, result: Ok(()) }) => {}
            other => panic!("Expected construction, got {:?}", other),
        }
        assert!(handle.send(JobMessage::Run {
            duration: Duration::from_millis(50)
        }));
        match control.recv().await {
            Some(ControlEvent::JobEnd { job: 0 }) => {}
            other => panic!("Expected job end, got {:?}", other),
        }
        assert!(dev.submitted_count() > 2);
        assert_eq!(dev.open_channels(), 0);

        let window = SampleWindow {
            io_time_usec: 50_000,
            ema_period: 0,
            period_usec: 0,
        };
        StatsWalk::new(WalkKind::Final, window, vec![handle.clone()], control_tx).forward();
        match control.recv().await {
            Some(ControlEvent::DumpDone(walk)) => {
                assert_eq!(walk.stats.jobs.len(), 1);
                assert!(walk.stats.total_io_per_second > 0.0);
            }
            other => panic!("Expected dump, got {:?}", other),
        }
        // the context is gone after the final visit
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.send(JobMessage::Drain));
    }

    #[tokio::test]
    async fn test_construction_failure_is_reported() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 256, 512));
        dev.set_fail_channel(true);
        let (control_tx, mut control) = unbounded_channel();
        let handle = spawn_job(
            spec(&dev, WorkloadType::Write),
            Notifier::new(0, control_tx),
            &Handle::current(),
        );
        match control.recv().await {
            Some(ControlEvent::Constructed { result: Err(code), .. }) => {
                assert_eq!(code, crate::error::FailureCode::no_memory())
            }
            other => panic!("Expected construction failure, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.send(JobMessage::Drain));
        assert_eq!(dev.open_descriptors(), 0);
    }
}

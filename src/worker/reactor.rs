//! Execution contexts
//!
//! A reactor is a dedicated OS thread driving a current-thread tokio runtime.
//! Jobs and the controller are spawned onto reactors through their runtime
//! [`Handle`]s; a task never migrates, so everything a job touches stays on
//! one thread.

use super::affinity::{pin_current_thread, warn_if_oversubscribed};
use crate::Result;
use anyhow::Context;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug)]
struct Reactor {
    core: usize,
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// One reactor per configured core
#[derive(Debug)]
pub struct ReactorPool {
    reactors: Vec<Reactor>,
}

impl ReactorPool {
    /// Start a reactor thread for each entry of `cores`
    ///
    /// With `pin`, each thread binds itself to its core; a refused binding is
    /// logged and the reactor runs unpinned.
    pub fn new(cores: &[usize], pin: bool) -> Result<Self> {
        if cores.is_empty() {
            anyhow::bail!("at least one core is required");
        }
        warn_if_oversubscribed(cores.len());

        let mut reactors = Vec::with_capacity(cores.len());
        for (index, &core) in cores.iter().enumerate() {
            let (ready_tx, ready_rx) = mpsc::channel();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            let thread = thread::Builder::new()
                .name(format!("reactor_{}", index))
                .spawn(move || {
                    if pin {
                        if let Err(err) = pin_current_thread(core) {
                            warn!(core, "{:#}", err);
                        }
                    }
                    let runtime = match Builder::new_current_thread().enable_all().build() {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(runtime.handle().clone()));
                    debug!(core, "reactor started");
                    // Dropping a closed stop channel also ends the reactor.
                    let _ = runtime.block_on(stop_rx);
                    debug!(core, "reactor stopped");
                })
                .with_context(|| format!("Failed to spawn reactor thread for core {}", core))?;

            let handle = ready_rx
                .recv()
                .context("reactor thread exited during startup")?
                .with_context(|| format!("Failed to build runtime for core {}", core))?;
            reactors.push(Reactor {
                core,
                handle,
                stop: Some(stop_tx),
                thread: Some(thread),
            });
        }
        Ok(ReactorPool { reactors })
    }

    /// Runtime of reactor `index`
    pub fn handle(&self, index: usize) -> Option<&Handle> {
        self.reactors.get(index).map(|reactor| &reactor.handle)
    }

    /// CPU id reactor `index` was started for
    pub fn core(&self, index: usize) -> Option<usize> {
        self.reactors.get(index).map(|reactor| reactor.core)
    }

    /// Runtime handles in reactor order
    pub fn handles(&self) -> Vec<Handle> {
        self.reactors.iter().map(|reactor| reactor.handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// Stop every reactor and join its thread
    ///
    /// Tasks still spawned on a reactor are dropped with its runtime.
    pub fn shutdown(&mut self) {
        for reactor in &mut self.reactors {
            if let Some(stop) = reactor.stop.take() {
                let _ = stop.send(());
            }
        }
        for reactor in &mut self.reactors {
            if let Some(thread) = reactor.thread.take() {
                if thread.join().is_err() {
                    warn!(core = reactor.core, "reactor thread panicked");
                }
            }
        }
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

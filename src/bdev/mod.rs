//! Block device backend contract
//!
//! This module defines what the load generator needs from a storage backend.
//! A backend exposes devices ([`BlockDevice`]); a job opens a device to get a
//! [`BdevDescriptor`], and takes one [`IoChannel`] from it to submit I/O.
//!
//! # Completion model
//!
//! Submission never completes inline. Every completion, io-wait availability
//! signal, per-I/O timeout and hot-remove notification is delivered as a
//! [`BdevEvent`] on the [`EventSink`] handed to [`BlockDevice::open`]. The job
//! owns the receiving side and drains it on its own execution context, so job
//! state is only ever touched by one writer.
//!
//! # Buffer ownership
//!
//! Task buffers are moved into an [`IoRequest`] and handed back inside the
//! completing [`BdevIo`]. A rejected submission returns the whole request in
//! [`Rejected`]. Zero-copy leases and reads issued without buffers complete
//! with backend-owned buffers in [`BdevIo::buffers`].

pub mod malloc;

use crate::error::FailureCode;
use crate::util::buffer::IoBuffers;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Identifies a task within its job; echoed back in every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoTag(pub usize);

/// Kind of block I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    Read,
    Write,
    Flush,
    Unmap,
    WriteZeroes,
    Reset,
    Abort,
    /// Zero-copy buffer leasing
    Zcopy,
}

/// Protection information type of a formatted device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifType {
    #[default]
    Disabled,
    Type1,
    Type2,
    Type3,
}

/// Which protection fields are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DifCheckFlags {
    pub reftag: bool,
    pub guard: bool,
}

impl DifCheckFlags {
    pub fn is_empty(&self) -> bool {
        !self.reftag && !self.guard
    }
}

/// Static shape of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per block, including metadata when it is interleaved
    pub block_size: u32,
    pub num_blocks: u64,
    /// Metadata bytes per block
    pub md_size: u32,
    pub md_interleaved: bool,
    pub dif_type: DifType,
    /// Protection fields the device checks
    pub dif_check: DifCheckFlags,
    /// Required buffer alignment in bytes
    pub buf_align: usize,
}

impl Geometry {
    /// Bytes of user data per block
    pub fn data_block_size(&self) -> u32 {
        if self.md_interleaved {
            self.block_size - self.md_size
        } else {
            self.block_size
        }
    }

    /// True when metadata lives in a buffer of its own
    pub fn md_separate(&self) -> bool {
        self.md_size > 0 && !self.md_interleaved
    }
}

/// A request handed to [`IoChannel::submit`]
#[derive(Debug)]
pub struct IoRequest {
    pub tag: IoTag,
    pub io_type: IoType,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    /// Caller buffers for reads and writes; `None` on a read asks the
    /// backend to provide the buffer
    pub buffers: Option<IoBuffers>,
    /// The in-flight I/O an ABORT is aimed at
    pub abort_target: Option<IoTag>,
}

impl IoRequest {
    pub fn new(tag: IoTag, io_type: IoType, offset_blocks: u64, num_blocks: u64) -> Self {
        IoRequest {
            tag,
            io_type,
            offset_blocks,
            num_blocks,
            buffers: None,
            abort_target: None,
        }
    }

    pub fn with_buffers(mut self, buffers: IoBuffers) -> Self {
        self.buffers = Some(buffers);
        self
    }
}

/// Why a submission was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Transient resource exhaustion; retry after an io-wait signal
    NoMem,
    /// Hard failure with an errno-style code
    Failed(FailureCode),
}

/// A refused submission, carrying the request back to its owner
#[derive(Debug)]
pub struct Rejected {
    pub reason: RejectReason,
    pub request: IoRequest,
}

impl Rejected {
    pub fn new(reason: RejectReason, request: IoRequest) -> Self {
        Rejected { reason, request }
    }
}

/// A finished (or leased) backend I/O
#[derive(Debug)]
pub struct BdevIo {
    pub tag: IoTag,
    pub io_type: IoType,
    pub success: bool,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    /// Caller buffers handed back, or backend-owned buffers for leases and
    /// reads issued without buffers
    pub buffers: Option<IoBuffers>,
    /// Whether the backend populated `buffers` from the device for a lease
    pub populated: bool,
}

impl BdevIo {
    /// Build a completion for `request`, returning its buffers
    pub fn complete(request: IoRequest, success: bool) -> Self {
        BdevIo {
            tag: request.tag,
            io_type: request.io_type,
            success,
            offset_blocks: request.offset_blocks,
            num_blocks: request.num_blocks,
            buffers: request.buffers,
            populated: false,
        }
    }
}

/// Notification from a backend to the job that opened the device
#[derive(Debug)]
pub enum BdevEvent {
    /// An I/O, lease or lease end finished
    Complete(BdevIo),
    /// Resources are available again for a task parked with
    /// [`IoChannel::queue_io_wait`]
    IoWaitReady(IoTag),
    /// An in-flight I/O exceeded the timeout set with [`IoChannel::set_timeout`]
    Timeout(IoTag),
    /// The device went away
    Removed,
}

/// Sending half of a job's backend event queue
pub type EventSink = UnboundedSender<BdevEvent>;

/// A storage device exposed by a backend
pub trait BlockDevice: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn geometry(&self) -> Geometry;

    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// Open the device for read/write
    ///
    /// All events for channels taken from the returned descriptor are sent
    /// to `events`.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure code if the device cannot be opened.
    fn open(&self, events: EventSink) -> Result<Box<dyn BdevDescriptor>, FailureCode>;

    /// Compute protection information for `num_blocks` blocks starting at
    /// `offset_blocks`, in place
    ///
    /// `md` is the separate metadata buffer, or `None` for interleaved
    /// metadata inside `data`.
    fn generate_dif(
        &self,
        data: &mut [u8],
        md: Option<&mut [u8]>,
        offset_blocks: u64,
        num_blocks: u64,
        flags: DifCheckFlags,
    ) -> Result<(), FailureCode>;
}

/// An open handle on a device; closing happens on drop
pub trait BdevDescriptor: Send + fmt::Debug {
    /// Acquire an I/O channel, released on drop
    fn io_channel(&self) -> Option<Box<dyn IoChannel>>;
}

/// Submission path of one job to one device
pub trait IoChannel: Send + fmt::Debug {
    /// Submit a read, write, flush, unmap, write-zeroes, reset or abort
    ///
    /// # Errors
    ///
    /// Hands the request back with [`RejectReason::NoMem`] on transient
    /// exhaustion, or [`RejectReason::Failed`] otherwise.
    fn submit(&mut self, request: IoRequest) -> Result<(), Rejected>;

    /// Lease a backend buffer for `num_blocks` at `offset_blocks`
    ///
    /// With `populate` the buffer is filled from the device first. The
    /// lease arrives as a [`BdevEvent::Complete`] whose buffers belong to the
    /// backend.
    fn zcopy_start(
        &mut self,
        tag: IoTag,
        offset_blocks: u64,
        num_blocks: u64,
        populate: bool,
    ) -> Result<(), RejectReason>;

    /// End a lease; with `commit` the leased buffer is written to the device
    fn zcopy_end(&mut self, lease: BdevIo, commit: bool);

    /// Ask for a [`BdevEvent::IoWaitReady`] once resources free up
    fn queue_io_wait(&mut self, tag: IoTag);

    /// Report I/O outstanding longer than `timeout` with
    /// [`BdevEvent::Timeout`]
    fn set_timeout(&mut self, timeout: Duration);
}

/// The set of devices visible to a run
#[derive(Debug, Default, Clone)]
pub struct BdevRegistry {
    devices: Vec<Arc<dyn BlockDevice>>,
    by_name: HashMap<String, usize>,
}

impl BdevRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; a later device with the same name replaces the
    /// earlier one
    pub fn register(&mut self, device: Arc<dyn BlockDevice>) {
        let name = device.name().to_string();
        match self.by_name.get(&name) {
            Some(&idx) => self.devices[idx] = device,
            None => {
                self.by_name.insert(name, self.devices.len());
                self.devices.push(device);
            }
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.by_name.get(name).map(|&idx| Arc::clone(&self.devices[idx]))
    }

    /// All devices in registration order
    pub fn devices(&self) -> impl Iterator<Item = &Arc<dyn BlockDevice>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::malloc::{MallocBdev, MallocOptions};

    #[test]
    fn test_geometry_interleaved() {
        let geometry = Geometry {
            block_size: 520,
            num_blocks: 16,
            md_size: 8,
            md_interleaved: true,
            dif_type: DifType::Disabled,
            dif_check: DifCheckFlags::default(),
            buf_align: 4096,
        };
        assert_eq!(geometry.data_block_size(), 512);
        assert!(!geometry.md_separate());
    }

    #[test]
    fn test_geometry_separate() {
        let geometry = Geometry {
            block_size: 512,
            num_blocks: 16,
            md_size: 16,
            md_interleaved: false,
            dif_type: DifType::Type1,
            dif_check: DifCheckFlags { reftag: true, guard: true },
            buf_align: 4096,
        };
        assert_eq!(geometry.data_block_size(), 512);
        assert!(geometry.md_separate());
        assert!(!geometry.dif_check.is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = BdevRegistry::new();
        registry.register(Arc::new(MallocBdev::new(MallocOptions::new("Malloc0", 64, 512))));
        registry.register(Arc::new(MallocBdev::new(MallocOptions::new("Malloc1", 64, 512))));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_by_name("Malloc1").unwrap().name(), "Malloc1");
        assert!(registry.get_by_name("Nvme0n1").is_none());
        let names: Vec<_> = registry.devices().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["Malloc0", "Malloc1"]);
    }

    #[test]
    fn test_registry_replaces_same_name() {
        let mut registry = BdevRegistry::new();
        registry.register(Arc::new(MallocBdev::new(MallocOptions::new("Malloc0", 64, 512))));
        registry.register(Arc::new(MallocBdev::new(MallocOptions::new("Malloc0", 128, 512))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_by_name("Malloc0").unwrap().geometry().num_blocks, 128);
    }
}

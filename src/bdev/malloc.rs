//! RAM-backed block device
//!
//! `MallocBdev` keeps its blocks in memory and completes every request
//! immediately by posting an event to the opening job. It is the device used
//! by the command line tool and by the tests, so it also carries a fault
//! injector that can drive every error path of the dispatcher on demand:
//!
//! - transient exhaustion (`NoMem`) on the next N submissions
//! - a hard submission failure with a chosen code
//! - failed completions, corrupted reads
//! - stalled I/O that raises a timeout and is completed by an ABORT
//! - held completions, released on demand
//! - open/channel failures and hot removal
//!
//! # Example
//!
//! ```
//! use bdevperf::bdev::malloc::{MallocBdev, MallocOptions};
//! use bdevperf::bdev::BlockDevice;
//!
//! let dev = MallocBdev::new(MallocOptions::new("Malloc0", 1024, 512));
//! assert_eq!(dev.geometry().num_blocks, 1024);
//! ```

use super::{
    BdevDescriptor, BdevEvent, BdevIo, BlockDevice, DifCheckFlags, DifType, EventSink, Geometry,
    IoChannel, IoRequest, IoTag, IoType, RejectReason, Rejected,
};
use crate::error::FailureCode;
use crate::util::buffer::IoBuffers;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Shape and capabilities of a RAM device
#[derive(Debug, Clone)]
pub struct MallocOptions {
    pub name: String,
    pub num_blocks: u64,
    /// Bytes per block, including interleaved metadata
    pub block_size: u32,
    pub md_size: u32,
    pub md_interleaved: bool,
    pub dif_type: DifType,
    pub dif_check: DifCheckFlags,
    pub buf_align: usize,
    /// I/O types this device refuses
    pub unsupported: Vec<IoType>,
    /// Keep an [`OperationRecord`] for every accepted submission
    pub record: bool,
}

impl MallocOptions {
    pub fn new(name: &str, num_blocks: u64, block_size: u32) -> Self {
        MallocOptions {
            name: name.to_string(),
            num_blocks,
            block_size,
            md_size: 0,
            md_interleaved: false,
            dif_type: DifType::Disabled,
            dif_check: DifCheckFlags::default(),
            buf_align: 4096,
            unsupported: Vec::new(),
            record: false,
        }
    }

    /// Add `md_size` bytes of metadata per block
    ///
    /// With `interleaved`, each block grows by `md_size` so the data area
    /// keeps its size.
    pub fn with_metadata(mut self, md_size: u32, interleaved: bool) -> Self {
        self.md_size = md_size;
        self.md_interleaved = interleaved;
        if interleaved {
            self.block_size += md_size;
        }
        self
    }

    /// Enable protection information with the given checks
    pub fn with_dif(mut self, dif_type: DifType, dif_check: DifCheckFlags) -> Self {
        self.dif_type = dif_type;
        self.dif_check = dif_check;
        self
    }

    pub fn without(mut self, io_type: IoType) -> Self {
        self.unsupported.push(io_type);
        self
    }

    /// Retain every accepted submission for later inspection
    ///
    /// The log grows without bound, so only short test runs should enable it.
    pub fn record_operations(mut self, record: bool) -> Self {
        self.record = record;
        self
    }
}

/// Record of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub tag: IoTag,
    pub io_type: IoType,
    pub offset_blocks: u64,
    pub num_blocks: u64,
}

#[derive(Debug, Default)]
struct FaultState {
    nomem_submissions: u32,
    fail_submission: Option<FailureCode>,
    fail_completions: u32,
    corrupt_reads: u32,
    stall_ios: u32,
    fail_open: bool,
    fail_channel: bool,
    hold: bool,
    held: Vec<(EventSink, BdevEvent)>,
    io_wait_signals: u64,
}

#[derive(Debug)]
struct Inner {
    options: MallocOptions,
    data: Mutex<Vec<u8>>,
    md: Mutex<Vec<u8>>,
    faults: Mutex<FaultState>,
    /// Set once any fault is injected; until then the I/O path skips `faults`
    faults_armed: AtomicBool,
    records: Mutex<Vec<OperationRecord>>,
    submitted: AtomicU64,
    sinks: Mutex<Vec<EventSink>>,
    open_descriptors: AtomicUsize,
    open_channels: AtomicUsize,
}

// A poisoned lock only means a test thread panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn geometry(&self) -> Geometry {
        let o = &self.options;
        Geometry {
            block_size: o.block_size,
            num_blocks: o.num_blocks,
            md_size: o.md_size,
            md_interleaved: o.md_interleaved,
            dif_type: o.dif_type,
            dif_check: o.dif_check,
            buf_align: o.buf_align,
        }
    }

    fn supports(&self, io_type: IoType) -> bool {
        !self.options.unsupported.contains(&io_type)
    }

    fn in_range(&self, offset_blocks: u64, num_blocks: u64) -> bool {
        offset_blocks
            .checked_add(num_blocks)
            .is_some_and(|end| end <= self.options.num_blocks)
    }

    fn md_separate(&self) -> bool {
        self.options.md_size > 0 && !self.options.md_interleaved
    }

    fn alloc_buffers(&self, num_blocks: u64) -> IoBuffers {
        let md_len = if self.md_separate() {
            (num_blocks * self.options.md_size as u64) as usize
        } else {
            0
        };
        IoBuffers::new(
            (num_blocks * self.options.block_size as u64) as usize,
            md_len,
            self.options.buf_align,
        )
    }

    fn read_into(&self, offset_blocks: u64, num_blocks: u64, bufs: &mut IoBuffers) {
        let bs = self.options.block_size as usize;
        let start = offset_blocks as usize * bs;
        let len = num_blocks as usize * bs;
        bufs.data.as_mut_slice()[..len].copy_from_slice(&lock(&self.data)[start..start + len]);

        if let Some(md) = bufs.md.as_mut() {
            let ms = self.options.md_size as usize;
            let start = offset_blocks as usize * ms;
            let len = num_blocks as usize * ms;
            md.as_mut_slice()[..len].copy_from_slice(&lock(&self.md)[start..start + len]);
        }

        if self.armed() {
            let mut faults = lock(&self.faults);
            if faults.corrupt_reads > 0 && len > 0 {
                faults.corrupt_reads -= 1;
                bufs.data.as_mut_slice()[0] ^= 0xFF;
            }
        }
    }

    fn write_from(&self, offset_blocks: u64, num_blocks: u64, bufs: &IoBuffers) {
        let bs = self.options.block_size as usize;
        let start = offset_blocks as usize * bs;
        let len = num_blocks as usize * bs;
        lock(&self.data)[start..start + len].copy_from_slice(&bufs.data.as_slice()[..len]);

        if let Some(md) = bufs.md.as_ref() {
            let ms = self.options.md_size as usize;
            let start = offset_blocks as usize * ms;
            let len = num_blocks as usize * ms;
            lock(&self.md)[start..start + len].copy_from_slice(&md.as_slice()[..len]);
        }
    }

    fn zero(&self, offset_blocks: u64, num_blocks: u64) {
        let bs = self.options.block_size as usize;
        let start = offset_blocks as usize * bs;
        lock(&self.data)[start..start + num_blocks as usize * bs].fill(0);
        if self.md_separate() {
            let ms = self.options.md_size as usize;
            let start = offset_blocks as usize * ms;
            lock(&self.md)[start..start + num_blocks as usize * ms].fill(0);
        }
    }

    /// Lock the fault state for an injection
    fn arm(&self) -> MutexGuard<'_, FaultState> {
        self.faults_armed.store(true, Ordering::SeqCst);
        lock(&self.faults)
    }

    fn armed(&self) -> bool {
        self.faults_armed.load(Ordering::SeqCst)
    }

    fn record(&self, tag: IoTag, io_type: IoType, offset_blocks: u64, num_blocks: u64) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if self.options.record {
            lock(&self.records).push(OperationRecord {
                tag,
                io_type,
                offset_blocks,
                num_blocks,
            });
        }
    }

    /// Decide whether the next completion reports failure
    fn take_completion_failure(&self) -> bool {
        if !self.armed() {
            return false;
        }
        let mut faults = lock(&self.faults);
        if faults.fail_completions > 0 {
            faults.fail_completions -= 1;
            true
        } else {
            false
        }
    }

    /// Decide whether the next submission is refused
    fn take_submit_fault(&self) -> Option<RejectReason> {
        if !self.armed() {
            return None;
        }
        let mut faults = lock(&self.faults);
        if faults.nomem_submissions > 0 {
            faults.nomem_submissions -= 1;
            return Some(RejectReason::NoMem);
        }
        faults.fail_submission.take().map(RejectReason::Failed)
    }

    fn deliver(&self, sink: &EventSink, event: BdevEvent) {
        if self.armed() {
            let mut faults = lock(&self.faults);
            if faults.hold {
                faults.held.push((sink.clone(), event));
                return;
            }
        }
        // The job may already have finished and dropped its receiver.
        let _ = sink.send(event);
    }
}

/// In-memory block device with fault injection
#[derive(Debug, Clone)]
pub struct MallocBdev {
    inner: Arc<Inner>,
}

impl MallocBdev {
    pub fn new(options: MallocOptions) -> Self {
        let data_len = (options.num_blocks * options.block_size as u64) as usize;
        let md_len = if options.md_size > 0 && !options.md_interleaved {
            (options.num_blocks * options.md_size as u64) as usize
        } else {
            0
        };
        MallocBdev {
            inner: Arc::new(Inner {
                options,
                data: Mutex::new(vec![0; data_len]),
                md: Mutex::new(vec![0; md_len]),
                faults: Mutex::new(FaultState::default()),
                faults_armed: AtomicBool::new(false),
                records: Mutex::new(Vec::new()),
                submitted: AtomicU64::new(0),
                sinks: Mutex::new(Vec::new()),
                open_descriptors: AtomicUsize::new(0),
                open_channels: AtomicUsize::new(0),
            }),
        }
    }

    /// Refuse the next `count` submissions with `NoMem`
    pub fn inject_nomem(&self, count: u32) {
        self.inner.arm().nomem_submissions = count;
    }

    /// Refuse the next submission with a hard failure
    pub fn inject_submit_failure(&self, code: FailureCode) {
        self.inner.arm().fail_submission = Some(code);
    }

    /// Complete the next `count` accepted I/O unsuccessfully
    pub fn fail_next_completions(&self, count: u32) {
        self.inner.arm().fail_completions = count;
    }

    /// Flip a byte in the next `count` reads
    pub fn corrupt_next_reads(&self, count: u32) {
        self.inner.arm().corrupt_reads = count;
    }

    /// Leave the next `count` reads/writes outstanding
    ///
    /// A stalled I/O raises a timeout when a timeout is configured on its
    /// channel, and completes unsuccessfully when aborted or reset.
    pub fn stall_next_ios(&self, count: u32) {
        self.inner.arm().stall_ios = count;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.inner.arm().fail_open = fail;
    }

    pub fn set_fail_channel(&self, fail: bool) {
        self.inner.arm().fail_channel = fail;
    }

    /// Queue completions instead of delivering them
    pub fn hold_completions(&self, hold: bool) {
        self.inner.arm().hold = hold;
    }

    /// Deliver every held completion; returns how many were released
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut lock(&self.inner.faults).held);
        let count = held.len();
        for (sink, event) in held {
            let _ = sink.send(event);
        }
        count
    }

    pub fn held_count(&self) -> usize {
        lock(&self.inner.faults).held.len()
    }

    /// Notify every opener that the device is gone
    pub fn hot_remove(&self) {
        let mut sinks = lock(&self.inner.sinks);
        sinks.retain(|sink| sink.send(BdevEvent::Removed).is_ok());
    }

    /// Accepted submissions, oldest first; empty unless recording is enabled
    pub fn submitted_operations(&self) -> Vec<OperationRecord> {
        lock(&self.inner.records).clone()
    }

    /// Number of accepted submissions, counted whether or not they are recorded
    pub fn submitted_count(&self) -> usize {
        self.inner.submitted.load(Ordering::SeqCst) as usize
    }

    /// Number of io-wait registrations made so far
    pub fn io_wait_signals(&self) -> u64 {
        lock(&self.inner.faults).io_wait_signals
    }

    pub fn open_descriptors(&self) -> usize {
        self.inner.open_descriptors.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::SeqCst)
    }

    /// Raw contents of `num_blocks` blocks
    pub fn read_blocks(&self, offset_blocks: u64, num_blocks: u64) -> Vec<u8> {
        let bs = self.inner.options.block_size as usize;
        let start = offset_blocks as usize * bs;
        lock(&self.inner.data)[start..start + num_blocks as usize * bs].to_vec()
    }
}

impl BlockDevice for MallocBdev {
    fn name(&self) -> &str {
        &self.inner.options.name
    }

    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        self.inner.supports(io_type)
    }

    fn open(&self, events: EventSink) -> Result<Box<dyn BdevDescriptor>, FailureCode> {
        if lock(&self.inner.faults).fail_open {
            return Err(FailureCode::no_device());
        }
        lock(&self.inner.sinks).push(events.clone());
        self.inner.open_descriptors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MallocDescriptor {
            inner: Arc::clone(&self.inner),
            events,
        }))
    }

    fn generate_dif(
        &self,
        data: &mut [u8],
        md: Option<&mut [u8]>,
        offset_blocks: u64,
        num_blocks: u64,
        flags: DifCheckFlags,
    ) -> Result<(), FailureCode> {
        let o = &self.inner.options;
        if o.dif_type == DifType::Disabled || flags.is_empty() {
            return Ok(());
        }
        // guard (2) + application tag (2) + reference tag (4)
        if o.md_size < 8 {
            return Err(FailureCode::invalid());
        }

        let bs = o.block_size as usize;
        let ms = o.md_size as usize;
        let data_bs = if o.md_interleaved { bs - ms } else { bs };
        let mut md = md;

        for i in 0..num_blocks as usize {
            let block = &data[i * bs..i * bs + data_bs];
            let guard = block
                .chunks(2)
                .fold(0u16, |acc, c| acc.wrapping_add(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])));
            let reftag = (offset_blocks + i as u64) as u32;

            let field: &mut [u8] = match md.as_deref_mut() {
                Some(md) => &mut md[i * ms..i * ms + 8],
                None => &mut data[i * bs + data_bs..i * bs + data_bs + 8],
            };
            if flags.guard {
                field[0..2].copy_from_slice(&guard.to_be_bytes());
            }
            if flags.reftag {
                field[4..8].copy_from_slice(&reftag.to_be_bytes());
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MallocDescriptor {
    inner: Arc<Inner>,
    events: EventSink,
}

impl BdevDescriptor for MallocDescriptor {
    fn io_channel(&self) -> Option<Box<dyn IoChannel>> {
        if lock(&self.inner.faults).fail_channel {
            return None;
        }
        self.inner.open_channels.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(MallocChannel {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
            timeout: None,
            stalled: HashMap::new(),
        }))
    }
}

impl Drop for MallocDescriptor {
    fn drop(&mut self) {
        self.inner.open_descriptors.fetch_sub(1, Ordering::SeqCst);
        lock(&self.inner.sinks).retain(|sink| !sink.same_channel(&self.events));
    }
}

#[derive(Debug)]
struct MallocChannel {
    inner: Arc<Inner>,
    events: EventSink,
    timeout: Option<Duration>,
    stalled: HashMap<IoTag, IoRequest>,
}

impl MallocChannel {
    fn fail_stalled(&mut self, tag: IoTag) -> bool {
        match self.stalled.remove(&tag) {
            Some(request) => {
                self.inner
                    .deliver(&self.events, BdevEvent::Complete(BdevIo::complete(request, false)));
                true
            }
            None => false,
        }
    }

    fn maybe_stall(&mut self, request: IoRequest) -> Option<IoRequest> {
        if !self.inner.armed() {
            return Some(request);
        }
        {
            let mut faults = lock(&self.inner.faults);
            if faults.stall_ios == 0 {
                return Some(request);
            }
            faults.stall_ios -= 1;
        }
        let tag = request.tag;
        self.stalled.insert(tag, request);
        if self.timeout.is_some() {
            let _ = self.events.send(BdevEvent::Timeout(tag));
        }
        None
    }
}

impl IoChannel for MallocChannel {
    fn submit(&mut self, mut request: IoRequest) -> Result<(), Rejected> {
        if let Some(reason) = self.inner.take_submit_fault() {
            return Err(Rejected::new(reason, request));
        }
        if !self.inner.supports(request.io_type) {
            return Err(Rejected::new(RejectReason::Failed(FailureCode::not_supported()), request));
        }
        let ranged = !matches!(request.io_type, IoType::Reset | IoType::Abort);
        if ranged && !self.inner.in_range(request.offset_blocks, request.num_blocks) {
            return Err(Rejected::new(RejectReason::Failed(FailureCode::invalid()), request));
        }
        if request.io_type == IoType::Write && request.buffers.is_none() {
            return Err(Rejected::new(RejectReason::Failed(FailureCode::invalid()), request));
        }

        self.inner
            .record(request.tag, request.io_type, request.offset_blocks, request.num_blocks);

        let success = match request.io_type {
            IoType::Abort => match request.abort_target {
                Some(target) => self.fail_stalled(target),
                None => false,
            },
            IoType::Reset => {
                let tags: Vec<IoTag> = self.stalled.keys().copied().collect();
                for tag in tags {
                    self.fail_stalled(tag);
                }
                !self.inner.take_completion_failure()
            }
            IoType::Read | IoType::Write => {
                request = match self.maybe_stall(request) {
                    Some(request) => request,
                    None => return Ok(()),
                };
                let failed = self.inner.take_completion_failure();
                if !failed {
                    let (offset, num) = (request.offset_blocks, request.num_blocks);
                    if request.io_type == IoType::Write {
                        if let Some(bufs) = request.buffers.as_ref() {
                            self.inner.write_from(offset, num, bufs);
                        }
                    } else {
                        let mut bufs = match request.buffers.take() {
                            Some(bufs) => bufs,
                            None => self.inner.alloc_buffers(num),
                        };
                        self.inner.read_into(offset, num, &mut bufs);
                        request.buffers = Some(bufs);
                    }
                }
                !failed
            }
            IoType::Unmap | IoType::WriteZeroes => {
                let failed = self.inner.take_completion_failure();
                if !failed {
                    self.inner.zero(request.offset_blocks, request.num_blocks);
                }
                !failed
            }
            IoType::Flush | IoType::Zcopy => !self.inner.take_completion_failure(),
        };

        self.inner
            .deliver(&self.events, BdevEvent::Complete(BdevIo::complete(request, success)));
        Ok(())
    }

    fn zcopy_start(
        &mut self,
        tag: IoTag,
        offset_blocks: u64,
        num_blocks: u64,
        populate: bool,
    ) -> Result<(), RejectReason> {
        if let Some(reason) = self.inner.take_submit_fault() {
            return Err(reason);
        }
        if !self.inner.supports(IoType::Zcopy) {
            return Err(RejectReason::Failed(FailureCode::not_supported()));
        }
        if !self.inner.in_range(offset_blocks, num_blocks) {
            return Err(RejectReason::Failed(FailureCode::invalid()));
        }

        self.inner.record(tag, IoType::Zcopy, offset_blocks, num_blocks);

        let mut buffers = self.inner.alloc_buffers(num_blocks);
        let success = !self.inner.take_completion_failure();
        if success && populate {
            self.inner.read_into(offset_blocks, num_blocks, &mut buffers);
        }
        let lease = BdevIo {
            tag,
            io_type: IoType::Zcopy,
            success,
            offset_blocks,
            num_blocks,
            buffers: Some(buffers),
            populated: populate,
        };
        self.inner.deliver(&self.events, BdevEvent::Complete(lease));
        Ok(())
    }

    fn zcopy_end(&mut self, mut lease: BdevIo, commit: bool) {
        lease.success = !self.inner.take_completion_failure();
        if commit {
            lease.io_type = IoType::Write;
            if lease.success {
                if let Some(bufs) = lease.buffers.as_ref() {
                    self.inner.write_from(lease.offset_blocks, lease.num_blocks, bufs);
                }
            }
        } else {
            lease.io_type = IoType::Read;
        }
        self.inner.deliver(&self.events, BdevEvent::Complete(lease));
    }

    fn queue_io_wait(&mut self, tag: IoTag) {
        lock(&self.inner.faults).io_wait_signals += 1;
        debug!(device = %self.inner.options.name, tag = tag.0, "io wait registered");
        // Exhaustion here is synthetic, so capacity is back immediately.
        let _ = self.events.send(BdevEvent::IoWaitReady(tag));
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }
}

impl Drop for MallocChannel {
    fn drop(&mut self) {
        self.inner.open_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn open(dev: &MallocBdev) -> (Box<dyn BdevDescriptor>, Box<dyn IoChannel>, UnboundedReceiver<BdevEvent>) {
        let (tx, rx) = unbounded_channel();
        let desc = dev.open(tx).unwrap();
        let ch = desc.io_channel().unwrap();
        (desc, ch, rx)
    }

    fn complete(rx: &mut UnboundedReceiver<BdevEvent>) -> BdevIo {
        match rx.try_recv().unwrap() {
            BdevEvent::Complete(io) => io,
            other => panic!("Expected completion, got {:?}", other),
        }
    }

    fn buffers(dev: &MallocBdev, num_blocks: u64, fill: u8) -> IoBuffers {
        let mut bufs = dev.inner.alloc_buffers(num_blocks);
        bufs.data.as_mut_slice().fill(fill);
        bufs
    }

    #[test]
    fn test_write_then_read() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        let (_desc, mut ch, mut rx) = open(&dev);

        let write = IoRequest::new(IoTag(1), IoType::Write, 2, 2).with_buffers(buffers(&dev, 2, 0xAB));
        ch.submit(write).unwrap();
        let io = complete(&mut rx);
        assert!(io.success);
        assert_eq!(io.tag, IoTag(1));
        assert!(io.buffers.is_some());

        ch.submit(IoRequest::new(IoTag(2), IoType::Read, 2, 2)).unwrap();
        let io = complete(&mut rx);
        assert!(io.success);
        assert!(io.buffers.unwrap().data.as_slice().iter().all(|&b| b == 0xAB));
        assert!(dev.read_blocks(0, 2).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_nomem_returns_request() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        let (_desc, mut ch, mut rx) = open(&dev);
        dev.inject_nomem(1);

        let write = IoRequest::new(IoTag(3), IoType::Write, 0, 1).with_buffers(buffers(&dev, 1, 1));
        let rejected = ch.submit(write).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::NoMem);
        assert!(rejected.request.buffers.is_some());

        ch.queue_io_wait(IoTag(3));
        assert!(matches!(rx.try_recv().unwrap(), BdevEvent::IoWaitReady(IoTag(3))));
        assert_eq!(dev.io_wait_signals(), 1);

        ch.submit(rejected.request).unwrap();
        assert!(complete(&mut rx).success);
        assert_eq!(dev.submitted_count(), 1);
    }

    #[test]
    fn test_operations_recorded_only_on_request() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        let (_desc, mut ch, mut rx) = open(&dev);
        for i in 0..100 {
            ch.submit(IoRequest::new(IoTag(0), IoType::Read, i % 16, 1)).unwrap();
            assert!(complete(&mut rx).success);
        }
        assert_eq!(dev.submitted_count(), 100);
        assert!(dev.submitted_operations().is_empty());
        assert!(lock(&dev.inner.records).capacity() == 0);

        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512).record_operations(true));
        let (_desc, mut ch, mut rx) = open(&dev);
        ch.submit(IoRequest::new(IoTag(4), IoType::Read, 3, 1)).unwrap();
        assert!(complete(&mut rx).success);
        assert_eq!(
            dev.submitted_operations(),
            vec![OperationRecord {
                tag: IoTag(4),
                io_type: IoType::Read,
                offset_blocks: 3,
                num_blocks: 1,
            }]
        );
    }

    #[test]
    fn test_unsupported_and_out_of_range() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512).without(IoType::Unmap));
        let (_desc, mut ch, _rx) = open(&dev);

        let rejected = ch.submit(IoRequest::new(IoTag(0), IoType::Unmap, 0, 1)).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Failed(FailureCode::not_supported()));

        let rejected = ch.submit(IoRequest::new(IoTag(0), IoType::Flush, 15, 2)).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Failed(FailureCode::invalid()));
    }

    #[test]
    fn test_failed_completion_and_corrupt_read() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        let (_desc, mut ch, mut rx) = open(&dev);

        dev.fail_next_completions(1);
        ch.submit(IoRequest::new(IoTag(0), IoType::Flush, 0, 1)).unwrap();
        assert!(!complete(&mut rx).success);

        dev.corrupt_next_reads(1);
        ch.submit(IoRequest::new(IoTag(0), IoType::Read, 0, 1)).unwrap();
        let io = complete(&mut rx);
        assert!(io.success);
        assert_eq!(io.buffers.unwrap().data.as_slice()[0], 0xFF);
    }

    #[test]
    fn test_zcopy_write_and_populate() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512).with_metadata(8, false));
        let (_desc, mut ch, mut rx) = open(&dev);

        ch.zcopy_start(IoTag(4), 1, 1, false).unwrap();
        let mut lease = complete(&mut rx);
        assert!(lease.success);
        assert_eq!(lease.io_type, IoType::Zcopy);
        let bufs = lease.buffers.as_mut().unwrap();
        assert_eq!(bufs.md_slice().map(|m| m.len()), Some(8));
        bufs.data.as_mut_slice().fill(0x5C);

        ch.zcopy_end(lease, true);
        let io = complete(&mut rx);
        assert_eq!(io.io_type, IoType::Write);
        assert!(dev.read_blocks(1, 1).iter().all(|&b| b == 0x5C));

        ch.zcopy_start(IoTag(5), 1, 1, true).unwrap();
        let lease = complete(&mut rx);
        assert!(lease.populated);
        assert!(lease.buffers.as_ref().unwrap().data.as_slice().iter().all(|&b| b == 0x5C));
        ch.zcopy_end(lease, false);
        assert_eq!(complete(&mut rx).io_type, IoType::Read);
    }

    #[test]
    fn test_stalled_io_times_out_and_aborts() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        let (_desc, mut ch, mut rx) = open(&dev);
        ch.set_timeout(Duration::from_secs(1));
        dev.stall_next_ios(1);

        ch.submit(IoRequest::new(IoTag(7), IoType::Read, 0, 1)).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), BdevEvent::Timeout(IoTag(7))));

        let mut abort = IoRequest::new(IoTag(8), IoType::Abort, 0, 0);
        abort.abort_target = Some(IoTag(7));
        ch.submit(abort).unwrap();

        let aborted = complete(&mut rx);
        assert_eq!(aborted.tag, IoTag(7));
        assert!(!aborted.success);
        let abort_done = complete(&mut rx);
        assert_eq!(abort_done.tag, IoTag(8));
        assert!(abort_done.success);
    }

    #[test]
    fn test_hold_and_release() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        let (_desc, mut ch, mut rx) = open(&dev);
        dev.hold_completions(true);

        for i in 0..3 {
            ch.submit(IoRequest::new(IoTag(i), IoType::Flush, i as u64, 1)).unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(dev.held_count(), 3);

        dev.hold_completions(false);
        assert_eq!(dev.release_held(), 3);
        for i in 0..3 {
            assert_eq!(complete(&mut rx).tag, IoTag(i));
        }
    }

    #[test]
    fn test_resource_tracking_and_hot_remove() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        let (desc, ch, mut rx) = open(&dev);
        assert_eq!(dev.open_descriptors(), 1);
        assert_eq!(dev.open_channels(), 1);

        dev.hot_remove();
        assert!(matches!(rx.try_recv().unwrap(), BdevEvent::Removed));

        drop(ch);
        drop(desc);
        assert_eq!(dev.open_descriptors(), 0);
        assert_eq!(dev.open_channels(), 0);
    }

    #[test]
    fn test_open_and_channel_failures() {
        let dev = MallocBdev::new(MallocOptions::new("Malloc0", 16, 512));
        dev.set_fail_open(true);
        let (tx, _rx) = unbounded_channel();
        assert!(dev.open(tx.clone()).is_err());

        dev.set_fail_open(false);
        dev.set_fail_channel(true);
        let desc = dev.open(tx).unwrap();
        assert!(desc.io_channel().is_none());
    }

    #[test]
    fn test_generate_dif_separate() {
        let dev = MallocBdev::new(
            MallocOptions::new("Malloc0", 16, 512)
                .with_metadata(8, false)
                .with_dif(DifType::Type1, DifCheckFlags { reftag: true, guard: false }),
        );
        let mut data = vec![0u8; 1024];
        let mut md = vec![0u8; 16];
        dev.generate_dif(&mut data, Some(&mut md), 10, 2, dev.geometry().dif_check)
            .unwrap();
        assert_eq!(&md[4..8], &10u32.to_be_bytes());
        assert_eq!(&md[12..16], &11u32.to_be_bytes());
    }

    #[test]
    fn test_generate_dif_rejects_small_md() {
        let dev = MallocBdev::new(
            MallocOptions::new("Malloc0", 16, 512)
                .with_metadata(4, true)
                .with_dif(DifType::Type1, DifCheckFlags { reftag: true, guard: true }),
        );
        let mut data = vec![0u8; 516];
        assert!(dev.generate_dif(&mut data, None, 0, 1, dev.geometry().dif_check).is_err());
    }
}

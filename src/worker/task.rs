//! Tasks and the per-job task pool
//!
//! A task is a reusable I/O descriptor. Its buffers are allocated once when
//! the pool is built and travel with the task for the whole run: they are
//! moved into an [`IoRequest`](crate::bdev::IoRequest) on submission and come
//! back in the completion.

use crate::bdev::{BdevIo, IoTag, IoType};
use crate::util::buffer::IoBuffers;
use std::collections::VecDeque;
use std::ops::{Index, IndexMut};
use tracing::error;

/// Number of tasks a job needs
///
/// One per queue slot, one for reset injection, and a full queue's worth in
/// reserve for aborts.
pub fn task_count(queue_depth: usize, reset: bool, abort: bool) -> usize {
    queue_depth + usize::from(reset) + if abort { queue_depth } else { 0 }
}

/// What the backend is currently doing for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStage {
    /// Plain read, write, flush, unmap or write-zeroes
    Io(IoType),
    /// Pattern write of a verify cycle; completes into a read-back
    VerifyWrite,
    /// Read-back of a verify cycle
    VerifyRead,
    /// Waiting for a write lease
    ZcopyAcquire,
    /// Waiting for a populated read lease
    ZcopyPopulate,
    /// Leased buffer being written out
    ZcopyCommit,
    /// Read lease being returned
    ZcopyRelease,
    Abort,
    Reset,
}

/// The step to repeat once the backend has resources again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Submit,
    VerifyRead,
    ZcopyAcquire,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    InFlight(IoStage),
    IoWait(RetryStep),
}

/// One reusable I/O descriptor
#[derive(Debug)]
pub struct Task {
    pub tag: IoTag,
    /// Task-owned buffers; `None` while lent to the backend
    pub buffers: Option<IoBuffers>,
    pub offset_blocks: u64,
    pub io_type: IoType,
    /// Task whose I/O an abort targets
    pub abort_target: Option<IoTag>,
    /// Backend I/O held between a lease and its end, or a read-back
    /// completion awaiting verification
    pub lease: Option<BdevIo>,
    pub state: TaskState,
    /// Whether this task's current cycle is counted in the job's in-flight
    /// total
    pub counted: bool,
}

impl Task {
    fn new(index: usize, buffers: IoBuffers) -> Self {
        Task {
            tag: IoTag(index),
            buffers: Some(buffers),
            offset_blocks: 0,
            io_type: IoType::Read,
            abort_target: None,
            lease: None,
            state: TaskState::Free,
            counted: false,
        }
    }
}

/// Fixed set of tasks with a FIFO free list
#[derive(Debug)]
pub struct TaskPool {
    tasks: Vec<Task>,
    free: VecDeque<usize>,
}

impl TaskPool {
    /// Allocate `count` tasks, each with a `buf_size` data buffer and a
    /// `md_len` metadata buffer when `md_len` is non-zero
    pub fn new(count: usize, buf_size: usize, md_len: usize, alignment: usize) -> Self {
        let tasks: Vec<Task> = (0..count)
            .map(|i| Task::new(i, IoBuffers::new(buf_size, md_len, alignment)))
            .collect();
        TaskPool {
            free: (0..tasks.len()).collect(),
            tasks,
        }
    }

    /// Take the task at the head of the free list
    ///
    /// The pool is sized so this never runs dry; if it does the process is
    /// halted.
    pub fn acquire(&mut self) -> IoTag {
        match self.free.pop_front() {
            Some(index) => IoTag(index),
            None => {
                error!("Task allocation failed");
                std::process::abort();
            }
        }
    }

    /// Return a task to the tail of the free list
    pub fn release(&mut self, tag: IoTag) {
        let task = &mut self.tasks[tag.0];
        task.state = TaskState::Free;
        task.abort_target = None;
        task.lease = None;
        task.counted = false;
        self.free.push_back(tag.0);
    }

    pub fn get(&self, tag: IoTag) -> Option<&Task> {
        self.tasks.get(tag.0)
    }

    pub fn get_mut(&mut self, tag: IoTag) -> Option<&mut Task> {
        self.tasks.get_mut(tag.0)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl Index<IoTag> for TaskPool {
    type Output = Task;

    fn index(&self, tag: IoTag) -> &Task {
        &self.tasks[tag.0]
    }
}

impl IndexMut<IoTag> for TaskPool {
    fn index_mut(&mut self, tag: IoTag) -> &mut Task {
        &mut self.tasks[tag.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_count() {
        assert_eq!(task_count(8, false, false), 8);
        assert_eq!(task_count(8, true, false), 9);
        assert_eq!(task_count(8, true, true), 17);
        assert_eq!(task_count(1, false, true), 2);
    }

    #[test]
    fn test_pool_buffers() {
        let pool = TaskPool::new(3, 4096, 64, 512);
        assert_eq!(pool.len(), 3);
        let task = pool.get(IoTag(2)).unwrap();
        let bufs = task.buffers.as_ref().unwrap();
        assert_eq!(bufs.data.len(), 4096);
        assert_eq!(bufs.md_slice().map(|m| m.len()), Some(64));
        assert!(bufs.data.is_aligned());

        let pool = TaskPool::new(1, 512, 0, 512);
        assert!(pool.get(IoTag(0)).unwrap().buffers.as_ref().unwrap().md.is_none());
    }

    #[test]
    fn test_fifo_order() {
        let mut pool = TaskPool::new(3, 512, 0, 512);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!((a, b), (IoTag(0), IoTag(1)));
        assert_eq!(pool.free_count(), 1);

        pool.release(a);
        assert_eq!(pool.acquire(), IoTag(2));
        assert_eq!(pool.acquire(), IoTag(0));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_release_resets_task() {
        let mut pool = TaskPool::new(1, 512, 0, 512);
        let tag = pool.acquire();
        {
            let task = pool.get_mut(tag).unwrap();
            task.state = TaskState::InFlight(IoStage::Abort);
            task.abort_target = Some(IoTag(5));
            task.counted = true;
        }
        pool.release(tag);
        let task = pool.get(tag).unwrap();
        assert_eq!(task.state, TaskState::Free);
        assert!(task.abort_target.is_none());
        assert!(!task.counted);
    }
}

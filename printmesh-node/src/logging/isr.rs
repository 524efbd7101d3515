//! Interrupt-context producer
//!
//! An interrupt handler may not allocate and may not block. [`IsrLogger`]
//! reserves its line buffers up front in a fixed pool; the writer hands each
//! buffer back after printing it. Logging happens inside an [`IsrFrame`]:
//! a queued message only marks a wake-up as pending, and the writer is
//! unparked once the frame ends instead of from inside the handler.

use super::{format_bounded, LogRecord, Pipeline};
use heapless::mpmc::MpMcQueue;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on the buffers one handler can reserve.
pub const MAX_POOL_SIZE: usize = 16;

/// Line buffers owned by one interrupt handler, shared with the writer.
pub(super) struct BufferPool {
    slots: MpMcQueue<String, MAX_POOL_SIZE>,
    free: AtomicUsize,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            slots: MpMcQueue::new(),
            free: AtomicUsize::new(0),
        }
    }

    fn take(&self) -> Option<String> {
        let buf = self.slots.dequeue()?;
        self.free.fetch_sub(1, Ordering::AcqRel);
        Some(buf)
    }

    /// Return a buffer. Only buffers taken from this pool come back, so it never overflows.
    pub(super) fn put(&self, buf: String) {
        self.free.fetch_add(1, Ordering::AcqRel);
        if self.slots.enqueue(buf).is_err() {
            self.free.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn available(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }
}

/// Producer for one interrupt handler. Not `Clone`: each handler owns its pool.
pub struct IsrLogger {
    pipeline: Option<Arc<Pipeline>>,
    pool: Arc<BufferPool>,
    reserved: usize,
    dropped_empty_pool: u64,
}

impl IsrLogger {
    pub(super) fn new(pipeline: Option<Arc<Pipeline>>, pool_size: usize) -> Self {
        let pool = Arc::new(BufferPool::new());
        let mut reserved = 0;

        if let Some(pipeline) = &pipeline {
            for _ in 0..pool_size.clamp(1, MAX_POOL_SIZE) {
                let mut buf = String::new();
                if buf.try_reserve_exact(pipeline.max_line).is_err() {
                    break;
                }
                pool.put(buf);
                reserved += 1;
            }
        }

        Self {
            pipeline,
            pool,
            reserved,
            dropped_empty_pool: 0,
        }
    }

    /// Enter handler context. Any writer wake-up is deferred to the end of the frame.
    pub fn frame(&mut self) -> IsrFrame<'_> {
        IsrFrame {
            logger: self,
            wake_pending: false,
        }
    }

    /// Buffers reserved at creation.
    pub fn pool_size(&self) -> usize {
        self.reserved
    }

    /// Buffers currently in the pool, not queued or being written.
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Messages lost because every reserved buffer was still in flight.
    pub fn dropped_empty_pool(&self) -> u64 {
        self.dropped_empty_pool
    }
}

/// One interrupt invocation.
pub struct IsrFrame<'a> {
    logger: &'a mut IsrLogger,
    wake_pending: bool,
}

impl IsrFrame<'_> {
    /// Format into a reserved buffer and enqueue without blocking or allocating.
    pub fn log(&mut self, args: fmt::Arguments<'_>) -> bool {
        let Some(pipeline) = &self.logger.pipeline else {
            return false;
        };

        let Some(mut line) = self.logger.pool.take() else {
            self.logger.dropped_empty_pool += 1;
            pipeline.note_alloc_failure();
            return false;
        };

        // Formatting never grows the buffer past its reserved capacity.
        format_bounded(&mut line, pipeline.max_line, args);

        let record = LogRecord {
            line,
            recycle: Some(self.logger.pool.clone()),
        };
        match pipeline.submit(record) {
            Ok(()) => {
                self.wake_pending = true;
                true
            }
            Err(record) => {
                let mut line = record.line;
                line.clear();
                self.logger.pool.put(line);
                false
            }
        }
    }

    pub fn wake_pending(&self) -> bool {
        self.wake_pending
    }
}

impl Drop for IsrFrame<'_> {
    fn drop(&mut self) {
        if self.wake_pending {
            if let Some(pipeline) = &self.logger.pipeline {
                pipeline.wake_writer();
            }
        }
    }
}

//! Asynchronous single-writer log pipeline
//!
//! All diagnostic output funnels through one bounded queue drained by one
//! dedicated writer thread, so the output device is never written
//! concurrently. Producers never block:
//! - the line is formatted into an owned buffer capped at `max_line_length`
//!   (overflow is cut and marked with `...`)
//! - the queue's slots are reserved once at initialization, so enqueueing
//!   never allocates; a full queue drops the line and frees the buffer
//! - a failed line allocation drops the line
//!
//! The writer parks while the queue is empty and producers unpark it.
//! Task code logs through [`LogHandle`]; interrupt handlers use
//! [`isr::IsrLogger`], which never touches the global allocator and defers
//! the wake-up until its frame ends.
//! [`LogHandle`] also implements `tracing_subscriber`'s `MakeWriter`, so
//! every `tracing` event of the process can be routed through the queue.

pub mod isr;

use heapless::mpmc::MpMcQueue;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::MakeWriter;

use isr::BufferPool;
pub use isr::{IsrFrame, IsrLogger, MAX_POOL_SIZE};

/// Visible marker written at the end of a cut line.
pub const TRUNCATION_MARKER: &str = "...";

/// Smallest accepted line length; leaves room for content plus the marker.
pub const MIN_LINE_LENGTH: usize = 8;

/// Queue slots reserved up front; larger capacities are clamped to it.
pub const MAX_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 512;

/// Longest the writer sleeps before checking whether every producer is gone.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// A formatted line on its way to the writer. Lines that came from an
/// interrupt pool carry the route back to that pool.
struct LogRecord {
    line: String,
    recycle: Option<Arc<BufferPool>>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped_full: AtomicU64,
    dropped_alloc: AtomicU64,
    written: AtomicU64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub enqueued: u64,
    pub dropped_full: u64,
    pub dropped_alloc: u64,
    pub written: u64,
}

impl LogStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_full + self.dropped_alloc
    }
}

struct Pipeline {
    queue: MpMcQueue<LogRecord, MAX_QUEUE_CAPACITY>,
    capacity: usize,
    /// Records enqueued and not yet taken by the writer
    depth: AtomicUsize,
    writer: OnceLock<Thread>,
    max_line: usize,
    counters: Counters,
}

impl Pipeline {
    /// Enqueue without blocking or allocating. Waking the writer is left to the caller.
    fn submit(&self, record: LogRecord) -> Result<(), LogRecord> {
        let reserved = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < self.capacity).then_some(depth + 1)
            })
            .is_ok();
        if !reserved {
            self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
            return Err(record);
        }

        // Counted first so `written` never overtakes `enqueued`.
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue.enqueue(record).map_err(|record| {
            self.counters.enqueued.fetch_sub(1, Ordering::Relaxed);
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
            record
        })
    }

    fn take(&self) -> Option<LogRecord> {
        let record = self.queue.dequeue()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(record)
    }

    fn wake_writer(&self) {
        if let Some(writer) = self.writer.get() {
            writer.unpark();
        }
    }

    fn note_alloc_failure(&self) {
        self.counters.dropped_alloc.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> LogStats {
        LogStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
            dropped_alloc: self.counters.dropped_alloc.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Acquire),
        }
    }
}

/// Queue sizing for [`LogPipeline::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub capacity: usize,
    pub max_line_length: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Owner of the queue and its writer thread.
#[derive(Default)]
pub struct LogPipeline {
    inner: OnceLock<Arc<Pipeline>>,
}

impl LogPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the queue and start the writer. Returns `false` when already
    /// initialized or when the writer thread could not be started.
    pub fn initialize(&self, settings: LogSettings, sink: Box<dyn Write + Send>) -> bool {
        if self.inner.get().is_some() {
            return false;
        }

        let capacity = settings.capacity.clamp(1, MAX_QUEUE_CAPACITY);
        let max_line = settings.max_line_length.max(MIN_LINE_LENGTH);
        let pipeline = Arc::new(Pipeline {
            queue: MpMcQueue::new(),
            capacity,
            depth: AtomicUsize::new(0),
            writer: OnceLock::new(),
            max_line,
            counters: Counters::default(),
        });

        if self.inner.set(pipeline.clone()).is_err() {
            // Lost an initialization race; the winner owns the writer.
            return false;
        }

        let worker = pipeline.clone();
        let spawned = thread::Builder::new()
            .name("log-writer".into())
            .spawn(move || writer_loop(sink, worker));

        match spawned {
            Ok(handle) => {
                let _ = pipeline.writer.set(handle.thread().clone());
                true
            }
            Err(e) => {
                // Nothing to log through yet; the queue stays unconsumed and every
                // producer drops once it fills.
                let _ = writeln!(io::stderr(), "FATAL: log writer thread failed to start: {e}");
                false
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Producer handle for task context. Before initialization the handle drops everything.
    pub fn handle(&self) -> LogHandle {
        LogHandle {
            pipeline: self.inner.get().cloned(),
        }
    }

    /// Producer for one interrupt handler, with `pool_size` buffers reserved up front.
    pub fn isr_logger(&self, pool_size: usize) -> IsrLogger {
        IsrLogger::new(self.inner.get().cloned(), pool_size)
    }

    pub fn stats(&self) -> LogStats {
        self.inner.get().map(|p| p.stats()).unwrap_or_default()
    }

    /// Wait until every enqueued line has been written. Returns `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(pipeline) = self.inner.get() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        loop {
            let stats = pipeline.stats();
            if stats.written >= stats.enqueued {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn writer_loop(mut sink: Box<dyn Write + Send>, pipeline: Arc<Pipeline>) {
    loop {
        // Sole owner means no producer is left; drain what they queued and stop.
        let last_owner = Arc::strong_count(&pipeline) == 1;
        fence(Ordering::Acquire);

        while let Some(LogRecord { mut line, recycle }) = pipeline.take() {
            let _ = sink.write_all(line.as_bytes());
            if !line.ends_with('\n') {
                let _ = sink.write_all(b"\n");
            }
            let _ = sink.flush();

            if let Some(pool) = recycle {
                line.clear();
                pool.put(line);
            }
            // Release: a flush that sees this count also sees the buffer back in its pool.
            pipeline.counters.written.fetch_add(1, Ordering::Release);
        }

        if last_owner {
            return;
        }
        thread::park_timeout(IDLE_WAIT);
    }
}

/// Cheap, cloneable producer for normal task context.
#[derive(Clone, Default)]
pub struct LogHandle {
    pipeline: Option<Arc<Pipeline>>,
}

impl LogHandle {
    /// Format and enqueue one line. Never blocks; returns whether the line was queued.
    pub fn log(&self, args: fmt::Arguments<'_>) -> bool {
        let Some(pipeline) = &self.pipeline else {
            return false;
        };

        let mut line = String::new();
        if line.try_reserve_exact(pipeline.max_line).is_err() {
            pipeline.note_alloc_failure();
            return false;
        }
        format_bounded(&mut line, pipeline.max_line, args);

        if pipeline.submit(LogRecord { line, recycle: None }).is_err() {
            return false;
        }
        pipeline.wake_writer();
        true
    }

    pub fn max_line_length(&self) -> Option<usize> {
        self.pipeline.as_ref().map(|p| p.max_line)
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter {
            handle: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Collects one formatted `tracing` event and enqueues it as a single line on drop.
pub struct EventWriter {
    handle: LogHandle,
    buf: Vec<u8>,
}

impl Write for EventWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.buf);
        let text = text.trim_end_matches(['\n', '\r']);
        self.handle.log(format_args!("{text}"));
    }
}

/// Writer that refuses to grow `buf` beyond `limit` bytes.
struct BoundedWriter<'a> {
    buf: &'a mut String,
    limit: usize,
    overflowed: bool,
}

impl fmt::Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.overflowed {
            return Ok(());
        }
        let room = self.limit - self.buf.len();
        if s.len() <= room {
            self.buf.push_str(s);
        } else {
            self.buf.push_str(&s[..floor_char_boundary(s, room)]);
            self.overflowed = true;
        }
        Ok(())
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Format `args` into `buf` (cleared first). Output longer than `max_line`
/// becomes exactly `max_line` bytes ending in at least [`TRUNCATION_MARKER`].
/// Returns whether the line was cut.
pub(crate) fn format_bounded(buf: &mut String, max_line: usize, args: fmt::Arguments<'_>) -> bool {
    buf.clear();
    let mut writer = BoundedWriter {
        buf,
        limit: max_line,
        overflowed: false,
    };
    let _ = writer.write_fmt(args);
    let overflowed = writer.overflowed;

    if overflowed {
        let keep = floor_char_boundary(buf, max_line - TRUNCATION_MARKER.len());
        buf.truncate(keep);
        // A multi-byte char at the cut leaves a gap; pad it with the marker char.
        while buf.len() < max_line {
            buf.push('.');
        }
    }
    overflowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Sink shared with the test body.
    #[derive(Clone, Default)]
    pub(crate) struct CaptureSink(pub Arc<Mutex<Vec<u8>>>);

    impl Write for CaptureSink {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CaptureSink {
        pub(crate) fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    /// Sink that blocks the writer until the gate opens.
    struct GateSink {
        gate: Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>,
        inner: CaptureSink,
    }

    impl Write for GateSink {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            let (lock, cvar) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            self.inner.write(bytes)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn started(capacity: usize, max_line: usize) -> (LogPipeline, CaptureSink) {
        let pipeline = LogPipeline::new();
        let sink = CaptureSink::default();
        assert!(pipeline.initialize(
            LogSettings {
                capacity,
                max_line_length: max_line
            },
            Box::new(sink.clone())
        ));
        (pipeline, sink)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (pipeline, _sink) = started(4, 64);
        assert!(!pipeline.initialize(LogSettings::default(), Box::new(io::sink())));
        assert!(pipeline.is_initialized());
    }

    #[test]
    fn test_lines_written_in_order() {
        let (pipeline, sink) = started(16, 64);
        let handle = pipeline.handle();
        for i in 0..10 {
            assert!(handle.log(format_args!("line {i}")));
        }
        assert!(pipeline.flush(Duration::from_secs(2)));

        let expected: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
        assert_eq!(sink.lines(), expected);
    }

    #[test]
    fn test_truncation_is_exact() {
        let mut buf = String::new();
        let cut = format_bounded(&mut buf, 16, format_args!("{}", "x".repeat(40)));
        assert!(cut);
        assert_eq!(buf.len(), 16);
        assert!(buf.ends_with(TRUNCATION_MARKER));
        assert_eq!(&buf[..13], "xxxxxxxxxxxxx");

        let fits = format_bounded(&mut buf, 16, format_args!("{}", "y".repeat(16)));
        assert!(!fits);
        assert_eq!(buf, "y".repeat(16));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut buf = String::new();
        // 'é' is two bytes; the 13-byte cut lands mid-char
        let text = "aé".repeat(20);
        assert!(format_bounded(&mut buf, 16, format_args!("{text}")));
        assert_eq!(buf.len(), 16);
        assert!(buf.ends_with(TRUNCATION_MARKER));
        assert!(buf.is_char_boundary(buf.len()));
    }

    #[test]
    fn test_truncated_line_reaches_sink() {
        let (pipeline, sink) = started(4, 32);
        pipeline.handle().log(format_args!("{}", "z".repeat(100)));
        assert!(pipeline.flush(Duration::from_secs(2)));
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 32);
        assert!(lines[0].ends_with("..."));
    }

    #[test]
    fn test_uninitialized_handle_drops_silently() {
        let pipeline = LogPipeline::new();
        assert!(!pipeline.handle().log(format_args!("nobody listens")));
        assert_eq!(pipeline.stats(), LogStats::default());
        assert!(pipeline.flush(Duration::from_millis(1)));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let gate = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let sink = CaptureSink::default();
        let pipeline = LogPipeline::new();
        pipeline.initialize(
            LogSettings {
                capacity: 2,
                max_line_length: 64,
            },
            Box::new(GateSink {
                gate: gate.clone(),
                inner: sink.clone(),
            }),
        );

        let handle = pipeline.handle();
        let attempts = 50u64;
        let started = Instant::now();
        let accepted = (0..attempts)
            .filter(|i| handle.log(format_args!("burst {i}")))
            .count() as u64;
        assert!(started.elapsed() < Duration::from_secs(1), "producer blocked");

        // writer holds at most one line plus two queued
        assert!(accepted <= 3, "accepted {accepted}");
        let stats = pipeline.stats();
        assert_eq!(stats.enqueued + stats.dropped(), attempts);

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        assert!(pipeline.flush(Duration::from_secs(2)));

        let stats = pipeline.stats();
        assert_eq!(stats.written, stats.enqueued);
        assert_eq!(sink.lines().len() as u64, stats.written);
    }

    #[test]
    fn test_random_pressure_accounts_every_line() {
        let (pipeline, sink) = started(8, 48);
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let handle = pipeline.handle();
                thread::spawn(move || {
                    for i in 0..200 {
                        handle.log(format_args!("p{p} #{i}"));
                        if i % 17 == 0 {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(pipeline.flush(Duration::from_secs(5)));
        let stats = pipeline.stats();
        assert_eq!(stats.enqueued + stats.dropped(), 800);
        assert_eq!(stats.written, stats.enqueued);
        assert_eq!(sink.lines().len() as u64, stats.written);
    }

    #[test]
    fn test_tracing_events_route_through_queue() {
        use tracing_subscriber::fmt;

        let (pipeline, sink) = started(16, 256);
        let subscriber = fmt()
            .with_writer(pipeline.handle())
            .with_ansi(false)
            .without_time()
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("announced status for {}", "a1");
            tracing::warn!("second event");
        });

        assert!(pipeline.flush(Duration::from_secs(2)));
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("announced status for a1"));
        assert!(lines[1].contains("WARN"));
    }
}

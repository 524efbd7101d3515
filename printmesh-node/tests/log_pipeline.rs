use printmesh_node::logging::{LogPipeline, LogSettings};
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Sink that holds the writer until released, recording everything written.
#[derive(Clone, Default)]
struct GatedSink {
    open: Arc<(Mutex<bool>, Condvar)>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl GatedSink {
    fn release(&self) {
        let (lock, cvar) = &*self.open;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for GatedSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.open;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
        self.written.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_blocked_writer_never_blocks_producers() {
    let sink = GatedSink::default();
    let pipeline = Arc::new(LogPipeline::new());
    assert!(pipeline.initialize(
        LogSettings {
            capacity: 4,
            max_line_length: 64,
        },
        Box::new(sink.clone()),
    ));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let handle = pipeline.handle();
            thread::spawn(move || {
                (0..250)
                    .filter(|i| handle.log(format_args!("producer {p} line {i}")))
                    .count()
            })
        })
        .collect();
    let accepted: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();

    let stats = pipeline.stats();
    assert_eq!(stats.enqueued as usize, accepted);
    assert_eq!(stats.enqueued + stats.dropped(), 1000);
    assert!(stats.dropped_full > 0);

    sink.release();
    assert!(pipeline.flush(Duration::from_secs(5)));
    let stats = pipeline.stats();
    assert_eq!(stats.written, stats.enqueued);
    assert_eq!(sink.lines().len() as u64, stats.written);
}

#[test]
fn test_lines_are_never_interleaved() {
    let sink = GatedSink::default();
    sink.release();
    let pipeline = Arc::new(LogPipeline::new());
    pipeline.initialize(
        LogSettings {
            capacity: 64,
            max_line_length: 128,
        },
        Box::new(sink.clone()),
    );

    let mut isr = pipeline.isr_logger(4);
    let task = {
        let handle = pipeline.handle();
        thread::spawn(move || {
            for i in 0..200 {
                handle.log(format_args!("task {:04} {}", i, "t".repeat(40)));
            }
        })
    };
    for i in 0..200 {
        let mut frame = isr.frame();
        frame.log(format_args!("isr {:04} {}", i, "i".repeat(40)));
    }
    task.join().unwrap();

    assert!(pipeline.flush(Duration::from_secs(5)));
    let lines = sink.lines();
    assert_eq!(lines.len() as u64, pipeline.stats().written);
    for line in &lines {
        let well_formed = (line.starts_with("task ") && line.ends_with(&"t".repeat(40)))
            || (line.starts_with("isr ") && line.ends_with(&"i".repeat(40)));
        assert!(well_formed, "corrupted line: {line}");
    }

    // FIFO per producer
    let task_order: Vec<&String> = lines.iter().filter(|l| l.starts_with("task ")).collect();
    let mut sorted = task_order.clone();
    sorted.sort();
    assert_eq!(task_order, sorted);
}

#[test]
fn test_overlong_line_truncated_to_limit() {
    let sink = GatedSink::default();
    sink.release();
    let pipeline = LogPipeline::new();
    pipeline.initialize(
        LogSettings {
            capacity: 8,
            max_line_length: 40,
        },
        Box::new(sink.clone()),
    );

    pipeline.handle().log(format_args!("{}", "x".repeat(500)));
    let mut isr = pipeline.isr_logger(1);
    isr.frame().log(format_args!("{}", "y".repeat(500)));
    assert!(pipeline.flush(Duration::from_secs(2)));

    let lines = sink.lines();
    assert_eq!(lines.len(), 2);
    for line in lines {
        assert_eq!(line.len(), 40);
        assert!(line.ends_with("..."));
    }
}

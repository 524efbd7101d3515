use printmesh_node::logging::{LogPipeline, LogSettings};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::io;
use std::time::Duration;

/// Counts heap allocations per thread while counting is switched on.
struct CountingAlloc;

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn record() {
    if COUNTING.try_with(Cell::get).unwrap_or(false) {
        let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
    }
}

fn allocations() -> usize {
    ALLOCATIONS.with(Cell::get)
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record();
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

#[test]
fn test_interrupt_logging_never_allocates() {
    let pipeline = LogPipeline::new();
    assert!(pipeline.initialize(
        LogSettings {
            capacity: 64,
            max_line_length: 96,
        },
        Box::new(io::sink()),
    ));
    let mut isr = pipeline.isr_logger(4);
    let iterations = 5_000u32;
    let mut accepted = 0u32;

    COUNTING.with(|c| c.set(true));
    for i in 0..iterations {
        {
            let mut frame = isr.frame();
            if frame.log(format_args!("edge {} level {}", i, i % 2)) {
                accepted += 1;
            }
        }
        // Hand the pool back every few frames so every frame gets a buffer
        if i % 4 == 3 {
            assert!(pipeline.flush(Duration::from_secs(2)));
        }
    }
    COUNTING.with(|c| c.set(false));

    assert_eq!(allocations(), 0, "heap allocations while logging from the handler");
    assert_eq!(accepted, iterations);
    assert!(pipeline.flush(Duration::from_secs(2)));
    assert_eq!(pipeline.stats().written, u64::from(iterations));
    assert_eq!(isr.available(), isr.pool_size());
}

#[test]
fn test_overflowing_line_stays_in_reserved_buffer() {
    let pipeline = LogPipeline::new();
    assert!(pipeline.initialize(
        LogSettings {
            capacity: 8,
            max_line_length: 24,
        },
        Box::new(io::sink()),
    ));
    let long = "y".repeat(500);
    let mut isr = pipeline.isr_logger(1);

    COUNTING.with(|c| c.set(true));
    let queued = isr.frame().log(format_args!("{long}"));
    COUNTING.with(|c| c.set(false));

    assert!(queued);
    assert_eq!(allocations(), 0);
}

#![allow(dead_code)]

use admpi_rs::{AdComm, LocalWorld, Tape};
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

/// Installs a log subscriber once per test binary. Filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runs `body` on `size` rank threads, each with its own tape, and returns the results
/// in rank order.
pub fn run_ranks<F, R>(size: usize, body: F) -> Vec<R>
where
    F: Fn(AdComm<Tape>, Tape) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    init_tracing();
    let body = Arc::new(body);
    let handles: Vec<_> = LocalWorld::new(size)
        .into_iter()
        .map(|endpoint| {
            let body = body.clone();
            thread::spawn(move || {
                let tape = Tape::new();
                let comm = AdComm::new(endpoint.into_comm(), tape.clone());
                body(comm, tape)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("rank thread panicked"))
        .collect()
}

/// Seeds `seeds` on the given indices and runs the reverse sweep.
pub fn reverse(tape: &Tape, seeds: &[(u32, f64)]) {
    tape.set_passive();
    for &(index, seed) in seeds {
        tape.set_gradient(index, seed);
    }
    tape.evaluate().unwrap();
}

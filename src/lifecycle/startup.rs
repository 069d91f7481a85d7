//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the Tokio runtime from the thread configuration
//!
//! # Design Decisions
//! - Runtime worker threads are the I/O threads; each drives many connections
//! - The blocking pool is the worker pool handlers dispatch to, capped by
//!   `worker_threads`

use tokio::runtime::{Builder, Runtime};

use crate::config::ThreadConfig;

/// Build the multi-threaded runtime the server runs on.
pub fn build_runtime(threads: &ThreadConfig) -> std::io::Result<Runtime> {
    let mut builder = Builder::new_multi_thread();
    builder
        .enable_all()
        .thread_name("sluice-io")
        .max_blocking_threads(threads.worker_threads.max(1));
    if threads.io_threads > 0 {
        builder.worker_threads(threads.io_threads);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_honours_thread_counts() {
        let runtime = build_runtime(&ThreadConfig {
            io_threads: 2,
            worker_threads: 4,
        })
        .unwrap();
        let answer = runtime.block_on(async { tokio::task::spawn_blocking(|| 42).await.unwrap() });
        assert_eq!(answer, 42);
    }
}

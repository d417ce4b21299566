//! Process-wide Tokio runtime backing the synchronous `Transport` API.
//!
//! The public operations in `transport.rs` are meant to read like the
//! POSIX-style calls the storage plugin dispatches (open/read/write/seek/
//! close), matching the concurrency model in §5 ("threads are OS threads
//! running in parallel"). `rusoto_s3` is async, so each synchronous call
//! bridges onto it with `Handle::block_on` against one shared multi-thread
//! runtime, the same shape `main.rs` builds
//! (`tokio::runtime::Builder::new_multi_thread`) — just built lazily
//! instead of once in `main`, since library code has no entry point of
//! its own to build it in.

use std::sync::OnceLock;

use tokio::runtime::Runtime;

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("s3-transport-worker")
            .build()
            .expect("failed to build tokio runtime")
    })
}

/// Runs `fut` to completion on the shared runtime, blocking the calling
/// thread. Safe to call from any thread, including ones spawned by the
/// caller to act as per-transport upload/download workers.
pub fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    runtime().handle().block_on(fut)
}

/// Returns a handle suitable for spawning background tasks on the shared
/// runtime from a plain `std::thread`.
pub fn handle() -> tokio::runtime::Handle {
    runtime().handle().clone()
}

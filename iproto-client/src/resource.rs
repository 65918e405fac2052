//! # Managed Resources
//!
//! Purpose: Record who owns a shared resource so shutdown only releases what
//! the client created itself.
//!
//! The I/O runtime is the main user: by default the client builds its own
//! multi-thread runtime, but a caller may hand in a handle to theirs, in
//! which case closing the client must leave that runtime running.

use std::fmt;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// A resource tagged with its owner.
pub enum ManagedResource<T> {
    /// Created by the client; released on close.
    Owned(T),
    /// Supplied by the caller; never released by the client.
    Borrowed(T),
}

impl<T> ManagedResource<T> {
    pub fn get(&self) -> &T {
        match self {
            ManagedResource::Owned(value) | ManagedResource::Borrowed(value) => value,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ManagedResource::Owned(_))
    }

    /// Runs `release` on an owned value; a borrowed value is only dropped.
    pub fn release<F: FnOnce(T)>(self, release: F) {
        if let ManagedResource::Owned(value) = self {
            release(value);
        }
    }
}

impl<T> fmt::Debug for ManagedResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedResource::Owned(_) => f.write_str("Owned(..)"),
            ManagedResource::Borrowed(_) => f.write_str("Borrowed(..)"),
        }
    }
}

/// Runtime driving socket I/O, heartbeat, and timers.
pub struct IoRuntime {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl IoRuntime {
    /// Builds an owned multi-thread runtime.
    pub fn owned(threads: usize) -> ClientResult<ManagedResource<IoRuntime>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("iproto-io")
            .enable_all()
            .build()
            .map_err(ClientError::Io)?;
        debug!(threads, "started owned io runtime");
        Ok(ManagedResource::Owned(IoRuntime {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        }))
    }

    /// Wraps a caller-supplied runtime handle.
    pub fn borrowed(handle: Handle) -> ManagedResource<IoRuntime> {
        ManagedResource::Borrowed(IoRuntime {
            handle,
            runtime: None,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stops worker threads without blocking the caller.
    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("shutting down owned io runtime");
            runtime.shutdown_background();
        }
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics; shut down instead.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn release_only_runs_for_owned() {
        let released = AtomicBool::new(false);
        ManagedResource::Borrowed(1).release(|_| released.store(true, Ordering::SeqCst));
        assert!(!released.load(Ordering::SeqCst));

        ManagedResource::Owned(1).release(|_| released.store(true, Ordering::SeqCst));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn owned_runtime_runs_tasks() {
        let resource = IoRuntime::owned(1).unwrap();
        assert!(resource.is_owned());
        let value = resource.get().handle().block_on(async { 40 + 2 });
        assert_eq!(value, 42);
        resource.release(IoRuntime::shutdown);
    }

    #[tokio::test]
    async fn borrowed_runtime_survives_release() {
        let resource = IoRuntime::borrowed(Handle::current());
        assert!(!resource.is_owned());
        resource.release(IoRuntime::shutdown);
        let joined = tokio::spawn(async { 7 }).await.unwrap();
        assert_eq!(joined, 7);
    }

    #[tokio::test]
    async fn owned_runtime_can_be_dropped_in_async_context() {
        let resource = IoRuntime::owned(1).unwrap();
        drop(resource);
    }
}

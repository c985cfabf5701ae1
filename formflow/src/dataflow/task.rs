//! Droppable task handle
//!
//! Ties the lifetime of a spawned loop to its owner: dropping the handle aborts
//! the task, so a store's dispatcher stops when the store goes away.

use std::future::Future;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct DroppableTask {
    handle: JoinHandle<()>,
    #[cfg(debug_assertions)]
    #[allow(dead_code)]
    creation_location: &'static std::panic::Location<'static>,
}

impl DroppableTask {
    /// Spawns `future` on the current tokio runtime.
    ///
    /// Panics when called outside of a runtime, like `tokio::spawn`.
    #[track_caller]
    pub fn start<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
            #[cfg(debug_assertions)]
            creation_location: std::panic::Location::caller(),
        }
    }
}

impl Drop for DroppableTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

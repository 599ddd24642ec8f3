//! Advertised window: bounds delivered but unsettled jobs per iterator

use hopper_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded in-flight budget shared by every consumer of one iterator
#[derive(Debug, Clone)]
pub struct Window {
    semaphore: Option<Arc<Semaphore>>,
}

/// One reserved slot. Returned to the window when dropped.
#[derive(Debug)]
pub struct WindowSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl Window {
    /// A window of `size` slots; zero means unbounded. Sizes past what a
    /// semaphore can count are clamped to [`Semaphore::MAX_PERMITS`].
    pub fn new(size: usize) -> Self {
        let size = size.min(Semaphore::MAX_PERMITS);
        let semaphore = (size > 0).then(|| Arc::new(Semaphore::new(size)));
        Self { semaphore }
    }

    /// Whether the window limits anything
    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Slots currently free, `None` when unbounded
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Wait for a free slot. Fails with [`Error::AlreadyClosed`] once the
    /// window is closed, including for callers already waiting.
    pub async fn acquire(&self) -> Result<WindowSlot> {
        match &self.semaphore {
            Some(semaphore) => {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::AlreadyClosed)?;
                Ok(WindowSlot {
                    _permit: Some(permit),
                })
            }
            None => Ok(WindowSlot { _permit: None }),
        }
    }

    /// Wake every waiter with [`Error::AlreadyClosed`]. Slots held by
    /// deliveries are still returned on settle.
    pub fn close(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::DfuError;

/// Time source for the blocking polling loops.
pub trait Clock: Send {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Cancellation token shared between the polling thread and its controller.
///
/// Polling loops check the token between iterations; a control transfer
/// already in flight is never interrupted.
#[derive(Clone, Debug, Default)]
pub struct Cancellable(Arc<AtomicBool>);

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(cancellable: Option<&Cancellable>) -> Result<(), DfuError> {
        match cancellable {
            Some(c) if c.is_cancelled() => Err(DfuError::Cancelled),
            _ => Ok(()),
        }
    }
}

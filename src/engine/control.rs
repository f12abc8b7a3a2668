use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Run-wide stop signal shared by the orchestrator, every VU and outside
/// callers such as the Ctrl-C handler.
#[derive(Debug, Default)]
pub struct RunControl {
    stopped: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to wind down. VUs finish their current iteration first.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Stop with a reason that ends up in the run report. The first reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

//! Guest notification collaborator.
//!
//! The engine signals the frontend through this seam; a real deployment
//! binds it to an event channel or irqfd. At most one [`EventChannel::notify`]
//! fires per drain cycle, however many responses that drain pushed.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Doorbell to the frontend.
pub trait EventChannel: Send + Sync {
    fn notify(&self);
}

/// [`EventChannel`] that only counts, for tests and embedders that poll.
#[derive(Default)]
pub struct CountingChannel {
    notifies: AtomicUsize,
}

impl CountingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_count(&self) -> usize {
        self.notifies.load(Ordering::SeqCst)
    }
}

impl EventChannel for CountingChannel {
    fn notify(&self) {
        self.notifies.fetch_add(1, Ordering::SeqCst);
    }
}

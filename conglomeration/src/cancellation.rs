use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender};

/// Cooperative cancellation shared by the worker pools and the aggregator.
///
/// Besides the flag, cancelling disconnects a channel so that a consumer blocked in
/// `crossbeam::select!` on [`CancellationToken::receiver`] wakes up.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Raises the signal. Returns `true` for the call that actually raised it.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        // A poisoned lock still holds a valid `Option`.
        let mut trigger = match self.inner.trigger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        trigger.take();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Becomes disconnected once the token is cancelled. Never yields a message.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crossbeam::channel::{select, RecvError};

    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.clone().cancel());
        assert!(token.is_cancelled());
        assert_eq!(token.receiver().recv(), Err(RecvError));
    }

    #[test]
    fn wakes_up_a_blocked_select() {
        let token = CancellationToken::new();
        let (_tx, rx) = bounded::<u32>(1);
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let woke_on_cancel = select! {
            recv(rx) -> _ => false,
            recv(token.receiver()) -> _ => true,
        };
        assert!(woke_on_cancel);
        handle.join().expect("canceller panicked");
    }
}

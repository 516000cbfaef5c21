//! Cooperative thread interruption.
//!
//! Every thread has an interrupt flag. Interrupting a thread sets the flag
//! and unparks it; code blocked in a peerlink call notices the flag and
//! forwards the interrupt to the peer. Application code running inside
//! an incoming call can poll [`is_interrupted`] to honor interrupts sent
//! by the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

struct InterruptState {
    flag: AtomicBool,
    thread: Thread,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState {
        flag: AtomicBool::new(false),
        thread: thread::current(),
    });
}

/// Handle that interrupts one thread.
#[derive(Clone)]
pub struct InterruptHandle(Arc<InterruptState>);

impl InterruptHandle {
    /// Sets the thread's interrupt flag and wakes it if parked.
    pub fn interrupt(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    pub fn thread(&self) -> &Thread {
        &self.0.thread
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("thread", &self.0.thread.name())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Handle for the calling thread.
pub fn current() -> InterruptHandle {
    CURRENT.with(|state| InterruptHandle(state.clone()))
}

/// Returns the calling thread's interrupt flag without clearing it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|state| state.flag.load(Ordering::SeqCst))
}

/// Returns and clears the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.flag.swap(false, Ordering::SeqCst))
}

/// Sets the calling thread's interrupt flag.
pub(crate) fn set_interrupted() {
    CURRENT.with(|state| state.flag.store(true, Ordering::SeqCst));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_interrupted_clears_flag() {
        let handle = current();
        handle.interrupt();
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn test_interrupt_wakes_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            tx.send(current()).unwrap();
            while !is_interrupted() {
                thread::park();
            }
            interrupted()
        });

        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.interrupt();
        assert!(worker.join().unwrap());
    }
}

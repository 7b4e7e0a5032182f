//! Write promises and their read-only futures.
//!
//! Operations flowing down a pipeline (`write`, `bind`, `connect`, `close`,
//! ...) each carry a [`ChannelPromise`]. The owning event loop resolves the
//! promise exactly once; everyone else observes it through a
//! [`ChannelFuture`] — either by registering a listener callback (run on the
//! resolving thread, usually the loop) or by blocking on
//! [`ChannelFuture::wait`] from outside the loop.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::ChannelError;

type Listener = Box<dyn FnOnce(&Result<(), ChannelError>) + Send>;

enum PromiseState {
    Pending(Vec<Listener>),
    Done(Result<(), ChannelError>),
}

struct PromiseShared {
    state: Mutex<PromiseState>,
    cond: Condvar,
}

/// The write side of a promise. Cloneable; the first resolution wins.
#[derive(Clone)]
pub struct ChannelPromise {
    shared: Arc<PromiseShared>,
}

/// The read side of a promise.
#[derive(Clone)]
pub struct ChannelFuture {
    shared: Arc<PromiseShared>,
}

impl ChannelPromise {
    /// Creates a linked promise/future pair.
    pub fn new() -> (ChannelPromise, ChannelFuture) {
        let shared = Arc::new(PromiseShared {
            state: Mutex::new(PromiseState::Pending(Vec::new())),
            cond: Condvar::new(),
        });
        (
            ChannelPromise {
                shared: Arc::clone(&shared),
            },
            ChannelFuture { shared },
        )
    }

    /// Another future observing this promise.
    pub fn future(&self) -> ChannelFuture {
        ChannelFuture {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Resolves successfully. Returns `false` if already resolved.
    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Resolves with `err`. Returns `false` if already resolved.
    pub fn fail(&self, err: ChannelError) -> bool {
        self.complete(Err(err))
    }

    fn complete(&self, result: Result<(), ChannelError>) -> bool {
        let listeners = {
            let mut state = self.shared.state.lock().expect("promise poisoned");
            match &mut *state {
                PromiseState::Done(_) => return false,
                PromiseState::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = PromiseState::Done(result.clone());
                    listeners
                }
            }
        };
        self.shared.cond.notify_all();
        for listener in listeners {
            listener(&result);
        }
        true
    }
}

impl ChannelFuture {
    /// Whether the promise has been resolved.
    pub fn is_done(&self) -> bool {
        matches!(
            &*self.shared.state.lock().expect("promise poisoned"),
            PromiseState::Done(_)
        )
    }

    /// The outcome, if resolved.
    pub fn result(&self) -> Option<Result<(), ChannelError>> {
        match &*self.shared.state.lock().expect("promise poisoned") {
            PromiseState::Done(result) => Some(result.clone()),
            PromiseState::Pending(_) => None,
        }
    }

    /// Registers a completion listener. Runs inline if the promise is
    /// already resolved; otherwise it runs on the resolving thread.
    pub fn add_listener(&self, listener: impl FnOnce(&Result<(), ChannelError>) + Send + 'static) {
        let result = {
            let mut state = self.shared.state.lock().expect("promise poisoned");
            match &mut *state {
                PromiseState::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                PromiseState::Done(result) => result.clone(),
            }
        };
        listener(&result);
    }

    /// Blocks until the promise resolves.
    pub fn wait(&self) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock().expect("promise poisoned");
        loop {
            if let PromiseState::Done(result) = &*state {
                return result.clone();
            }
            state = self.shared.cond.wait(state).expect("promise poisoned");
        }
    }

    /// Blocks up to `timeout`; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ChannelError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("promise poisoned");
        loop {
            if let PromiseState::Done(result) = &*state {
                return Some(result.clone());
            }
            let left = deadline.checked_duration_since(Instant::now())?;
            let (guard, timed_out) = self
                .shared
                .cond
                .wait_timeout(state, left)
                .expect("promise poisoned");
            state = guard;
            if timed_out.timed_out() {
                if let PromiseState::Done(result) = &*state {
                    return Some(result.clone());
                }
                return None;
            }
        }
    }
}

impl std::fmt::Debug for ChannelPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPromise")
            .field("done", &self.future().is_done())
            .finish()
    }
}

impl std::fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFuture")
            .field("result", &self.result().map(|r| r.is_ok()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_resolution_wins() {
        let (promise, future) = ChannelPromise::new();
        assert!(promise.succeed());
        assert!(!promise.fail(ChannelError::Closed));
        assert!(matches!(future.result(), Some(Ok(()))));
    }

    #[test]
    fn listeners_run_on_resolution() {
        let (promise, future) = ChannelPromise::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        future.add_listener(move |result| {
            assert!(result.is_ok());
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        promise.succeed();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Late listeners run inline.
        let h = Arc::clone(&hits);
        future.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_unblocks_across_threads() {
        let (promise, future) = ChannelPromise::new();
        let t = std::thread::spawn(move || future.wait());
        std::thread::sleep(Duration::from_millis(10));
        promise.fail(ChannelError::Closed);
        let result = t.join().unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[test]
    fn wait_timeout_expires() {
        let (_promise, future) = ChannelPromise::new();
        assert!(future.wait_timeout(Duration::from_millis(20)).is_none());
    }
}

//! The flush-promise notifier: resolves write promises in the exact order
//! their writes were enqueued, clocked by the cumulative count of bytes
//! that actually reached the wire.

use std::collections::VecDeque;

use seine::{ChannelError, ChannelPromise};

/// Checkpoints stay well below this; once the counter crosses it, every
/// stored checkpoint is rebased so the arithmetic never approaches
/// integer overflow.
const REBASE_THRESHOLD: u64 = 1 << 60;

struct Checkpoint {
    checkpoint: u64,
    promise: ChannelPromise,
}

/// Tracks cumulative flushed bytes against per-write checkpoints.
///
/// Each registered promise becomes due once `write_counter` reaches its
/// checkpoint (`counter-at-add + pending bytes`). Promises always resolve
/// in FIFO order — for two writes A then B, A's promise resolves strictly
/// before B's, whether by success or failure.
///
/// The counter resets whenever the queue drains and rebases at 2^60 with
/// all pending checkpoints adjusted, so relative order is preserved.
///
/// # Example
///
/// ```rust
/// use seine::ChannelPromise;
/// use seine_transport::FlushNotifier;
///
/// let mut notifier = FlushNotifier::new();
/// let (p, done) = ChannelPromise::new();
/// notifier.add(p, 10);
///
/// notifier.increase(4);
/// notifier.notify_success();
/// assert!(!done.is_done());
///
/// notifier.increase(6);
/// notifier.notify_success();
/// assert!(matches!(done.result(), Some(Ok(()))));
/// ```
#[derive(Default)]
pub struct FlushNotifier {
    write_counter: u64,
    checkpoints: VecDeque<Checkpoint>,
}

impl FlushNotifier {
    /// An empty notifier with a zero counter.
    pub fn new() -> FlushNotifier {
        FlushNotifier::default()
    }

    /// Registers `promise` to resolve after `pending` more bytes (counted
    /// from the current write counter) have been flushed.
    pub fn add(&mut self, promise: ChannelPromise, pending: u64) {
        let checkpoint = self.write_counter + pending;
        self.checkpoints.push_back(Checkpoint {
            checkpoint,
            promise,
        });
    }

    /// Advances the counter by `delta` newly flushed bytes.
    pub fn increase(&mut self, delta: u64) {
        self.write_counter += delta;
    }

    /// The current cumulative flushed-byte counter.
    pub fn write_counter(&self) -> u64 {
        self.write_counter
    }

    /// Number of promises still awaiting their checkpoint.
    pub fn pending(&self) -> usize {
        self.checkpoints.len()
    }

    /// Succeeds every promise whose checkpoint has been passed.
    pub fn notify_success(&mut self) {
        for promise in self.drain_due() {
            promise.succeed();
        }
    }

    /// Succeeds every due promise, then fails the remainder with `cause`,
    /// still in FIFO order.
    pub fn notify_failure(&mut self, cause: ChannelError) {
        let due = self.drain_due();
        let rest = self.drain_rest();
        for promise in due {
            promise.succeed();
        }
        for promise in rest {
            promise.fail(cause.clone());
        }
    }

    /// Two-cause failure: due promises fail with `head_cause` (they were
    /// partially transmitted), the remainder with `rest_cause`.
    pub fn notify_failure_split(&mut self, head_cause: ChannelError, rest_cause: ChannelError) {
        let due = self.drain_due();
        let rest = self.drain_rest();
        for promise in due {
            promise.fail(head_cause.clone());
        }
        for promise in rest {
            promise.fail(rest_cause.clone());
        }
    }

    /// Pops every checkpoint the counter has reached. Counter bookkeeping
    /// (reset on empty, rebase near overflow) happens here.
    ///
    /// Channel code uses the drain variants and resolves the returned
    /// promises after releasing its borrows, so promise listeners may
    /// safely re-enter the channel; additional notifications they trigger
    /// run on the next pass instead of re-entering this one.
    pub(crate) fn drain_due(&mut self) -> Vec<ChannelPromise> {
        let mut due = Vec::new();
        if self.checkpoints.is_empty() {
            self.write_counter = 0;
            return due;
        }

        let counter = self.write_counter;
        loop {
            let front = match self.checkpoints.front() {
                None => {
                    // Everything resolved: restart the clock.
                    self.write_counter = 0;
                    break;
                }
                Some(cp) => cp.checkpoint,
            };
            if front > counter {
                if counter > 0 && self.checkpoints.len() == 1 {
                    // Sole pending write: rebase it and restart the clock.
                    self.write_counter = 0;
                    self.checkpoints
                        .front_mut()
                        .expect("front vanished")
                        .checkpoint = front - counter;
                }
                break;
            }
            due.push(
                self.checkpoints
                    .pop_front()
                    .expect("front vanished")
                    .promise,
            );
        }

        if self.write_counter >= REBASE_THRESHOLD {
            let base = self.write_counter;
            self.write_counter = 0;
            for cp in &mut self.checkpoints {
                cp.checkpoint = cp.checkpoint.saturating_sub(base);
            }
        }
        due
    }

    /// Pops everything that is not yet due, FIFO.
    pub(crate) fn drain_rest(&mut self) -> Vec<ChannelPromise> {
        let rest = self.checkpoints.drain(..).map(|cp| cp.promise).collect();
        self.write_counter = 0;
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seine::ChannelFuture;

    fn promises(n: usize) -> (Vec<ChannelPromise>, Vec<ChannelFuture>) {
        (0..n).map(|_| ChannelPromise::new()).unzip()
    }

    #[test]
    fn chunked_flush_resolves_in_order() {
        let mut notifier = FlushNotifier::new();
        let (ps, fs) = promises(3);
        // Three writes of 10, 20 and 30 bytes: cumulative pending sizes.
        notifier.add(ps[0].clone(), 10);
        notifier.add(ps[1].clone(), 30);
        notifier.add(ps[2].clone(), 60);

        notifier.increase(10);
        notifier.notify_success();
        assert!(fs[0].is_done() && !fs[1].is_done() && !fs[2].is_done());

        notifier.increase(25);
        notifier.notify_success();
        assert!(fs[1].is_done() && !fs[2].is_done());

        notifier.increase(60);
        notifier.notify_success();
        assert!(fs[2].is_done());
    }

    #[test]
    fn resolution_order_is_fifo() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut notifier = FlushNotifier::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seq = Arc::new(AtomicUsize::new(0));
        let (ps, _fs) = promises(3);
        for (i, p) in ps.iter().enumerate() {
            notifier.add(p.clone(), (i as u64 + 1) * 10);
            let order = Arc::clone(&order);
            let seq = Arc::clone(&seq);
            p.future().add_listener(move |_| {
                order.lock().unwrap().push((i, seq.fetch_add(1, Ordering::SeqCst)));
            });
        }
        notifier.increase(100);
        notifier.notify_success();
        assert_eq!(order.lock().unwrap().as_slice(), [(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn counter_resets_when_queue_drains() {
        let mut notifier = FlushNotifier::new();
        let (p, f) = ChannelPromise::new();
        notifier.add(p, 5);
        notifier.increase(5);
        notifier.notify_success();
        assert!(f.is_done());
        assert_eq!(notifier.write_counter(), 0);
    }

    #[test]
    fn sole_pending_checkpoint_is_rebased() {
        let mut notifier = FlushNotifier::new();
        let (p, f) = ChannelPromise::new();
        notifier.increase(100);
        notifier.add(p, 50); // checkpoint 150
        notifier.notify_success();
        // Not yet due; the counter restarted and the checkpoint shrank.
        assert!(!f.is_done());
        assert_eq!(notifier.write_counter(), 0);
        notifier.increase(50);
        notifier.notify_success();
        assert!(matches!(f.result(), Some(Ok(()))));
    }

    #[test]
    fn rebase_near_overflow_preserves_pending_promises() {
        let mut notifier = FlushNotifier::new();
        let (done_p, done_f) = ChannelPromise::new();
        let (far_a_p, far_a_f) = ChannelPromise::new();
        let (far_b_p, far_b_f) = ChannelPromise::new();

        notifier.add(done_p, 10);
        notifier.increase(REBASE_THRESHOLD + 5);
        notifier.add(far_a_p, 100); // checkpoint: threshold + 105
        notifier.add(far_b_p, 200); // checkpoint: threshold + 205
        notifier.notify_success();

        assert!(done_f.is_done());
        assert!(!far_a_f.is_done() && !far_b_f.is_done());
        // Counter rebased below the threshold; both checkpoints shifted.
        assert_eq!(notifier.write_counter(), 0);

        notifier.increase(100);
        notifier.notify_success();
        assert!(matches!(far_a_f.result(), Some(Ok(()))));
        assert!(!far_b_f.is_done());
        notifier.increase(100);
        notifier.notify_success();
        assert!(matches!(far_b_f.result(), Some(Ok(()))));
    }

    #[test]
    fn failure_succeeds_due_and_fails_the_rest_in_order() {
        let mut notifier = FlushNotifier::new();
        let (ps, fs) = promises(3);
        notifier.add(ps[0].clone(), 10);
        notifier.add(ps[1].clone(), 30);
        notifier.add(ps[2].clone(), 60);

        notifier.increase(15);
        notifier.notify_failure(ChannelError::Closed);

        assert!(matches!(fs[0].result(), Some(Ok(()))));
        assert!(matches!(fs[1].result(), Some(Err(ChannelError::Closed))));
        assert!(matches!(fs[2].result(), Some(Err(ChannelError::Closed))));
    }

    #[test]
    fn split_failure_uses_both_causes() {
        let mut notifier = FlushNotifier::new();
        let (ps, fs) = promises(2);
        notifier.add(ps[0].clone(), 10);
        notifier.add(ps[1].clone(), 30);

        notifier.increase(10);
        notifier.notify_failure_split(
            ChannelError::protocol("partially written"),
            ChannelError::Closed,
        );

        assert!(matches!(fs[0].result(), Some(Err(ChannelError::Protocol(_)))));
        assert!(matches!(fs[1].result(), Some(Err(ChannelError::Closed))));
    }
}

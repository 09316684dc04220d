//! Destroy-delay scheduler.
//!
//! A single timer thread owns a deadline map; `schedule` and `cancel` are
//! cheap channel sends. The only user is the UNREFERENCED topic grace
//! period, which is cancelled on any transition out of that state and
//! otherwise fires exactly once.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Handle to one scheduled timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(pub u64);

type Callback = Box<dyn FnOnce() + Send>;

enum Command {
    Schedule {
        token: TimerToken,
        deadline: Instant,
        callback: Callback,
    },
    Cancel(TimerToken),
    Shutdown,
}

/// The scheduler. Dropping it stops the thread; pending timeouts are
/// discarded.
pub struct DestroyTimer {
    tx: Sender<Command>,
    next_token: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl DestroyTimer {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<Command>();
        let handle = std::thread::Builder::new()
            .name("relaymq-destroy-timer".to_string())
            .spawn(move || {
                let mut pending: BTreeMap<(Instant, TimerToken), Callback> = BTreeMap::new();
                loop {
                    let now = Instant::now();
                    // Fire everything due.
                    while let Some((&(deadline, token), _)) = pending.iter().next() {
                        if deadline > now {
                            break;
                        }
                        if let Some(callback) = pending.remove(&(deadline, token)) {
                            debug!(?token, "destroy timer fired");
                            callback();
                        }
                    }

                    let wait = pending
                        .keys()
                        .next()
                        .map(|(deadline, _)| deadline.saturating_duration_since(now));
                    let received = match wait {
                        Some(wait) => match rx.recv_timeout(wait) {
                            Ok(cmd) => Some(cmd),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => return,
                        },
                        None => match rx.recv() {
                            Ok(cmd) => Some(cmd),
                            Err(_) => return,
                        },
                    };

                    match received {
                        Some(Command::Schedule {
                            token,
                            deadline,
                            callback,
                        }) => {
                            pending.insert((deadline, token), callback);
                        }
                        Some(Command::Cancel(token)) => {
                            pending.retain(|&(_, t), _| t != token);
                        }
                        Some(Command::Shutdown) => return,
                        None => {}
                    }
                }
            })
            .expect("failed to spawn timer thread");

        Self {
            tx,
            next_token: AtomicU64::new(1),
            handle: Some(handle),
        }
    }

    /// Schedule `callback` to run once after `delay`.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let _ = self.tx.send(Command::Schedule {
            token,
            deadline: Instant::now() + delay,
            callback: Box::new(callback),
        });
        token
    }

    /// Cancel a scheduled timeout. A token whose callback already fired (or
    /// was never scheduled) is ignored.
    pub fn cancel(&self, token: TimerToken) {
        let _ = self.tx.send(Command::Cancel(token));
    }
}

impl Default for DestroyTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DestroyTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fires_once_after_delay() {
        let timer = DestroyTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        timer.schedule(Duration::from_millis(20), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let timer = DestroyTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let token = timer.schedule(Duration::from_millis(50), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel(token);

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_earlier_deadline_fires_first() {
        let timer = DestroyTimer::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o = order.clone();
        timer.schedule(Duration::from_millis(60), move || o.lock().push("late"));
        let o = order.clone();
        timer.schedule(Duration::from_millis(20), move || o.lock().push("early"));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }
}

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A one-shot latch that threads can wait on with a timeout.
///
/// Used as the readiness signal handed out by data sources and as the completion signal carried by
/// synchronous event-pipeline messages. Once set, a latch stays set forever.
#[derive(Clone, Default)]
pub struct Latch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Latch {
    pub fn new() -> Latch {
        Latch::default()
    }

    /// Set the latch and wake all waiters. Setting an already-set latch is a no-op.
    pub fn set(&self) {
        let mut fired = self
            .inner
            .0
            .lock()
            .expect("thread holding latch lock should not panic");
        *fired = true;
        self.inner.1.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .expect("thread holding latch lock should not panic")
    }

    /// Block until the latch is set or `timeout` elapses. Returns true if the latch was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut fired = self
            .inner
            .0
            .lock()
            .expect("thread holding latch lock should not panic");
        while !*fired {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .1
                .wait_timeout(fired, deadline - now)
                .expect("thread holding latch lock should not panic");
            fired = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_before_wait_returns_immediately() {
        let latch = Latch::new();
        latch.set();
        assert!(latch.wait_timeout(Duration::from_millis(0)));
    }

    #[test]
    fn wait_times_out_when_never_set() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        assert!(!latch.is_set());
    }

    #[test]
    fn wait_wakes_when_set_from_another_thread() {
        let latch = Latch::new();
        let remote = latch.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.set();
        });
        assert!(latch.wait_timeout(Duration::from_secs(5)));
    }
}

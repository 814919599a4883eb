use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cloneable stop signal. Sleeps taken through [`Shutdown::wait`] end early
/// once it is triggered.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `timeout`; returns `true` if shutdown was triggered before or
    /// during the wait. A timeout past the clock's range waits for shutdown only.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now().checked_add(timeout);
        let mut stopped = flag.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if cvar.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                None => cvar.wait(&mut stopped),
            }
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_without_trigger() {
        let s = Shutdown::new();
        let start = Instant::now();
        assert!(!s.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn trigger_wakes_waiters_early() {
        let s = Shutdown::new();
        let waiter = {
            let s = s.clone();
            thread::spawn(move || s.wait(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        s.trigger();
        assert!(waiter.join().unwrap());
        assert!(s.is_triggered());
        assert!(s.wait(Duration::from_secs(30)));
    }

    #[test]
    fn unbounded_wait_ends_on_trigger() {
        let s = Shutdown::new();
        let waiter = {
            let s = s.clone();
            thread::spawn(move || s.wait(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        s.trigger();
        assert!(waiter.join().unwrap());
    }
}

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Level-triggered stop flag shared by the manager and one worker.
///
/// Once set it stays set. `wait` doubles as an interruptible sleep for
/// backoff delays so a stop request never waits out a full backoff.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (flag, cvar) = &*self.inner;
        let mut set = flag.lock().unwrap_or_else(PoisonError::into_inner);
        *set = true;
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, returning early when the signal fires.
    /// Returns whether the signal is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut set = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = cvar
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            set = guard;
        }
        *set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_sticky_and_idempotent() {
        let signal = StopSignal::new();
        assert!(!signal.is_set());
        signal.set();
        signal.set();
        assert!(signal.is_set());
        assert!(signal.clone().is_set());
    }

    #[test]
    fn wait_times_out_when_unset() {
        let signal = StopSignal::new();
        let started = Instant::now();
        assert!(!signal.wait(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_wakes_on_set() {
        let signal = StopSignal::new();
        let setter = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        let started = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("setter thread");
    }
}

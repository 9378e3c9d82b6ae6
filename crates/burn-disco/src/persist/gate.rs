use std::sync::{Condvar, Mutex, PoisonError};

/// Marks when a sampling step is in flight
///
/// The sampling loop brackets each denoiser step with [`begin`](Self::begin)
/// and [`finish`](Self::finish). Persistence jobs call
/// [`wait_idle`](Self::wait_idle) before reading shared results.
#[derive(Debug, Default)]
pub struct SampleGate {
    busy: Mutex<bool>,
    idle: Condvar,
}

impl SampleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn finish(&self) {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.idle.notify_all();
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no step is in flight
    pub fn wait_idle(&self) {
        let guard = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .idle
            .wait_while(guard, |busy| *busy)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_idle_blocks_until_finish() {
        let gate = Arc::new(SampleGate::new());
        let released = Arc::new(AtomicBool::new(false));
        gate.begin();

        let waiter = {
            let gate = gate.clone();
            let released = released.clone();
            thread::spawn(move || {
                gate.wait_idle();
                released.load(Ordering::SeqCst)
            })
        };

        thread::sleep(Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        gate.finish();
        assert!(waiter.join().unwrap());
        assert!(!gate.is_busy());
    }
}

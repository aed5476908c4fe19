// Countdown timer driven by the caller's tick delta.
//
// Nothing in the transport reads the wall clock: time only advances when the
// owner calls `tick(dt)`. This keeps every endpoint deterministic under a
// fixed-timestep loop and lets tests fast-forward seconds in a single call.

/// A countdown that reaches "finished" once `interval` seconds of ticks have
/// elapsed since the last reset.
#[derive(Clone, Debug)]
pub struct Timer {
    interval: f64,
    remaining: f64,
}

impl Timer {
    /// A timer that starts with the full interval remaining.
    pub fn new(interval: f64) -> Self {
        Self {
            interval,
            remaining: interval,
        }
    }

    /// A timer that is already finished, so the first check fires at once.
    pub fn elapsed(interval: f64) -> Self {
        Self {
            interval,
            remaining: 0.0,
        }
    }

    pub fn tick(&mut self, dt: f64) {
        if self.remaining > 0.0 {
            self.remaining -= dt;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.remaining <= 0.0
    }

    pub fn reset(&mut self) {
        self.remaining = self.interval;
    }

    /// Finish immediately.
    pub fn expire(&mut self) {
        self.remaining = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finishes_after_interval() {
        let mut timer = Timer::new(1.0);
        timer.tick(0.5);
        assert!(!timer.is_finished());
        timer.tick(0.5);
        assert!(timer.is_finished());
    }

    #[test]
    fn elapsed_starts_finished() {
        let timer = Timer::elapsed(2.0);
        assert!(timer.is_finished());
    }

    #[test]
    fn reset_restores_full_interval() {
        let mut timer = Timer::new(1.0);
        timer.tick(5.0);
        assert!(timer.is_finished());
        timer.reset();
        assert!(!timer.is_finished());
        timer.tick(0.99);
        assert!(!timer.is_finished());
    }

    #[test]
    fn expire_finishes_immediately() {
        let mut timer = Timer::new(10.0);
        timer.expire();
        assert!(timer.is_finished());
    }
}

//! Leading+trailing debounce with a starvation bound
//!
//! Pure deadline bookkeeping; the engine's select loop owns the actual
//! timer. The first input of a window fires immediately (leading edge);
//! further inputs push the trailing deadline out by `interval`, never past
//! `window_start + max_wait`. When the deadline elapses the window closes
//! and the accumulated work fires once (trailing edge).

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Debounce {
    interval: Duration,
    max_wait: Duration,
    window_start: Option<Instant>,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_wait,
            window_start: None,
            deadline: None,
        }
    }

    /// Record an input at `now`. Returns true when the caller should fire
    /// the leading edge immediately.
    pub fn note_input(&mut self, now: Instant) -> bool {
        match self.window_start {
            None => {
                self.window_start = Some(now);
                self.deadline = Some(now + self.interval);
                true
            }
            Some(start) => {
                let cap = start + self.max_wait;
                self.deadline = Some((now + self.interval).min(cap));
                false
            }
        }
    }

    /// Current trailing deadline, if a window is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Close the window after its deadline elapsed. The next input starts
    /// a fresh window (and a fresh leading fire).
    pub fn close_window(&mut self) {
        self.window_start = None;
        self.deadline = None;
    }

    /// Cancel without firing (shutdown).
    pub fn cancel(&mut self) {
        self.close_window();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debounce() -> Debounce {
        Debounce::new(Duration::from_millis(1000), Duration::from_millis(5000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_input_fires_leading() {
        let mut d = debounce();
        assert!(d.note_input(Instant::now()));
        assert!(!d.note_input(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_deadline_extends_with_input() {
        let mut d = debounce();
        let t0 = Instant::now();
        d.note_input(t0);
        assert_eq!(d.deadline(), Some(t0 + Duration::from_millis(1000)));

        tokio::time::advance(Duration::from_millis(800)).await;
        d.note_input(Instant::now());
        assert_eq!(d.deadline(), Some(t0 + Duration::from_millis(1800)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_caps_deadline() {
        let mut d = debounce();
        let t0 = Instant::now();
        d.note_input(t0);
        // Sustained input keeps pushing the deadline, up to the cap.
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(900)).await;
            d.note_input(Instant::now());
        }
        assert_eq!(d.deadline(), Some(t0 + Duration::from_millis(5000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reopens_after_close() {
        let mut d = debounce();
        d.note_input(Instant::now());
        d.close_window();
        assert!(d.deadline().is_none());
        assert!(d.note_input(Instant::now()));
    }
}

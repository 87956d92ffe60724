use std::time::Duration;

/// Clock returning epoch milliseconds.
pub type NowFn = Box<dyn Fn() -> i64 + Send + Sync>;

/// Sliding cursor over CIS event time.
///
/// The next poll starts no later than the newest event already seen, so
/// consecutive polls overlap and late-indexed events are not skipped.
pub struct EventWindow {
    last_from: i64,
    last_to: i64,
    window_size: i64,
    now: NowFn,
}

impl EventWindow {
    pub fn new(window_size: Duration, now: NowFn) -> Self {
        let window_size = i64::try_from(window_size.as_millis()).unwrap_or(i64::MAX);
        Self { last_from: 0, last_to: 0, window_size, now }
    }

    pub fn with_system_clock(window_size: Duration) -> Self {
        Self::new(window_size, Box::new(subsync_core::now_millis))
    }

    pub fn next_from_time(&self) -> i64 {
        let from = (self.now)().saturating_sub(self.window_size).min(self.last_to);
        from.max(0)
    }

    pub fn update_from_time(&mut self, from: i64) { self.last_from = from; }

    pub fn update_to_time(&mut self, event_time: i64) {
        if event_time > self.last_to {
            self.last_to = event_time;
        }
    }

    pub fn last_from(&self) -> i64 { self.last_from }
    pub fn last_to(&self) -> i64 { self.last_to }
}

impl std::fmt::Debug for EventWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWindow")
            .field("last_from", &self.last_from)
            .field("last_to", &self.last_to)
            .field("window_size", &self.window_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(20 * 60);

    fn clock() -> (Arc<AtomicI64>, NowFn) {
        let now = Arc::new(AtomicI64::new(0));
        let n = now.clone();
        (now, Box::new(move || n.load(Ordering::SeqCst)))
    }

    #[test]
    fn never_negative() {
        let (_, f) = clock();
        assert_eq!(EventWindow::new(WINDOW, f).next_from_time(), 0);
    }

    #[test]
    fn first_poll_starts_at_zero_then_window_sized() {
        let (now, f) = clock();
        let mut ew = EventWindow::new(WINDOW, f);
        let midnight = 1_709_164_800_000;
        now.store(midnight, Ordering::SeqCst);
        let from = ew.next_from_time();
        assert_eq!(from, 0);
        ew.update_to_time(midnight - 1000);
        ew.update_from_time(from);

        let t = midnight + 15 * 60 * 1000;
        now.store(t, Ordering::SeqCst);
        assert_eq!(ew.next_from_time(), t - 20 * 60 * 1000);
    }

    #[test]
    fn to_time_only_moves_forward() {
        let (_, f) = clock();
        let mut ew = EventWindow::new(WINDOW, f);
        ew.update_to_time(50);
        ew.update_to_time(10);
        assert_eq!(ew.last_to(), 50);
    }
}

//! Events emitted by a run, and the cancellation flag a caller can raise

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
};

use log::debug;

/// Everything a run tells its caller.
///
/// Exactly one of [Event::Success] or [Event::Error] ends a run, and it is
/// always the last event sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    PreparationStatus(String),
    Progress { percentage: u8, message: String },
    Success,
    Error(String),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Success | Event::Error(_))
    }
}

/// Sends [Event]s while keeping percentages monotonic and refusing anything
/// after the terminal event.
pub struct Reporter {
    tx: Sender<Event>,
    last: u8,
    finished: bool,
}

impl Reporter {
    pub fn new(tx: Sender<Event>) -> Self {
        Self {
            tx,
            last: 0,
            finished: false,
        }
    }

    pub fn status(&mut self, message: impl Into<String>) {
        self.send(Event::PreparationStatus(message.into()));
    }

    /// Report `percentage`, clamped to 100 and never below the last value
    pub fn progress(&mut self, percentage: u8, message: impl Into<String>) {
        let percentage = percentage.min(100).max(self.last);
        self.last = percentage;
        self.send(Event::Progress {
            percentage,
            message: message.into(),
        });
    }

    /// Like [Reporter::progress], but drops the event unless the
    /// percentage actually moved. Used by byte-driven loops.
    pub fn advance(&mut self, percentage: u8, message: impl FnOnce() -> String) {
        if percentage.min(100) > self.last {
            self.progress(percentage, message());
        }
    }

    pub fn success(&mut self) {
        self.send(Event::Success);
        self.finished = true;
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.send(Event::Error(message.into()));
        self.finished = true;
    }

    fn send(&self, event: Event) {
        if self.finished {
            debug!("Dropping event after end of run: {event:?}");
            return;
        }
        // the caller may have stopped listening; the run still completes
        let _ = self.tx.send(event);
    }
}

/// Cooperative cancellation, checked at every suspension point of a run
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Linear map of `done / total` onto the `[start, end]` percentage band
pub fn scale(start: u8, end: u8, done: u64, total: u64) -> u8 {
    if total == 0 {
        return start;
    }
    let span = end.saturating_sub(start) as u64;
    let offset = (done.min(total) as u128 * span as u128 / total as u128) as u8;
    start + offset
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_progress_never_decreases() {
        let (tx, rx) = mpsc::channel();
        let mut reporter = Reporter::new(tx);
        reporter.progress(40, "download done");
        reporter.progress(30, "late update");
        reporter.progress(120, "overflow");
        drop(reporter);

        let percentages: Vec<u8> = rx
            .iter()
            .filter_map(|e| match e {
                Event::Progress { percentage, .. } => Some(percentage),
                _ => None,
            })
            .collect();
        assert_eq!(percentages, vec![40, 40, 100]);
    }

    #[test]
    fn test_nothing_after_terminal_event() {
        let (tx, rx) = mpsc::channel();
        let mut reporter = Reporter::new(tx);
        reporter.error("boom");
        reporter.progress(50, "ignored");
        reporter.success();
        drop(reporter);

        let events: Vec<Event> = rx.iter().collect();
        assert_eq!(events, vec![Event::Error("boom".into())]);
    }

    #[test]
    fn test_advance_only_on_change() {
        let (tx, rx) = mpsc::channel();
        let mut reporter = Reporter::new(tx);
        reporter.advance(5, || "a".into());
        reporter.advance(5, || "b".into());
        reporter.advance(6, || "c".into());
        drop(reporter);
        assert_eq!(rx.iter().count(), 2);
    }

    #[test]
    fn test_scale() {
        assert_eq!(scale(5, 40, 0, 100), 5);
        assert_eq!(scale(5, 40, 50, 100), 22);
        assert_eq!(scale(5, 40, 100, 100), 40);
        assert_eq!(scale(5, 40, 200, 100), 40);
        assert_eq!(scale(80, 100, 10, 0), 80);
    }
}

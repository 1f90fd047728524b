//! Progress indication for long-running target operations.
//!
//! Only one indicator is "foregrounded" at a time, tracked by an owner
//! token: operations nested under one that already owns the display get
//! hidden indicators, so inner reads don't fight the outer bar for the
//! terminal.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Handle to a (possibly hidden) progress indicator.
pub struct Progress {
    bar: ProgressBar,
    token: u64,
    foreground: bool,
}

impl Progress {
    /// Record `count` completed operations since the last update.
    pub fn inc(&self, count: u64) {
        self.bar.inc(count);
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Tracks which progress token currently owns the display.
#[derive(Default)]
pub(crate) struct ProgressTracker {
    owner: Option<u64>,
    next_token: u64,
}

impl ProgressTracker {
    pub(crate) fn create(&mut self, total: u64, desc: &str, unit: &str, show: bool) -> Progress {
        let token = self.next_token;
        self.next_token += 1;

        let foreground = show && self.owner.is_none();
        if foreground {
            self.owner = Some(token);
        }

        let bar = if foreground {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} {wide_bar:.cyan/blue} {pos}/{len}{prefix} ({eta})")
                    .unwrap(),
            );
            bar.set_prefix(format!(" {unit}"));
            bar.set_message(desc.to_string());
            bar.enable_steady_tick(Duration::from_millis(250));
            bar
        } else {
            ProgressBar::hidden()
        };

        Progress {
            bar,
            token,
            foreground,
        }
    }

    pub(crate) fn close(&mut self, progress: &Progress) {
        progress.finish();
        if progress.is_foreground() && self.owner == Some(progress.token()) {
            self.owner = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_foreground_owner() {
        let mut tracker = ProgressTracker::default();

        let outer = tracker.create(100, "outer", "B", true);
        assert!(outer.is_foreground());

        // Nested indicators stay hidden while the outer one is live
        let inner = tracker.create(10, "inner", "B", true);
        assert!(!inner.is_foreground());

        tracker.close(&inner);
        let inner2 = tracker.create(10, "inner2", "B", true);
        assert!(!inner2.is_foreground());
        tracker.close(&inner2);

        tracker.close(&outer);
        let next = tracker.create(10, "next", "B", true);
        assert!(next.is_foreground());
        tracker.close(&next);
    }

    #[test]
    fn test_hidden_when_suppressed() {
        let mut tracker = ProgressTracker::default();
        let p = tracker.create(10, "quiet", "B", false);
        assert!(!p.is_foreground());

        // A suppressed indicator must not claim the foreground
        let q = tracker.create(10, "loud", "B", true);
        assert!(q.is_foreground());
        tracker.close(&q);
        tracker.close(&p);
    }
}

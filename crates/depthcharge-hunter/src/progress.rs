//! Progress bar helper shared by the hunter implementations.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Create a search progress bar, or a hidden one when `show` is false.
pub(crate) fn progress_bar(total: u64, desc: &str, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {wide_bar:.cyan/blue} {pos}/{len} ({eta})")
            .unwrap(),
    );
    bar.set_message(desc.to_string());
    bar.enable_steady_tick(Duration::from_millis(250));
    bar
}

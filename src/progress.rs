use crate::recipients::Recipient;
use std::time::Duration;

/// Observer the dispatch loop notifies as a run advances.
///
/// Callbacks are synchronous and must not fail; whatever a reporter does with
/// the events is its own business.
pub trait ProgressReporter {
    /// `batch_index` counts from 1.
    fn on_batch_start(&mut self, batch_index: usize);

    fn on_item_sent(&mut self, sent: usize, total: usize, recipient: &Recipient);

    fn on_batch_pause(&mut self, pause: Duration);

    fn on_halted(&mut self, sent: usize, total: usize, reason: &str);

    fn on_completed(&mut self, sent: usize, total: usize);
}

/// Reports through the `log` facade.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn on_batch_start(&mut self, batch_index: usize) {
        log::info!("📦 Sending batch {batch_index}");
    }

    fn on_item_sent(&mut self, sent: usize, total: usize, recipient: &Recipient) {
        log::info!(
            "📧 [{sent}/{total}] {:.0}% sent to {} <{}> ({})",
            percent(sent, total),
            recipient.name,
            recipient.email,
            recipient.company
        );
    }

    fn on_batch_pause(&mut self, pause: Duration) {
        log::warn!("⏸ Waiting {} before next batch", describe(pause));
    }

    fn on_halted(&mut self, sent: usize, total: usize, reason: &str) {
        log::error!("❌ Stopped after {sent} of {total} email(s): {reason}");
    }

    fn on_completed(&mut self, sent: usize, total: usize) {
        log::info!("✅ Successfully sent {sent} of {total} email(s)");
    }
}

pub fn percent(sent: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    sent as f64 / total as f64 * 100.0
}

/// Human form of a pacing delay, e.g. `5 minute(s)` or `90 second(s)`.
pub fn describe(pause: Duration) -> String {
    let seconds = pause.as_secs();
    if seconds >= 60 && seconds % 60 == 0 {
        format!("{} minute(s)", seconds / 60)
    } else {
        format!("{seconds} second(s)")
    }
}

//! Progress bar for a single transfer.

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use transfer_core::TransferTask;

const TEMPLATE: &str =
    "{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Spawns a bar driven by the task's progress channel.
///
/// Returns `None` when `enabled` is false. The bar finishes on its own once
/// the task publishes its final snapshot; abort the handle to stop it early.
pub(crate) fn spawn_progress_bar(
    enabled: bool,
    task: &TransferTask,
    label: String,
) -> Option<JoinHandle<()>> {
    if !enabled {
        return None;
    }
    let mut progress = task.watch_progress();
    Some(tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label);

        loop {
            let snapshot = *progress.borrow_and_update();
            bar.set_length(snapshot.total_bytes);
            bar.set_position(snapshot.bytes_transferred);
            if snapshot.is_complete() && snapshot.total_bytes > 0 {
                break;
            }
            if progress.changed().await.is_err() {
                break;
            }
        }

        bar.finish_and_clear();
    }))
}

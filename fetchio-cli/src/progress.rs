use indicatif::{ProgressBar, ProgressStyle};

use fetchio_engine::{ProgressSink, ProgressUpdate};

/// Renders engine progress on an indicatif byte bar. The engine throttles
/// and serializes `on_progress`, so the bar only ever moves forward.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:38.cyan/blue}] {bytes}/{total_bytes} ({msg})",
            )
            .expect("static progress template")
            .progress_chars("=>-"),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        if update.total_bytes > 0 {
            self.bar.set_length(update.total_bytes);
        }
        self.bar.set_position(update.downloaded_bytes);

        let mut msg = format!("{:.1} MiB/s", update.speed_mibps);
        if !update.active_files.is_empty() {
            let mut names = update.active_files.clone();
            names.sort();
            names.dedup();
            let shown = names
                .iter()
                .take(2)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if names.len() > 2 {
                msg = format!("{msg} | {shown}, +{}", names.len() - 2);
            } else {
                msg = format!("{msg} | {shown}");
            }
        }
        self.bar.set_message(msg);
    }

    fn on_file_complete(&self, path: &str, _bytes: u64) {
        self.bar.println(format!("done: {path}"));
    }

    fn on_error(&self, path: &str, error: &str) {
        self.bar.println(format!("failed: {path}: {error}"));
    }
}

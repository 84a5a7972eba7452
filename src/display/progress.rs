//! Progress rendering for long-running builds.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::build::{BuildTarget, ProgressEvent};

/// Create a styled progress bar.
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// One bar per build target, re-ranged on every phase change.
pub struct BuildProgress {
    multi: MultiProgress,
    bars: Vec<(BuildTarget, ProgressBar)>,
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Vec::new(),
        }
    }

    /// Apply one event to the bar of its target.
    pub fn observe(&mut self, event: &ProgressEvent) {
        let bar = self.bar_for(event.target);
        bar.set_length(event.total as u64);
        bar.set_position(event.completed.min(event.total) as u64);
        bar.set_message(format!("{} {}", event.target, event.phase));
    }

    /// Render events until the sending build finishes.
    pub async fn follow(&mut self, mut events: UnboundedReceiver<ProgressEvent>) {
        while let Some(event) = events.recv().await {
            self.observe(&event);
        }
    }

    pub fn finish(&self) {
        for (_, bar) in &self.bars {
            bar.finish_and_clear();
        }
    }

    fn bar_for(&mut self, target: BuildTarget) -> &ProgressBar {
        let index = match self.bars.iter().position(|(t, _)| *t == target) {
            Some(index) => index,
            None => {
                let bar = self.multi.add(create_progress_bar(0, &target.to_string()));
                self.bars.push((target, bar));
                self.bars.len() - 1
            }
        };
        &self.bars[index].1
    }
}

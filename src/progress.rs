use std::sync::Mutex;

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Per-slot status shared by concurrent tasks. Each task owns one slot index
/// and only touches the aggregator through [`Progress::update`].
pub struct Progress<S> {
    slots: Mutex<Vec<S>>,
}

impl<S: Clone> Progress<S> {
    pub fn new(initial: Vec<S>) -> Self {
        Self {
            slots: Mutex::new(initial),
        }
    }

    pub fn update(&self, slot: usize, f: impl FnOnce(&mut S)) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = slots.get_mut(slot) {
            f(s);
        }
    }

    pub fn snapshot(&self) -> Vec<S> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A bar for one concurrent task, labelled with its prefix.
pub fn task_bar(multi: &MultiProgress, label: &str, len: u64) -> Result<ProgressBar> {
    let pb = multi.add(ProgressBar::new(len));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:<24} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    pb.set_prefix(label.chars().take(24).collect::<String>());
    Ok(pb)
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::shared::FetchError;

/// Number of recent completions the ETA is averaged over.
const ETA_WINDOW: usize = 20;

/// Splits prefixes into batches whose comma-joined length stays within `max_len`.
/// A single prefix longer than `max_len` becomes a batch of its own.
pub fn chunk_prefixes(prefixes: &[String], max_len: usize) -> Vec<Vec<String>> {
    let mut chunks = Vec::new();
    let mut chunk: Vec<String> = Vec::new();
    let mut current_len = 0;

    for prefix in prefixes {
        let add_len = prefix.len() + usize::from(!chunk.is_empty());
        if current_len + add_len > max_len && !chunk.is_empty() {
            chunks.push(std::mem::take(&mut chunk));
            chunk.push(prefix.clone());
            current_len = prefix.len();
        } else {
            chunk.push(prefix.clone());
            current_len += add_len;
        }
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks
}

/// Completion counter with a progress bar and a moving-average ETA.
pub struct Progress {
    label: String,
    total: usize,
    bar: ProgressBar,
    completed: AtomicUsize,
    failed: AtomicUsize,
    recent: Mutex<VecDeque<Instant>>,
    started: Instant,
    report_every: usize,
}

impl Progress {
    pub fn new(label: &str, total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        bar.set_message(label.to_string());
        Self::with_bar(label, total, bar)
    }

    pub fn hidden(label: &str, total: usize) -> Self {
        Self::with_bar(label, total, ProgressBar::hidden())
    }

    fn with_bar(label: &str, total: usize, bar: ProgressBar) -> Self {
        Progress {
            label: label.to_string(),
            total,
            bar,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            recent: Mutex::new(VecDeque::with_capacity(ETA_WINDOW)),
            started: Instant::now(),
            report_every: 5,
        }
    }

    pub fn with_report_every(mut self, every: usize) -> Self {
        self.report_every = every.max(1);
        self
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn record(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() == ETA_WINDOW {
                recent.pop_front();
            }
            recent.push_back(Instant::now());
        }
        self.bar.inc(1);

        let done = self.completed() + self.failed();
        if done % self.report_every == 0 || done == self.total {
            let eta_min = self.eta().map_or(0.0, |d| d.as_secs_f64() / 60.0);
            info!(
                "{}: {}/{} done, {} failed, ETA {:.1} min",
                self.label,
                self.completed(),
                self.total,
                self.failed(),
                eta_min
            );
        }
    }

    /// Mean time per unit over the recent window.
    pub fn average_unit_time(&self) -> Option<Duration> {
        let done = self.completed() + self.failed();
        if done == 0 {
            return None;
        }
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        match (recent.front(), recent.back()) {
            (Some(first), Some(last)) if recent.len() >= 2 && last > first => {
                Some(last.duration_since(*first) / (recent.len() as u32 - 1))
            }
            _ => Some(self.started.elapsed() / done as u32),
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        let done = self.completed() + self.failed();
        let remaining = self.total.saturating_sub(done) as u32;
        self.average_unit_time().map(|avg| avg * remaining)
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
        info!(
            "{}: finished in {:.0}s, {} completed, {} failed",
            self.label,
            self.started.elapsed().as_secs_f64(),
            self.completed(),
            self.failed()
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveSummary {
    pub completed: usize,
    pub failed: usize,
    pub waves: usize,
    pub interrupted: bool,
}

/// Per-unit results of a wave run, index-aligned with the submitted units.
#[derive(Debug)]
pub struct WaveOutcome<T> {
    pub results: Vec<Option<T>>,
    pub summary: WaveSummary,
}

impl<T> WaveOutcome<T> {
    pub fn successes(self) -> impl Iterator<Item = T> {
        self.results.into_iter().flatten()
    }
}

/// Fixed-size worker pool that runs one wave of units to completion before the next.
#[derive(Debug, Clone)]
pub struct Waves {
    pub size: usize,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Waves {
    pub fn new(size: usize) -> Self {
        Waves {
            size: size.max(1),
            interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    /// Runs `worker` over `units` and hands each finished wave's successes, tagged with
    /// their unit index, to `on_wave` before the next wave starts.
    pub fn run<I, T, E, F, S>(
        &self,
        units: Vec<I>,
        progress: &Progress,
        worker: F,
        mut on_wave: S,
    ) -> Result<WaveSummary, E>
    where
        I: Send,
        T: Send,
        F: Fn(usize, I) -> Result<T, FetchError> + Sync,
        S: FnMut(Vec<(usize, T)>) -> Result<(), E>,
    {
        let mut summary = WaveSummary::default();
        let mut pending = units.into_iter().enumerate().peekable();

        while pending.peek().is_some() {
            if self.interrupted() {
                summary.interrupted = true;
                break;
            }
            let wave: Vec<(usize, I)> = pending.by_ref().take(self.size).collect();
            let worker = &worker;

            let results: Vec<(usize, Result<T, FetchError>)> = thread::scope(|scope| {
                let handles: Vec<_> = wave
                    .into_iter()
                    .map(|(idx, unit)| {
                        let handle = scope.spawn(move || {
                            let result = worker(idx, unit);
                            progress.record(result.is_ok());
                            result
                        });
                        (idx, handle)
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(idx, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            progress.record(false);
                            Err(FetchError::Transport("worker panicked".to_string()))
                        });
                        (idx, result)
                    })
                    .collect()
            });

            summary.waves += 1;
            let mut successes = Vec::with_capacity(results.len());
            for (idx, result) in results {
                match result {
                    Ok(value) => {
                        summary.completed += 1;
                        successes.push((idx, value));
                    }
                    Err(FetchError::Interrupted) => {
                        summary.failed += 1;
                        summary.interrupted = true;
                    }
                    Err(_) => summary.failed += 1,
                }
            }
            on_wave(successes)?;
        }

        Ok(summary)
    }

    /// Runs every unit and keeps the results in submission order.
    pub fn collect<I, T, F>(&self, units: Vec<I>, progress: &Progress, worker: F) -> WaveOutcome<T>
    where
        I: Send,
        T: Send,
        F: Fn(usize, I) -> Result<T, FetchError> + Sync,
    {
        let mut results: Vec<Option<T>> = (0..units.len()).map(|_| None).collect();
        let summary = self
            .run(units, progress, worker, |wave| {
                for (idx, value) in wave {
                    results[idx] = Some(value);
                }
                Ok::<(), std::convert::Infallible>(())
            })
            .unwrap_or_else(|never| match never {});
        WaveOutcome { results, summary }
    }
}

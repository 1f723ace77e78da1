// SionDL - Resumable Concurrent Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Progress sampling and reporting
//!
//! A single reporter task wakes on a fixed interval, samples the session-wide
//! transferred-bytes counter and invokes the caller's listener. The listener
//! is never wired into the write path — workers only bump atomic counters, so
//! a slow listener can never stall a transfer.

use crate::session::SessionProgress;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Progress snapshot handed to the listener on every sample
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub file_name: String,

    /// Bytes transferred since the previous sample
    pub bytes_delta: u64,

    /// Bytes transferred over the whole session (including resumed bytes)
    pub bytes_transferred: u64,

    /// Total size of the target, 0 when unknown
    pub total_size: u64,

    /// Completed chunks (generic) or segments written (HLS)
    pub units_done: u64,

    /// Planned chunks or total segments
    pub units_total: u64,

    /// Sliding-window average transfer speed
    pub bytes_per_sec: f64,
}

/// Callback type for progress updates
pub type ProgressListener = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Speed tracker with moving average
///
/// Uses a sliding window of position samples to smooth out network
/// fluctuations instead of reporting instantaneous rates.
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    window_duration: Duration,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    position: u64,
}

impl SpeedTracker {
    /// Create new speed tracker with default 10-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    /// Add a position sample (total bytes transferred so far)
    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();
        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current average speed in bytes per second
    pub fn average_speed(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        let first = self.samples.front().unwrap();
        let last = self.samples.back().unwrap();

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Interval sampler feeding a [`ProgressListener`]
pub struct ProgressReporter {
    pub file_name: String,
    pub total_size: u64,
    pub progress: Arc<SessionProgress>,
    pub listener: ProgressListener,
    pub interval: Duration,
}

/// Handle to a running reporter task
pub struct ReporterHandle {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ReporterHandle {
    /// Stop the reporter; a final sample is emitted before the task exits
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.await;
    }
}

impl ProgressReporter {
    /// Spawn the reporter task; it runs until [`ReporterHandle::stop`]
    pub fn spawn(self) -> ReporterHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut tracker = SpeedTracker::new();
            let mut last_sample = self.progress.transferred();
            tracker.add_position(last_sample);

            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so the first event
            // covers a full interval.
            ticker.tick().await;

            loop {
                let stopping = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = &mut stop_rx => true,
                };

                let transferred = self.progress.transferred();
                tracker.add_position(transferred);
                let event = ProgressEvent {
                    file_name: self.file_name.clone(),
                    bytes_delta: transferred.saturating_sub(last_sample),
                    bytes_transferred: transferred,
                    total_size: self.total_size,
                    units_done: self.progress.units_done(),
                    units_total: self.progress.units_total(),
                    bytes_per_sec: tracker.average_speed(),
                };
                last_sample = transferred;
                (self.listener)(event);

                if stopping {
                    break;
                }
            }
        });

        ReporterHandle { stop_tx, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_speed_tracker() {
        let mut tracker = SpeedTracker::new();

        tracker.add_position(0);
        thread::sleep(Duration::from_millis(100));
        tracker.add_position(100_000); // 100KB in 100ms ~ 1MB/s

        let speed = tracker.average_speed();
        assert!(speed > 700_000.0 && speed < 1_300_000.0, "speed {}", speed);
    }

    #[test]
    fn test_speed_tracker_needs_two_samples() {
        let mut tracker = SpeedTracker::new();
        assert_eq!(tracker.average_speed(), 0.0);
        tracker.add_position(10);
        assert_eq!(tracker.average_speed(), 0.0);
    }

    #[tokio::test]
    async fn test_reporter_emits_and_stops() {
        let progress = Arc::new(SessionProgress::new());
        progress.set_units(0, 4);

        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: ProgressListener = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });

        let reporter = ProgressReporter {
            file_name: "file.bin".to_string(),
            total_size: 1000,
            progress: Arc::clone(&progress),
            listener,
            interval: Duration::from_millis(10),
        };
        let handle = reporter.spawn();

        progress.advance(0, 250, 250);
        tokio::time::sleep(Duration::from_millis(50)).await;
        progress.advance(0, 600, 350);
        handle.stop().await;

        let events = events.lock().unwrap();
        assert!(!events.is_empty());
        let last = events.last().unwrap();
        assert_eq!(last.file_name, "file.bin");
        assert_eq!(last.bytes_transferred, 600);
        assert_eq!(last.total_size, 1000);
        assert_eq!(last.units_total, 4);
        // Deltas across all events sum to the total transferred.
        let sum: u64 = events.iter().map(|e| e.bytes_delta).sum();
        assert_eq!(sum, 600);
    }
}

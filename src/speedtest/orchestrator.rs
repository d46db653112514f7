use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::aggregator::{combined_speed_mbps, SnapshotAggregator};
use super::download::DownloadWorker;
use super::latency::LatencyTest;
use super::stability::StabilityDetector;
use super::upload::UploadWorker;
use super::{PhaseResult, ProgressEvent, TestPhase};
use crate::error::SpeedTestError;
use crate::settings::Settings;

// Phase-local mutable state, owned by the phase loop and touched only in
// its select arms.
#[derive(Debug, Clone, Copy)]
struct RunState {
    target: usize,
    last_speed_mbps: f64,
    started: Instant,
}

impl RunState {
    fn new(target: usize) -> Self {
        Self {
            target,
            last_speed_mbps: 0.0,
            started: Instant::now(),
        }
    }
}

/// Drives one measurement run: latency probes, then multi-connection
/// download and upload phases. Each phase method blocks until its stop
/// policy fires or the run is cancelled; the caller sequences phases.
pub struct SpeedTest {
    settings: Settings,
    running: AtomicBool,
    phase: Mutex<TestPhase>,
    cancel: watch::Sender<bool>,
}

impl SpeedTest {
    pub fn new(settings: Settings) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            settings,
            running: AtomicBool::new(false),
            phase: Mutex::new(TestPhase::Idle),
            cancel,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> TestPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: TestPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Requests abort of whatever phase is active. Idempotent and safe to
    /// call when idle; workers and the phase loop observe the signal, join,
    /// and the run lands back in `Idle` without an error.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn measure_latency(&self) -> Result<f64, SpeedTestError> {
        self.begin_phase(TestPhase::Latency)?;

        let client = match reqwest::Client::builder()
            .connect_timeout(self.settings.probe_timeout)
            .timeout(self.settings.probe_timeout)
            .build()
        {
            Ok(client) => client,
            Err(err) => return Err(self.fail_phase(err)),
        };

        let latency = LatencyTest::new(&self.settings)
            .run(&client, self.cancel.subscribe())
            .await;

        if *self.cancel.borrow() {
            self.set_phase(TestPhase::Idle);
        }
        info!(latency_ms = latency, "latency phase finished");
        self.running.store(false, Ordering::SeqCst);
        Ok(latency)
    }

    pub async fn measure_download<F>(&self, mut on_progress: F) -> Result<PhaseResult, SpeedTestError>
    where
        F: FnMut(ProgressEvent),
    {
        self.begin_phase(TestPhase::Download)?;

        let client = match reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .read_timeout(self.settings.read_timeout)
            .build()
        {
            Ok(client) => client,
            Err(err) => return Err(self.fail_phase(err)),
        };

        let aggregator = Arc::new(SnapshotAggregator::new());
        let detector = StabilityDetector::new(
            self.settings.stability_samples,
            self.settings.stability_threshold_pct,
        );

        let mut state = RunState::new(self.settings.min_connections);
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut next_worker_id = 0;
        for _ in 0..state.target {
            workers.push(self.spawn_download_worker(next_worker_id, &client, &aggregator));
            next_worker_id += 1;
        }

        let mut tick = interval(self.settings.progress_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitor = interval(self.settings.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        monitor.tick().await;

        let mut cancel = self.cancel.subscribe();
        let mut cancelled = *cancel.borrow();

        while !cancelled {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        cancelled = true;
                    }
                }
                _ = tick.tick() => {
                    let elapsed = state.started.elapsed();
                    self.emit_progress(&aggregator, &mut state, elapsed, &mut on_progress, |speed, state| {
                        let target = next_target(speed, state.target, self.settings.max_connections);
                        if target > state.target {
                            debug!(from = state.target, to = target, speed_mbps = speed, "raising connection target");
                            state.target = target;
                        }
                    });
                    if should_stop(
                        elapsed,
                        self.settings.min_duration,
                        self.settings.max_duration,
                        || detector.is_stable(&aggregator.snapshots()),
                    ) {
                        break;
                    }
                }
                _ = monitor.tick() => {
                    // Replace exited workers and grow towards the current
                    // target, comparing desired against actually-alive.
                    let alive = workers.iter().filter(|w| !w.is_finished()).count();
                    for _ in alive..state.target {
                        workers.push(self.spawn_download_worker(next_worker_id, &client, &aggregator));
                        next_worker_id += 1;
                    }
                }
            }
        }

        Ok(self
            .finish_phase(cancelled, TestPhase::Download, state, workers, &aggregator)
            .await)
    }

    pub async fn measure_upload<F>(&self, mut on_progress: F) -> Result<PhaseResult, SpeedTestError>
    where
        F: FnMut(ProgressEvent),
    {
        self.begin_phase(TestPhase::Upload)?;

        let aggregator = Arc::new(SnapshotAggregator::new());
        let worker_count = self
            .settings
            .upload_connections
            .min(self.settings.max_connections)
            .max(1);

        let mut state = RunState::new(worker_count);
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for id in 0..worker_count {
            let worker = UploadWorker::new(id, aggregator.clone(), &self.settings);
            workers.push(tokio::spawn(worker.run(self.cancel.subscribe())));
        }

        let mut tick = interval(self.settings.progress_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        let mut cancel = self.cancel.subscribe();
        let mut cancelled = *cancel.borrow();

        while !cancelled {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        cancelled = true;
                    }
                }
                _ = tick.tick() => {
                    let elapsed = state.started.elapsed();
                    self.emit_progress(&aggregator, &mut state, elapsed, &mut on_progress, |_, _| {});
                    if elapsed > self.settings.upload_duration {
                        break;
                    }
                }
            }
        }

        Ok(self
            .finish_phase(cancelled, TestPhase::Upload, state, workers, &aggregator)
            .await)
    }

    fn begin_phase(&self, phase: TestPhase) -> Result<(), SpeedTestError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SpeedTestError::PhaseActive);
        }
        if let Err(err) = self.settings.validate() {
            self.set_phase(TestPhase::Error);
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        self.cancel.send_replace(false);
        self.set_phase(phase);
        Ok(())
    }

    fn fail_phase(&self, err: reqwest::Error) -> SpeedTestError {
        self.set_phase(TestPhase::Error);
        self.running.store(false, Ordering::SeqCst);
        SpeedTestError::Client(err)
    }

    fn spawn_download_worker(
        &self,
        id: usize,
        client: &reqwest::Client,
        aggregator: &Arc<SnapshotAggregator>,
    ) -> JoinHandle<()> {
        let worker = DownloadWorker::new(id, client.clone(), aggregator.clone(), &self.settings);
        tokio::spawn(worker.run(self.cancel.subscribe()))
    }

    // One tick's read of the shared samples. Nothing is emitted while the
    // trailing window holds no completed snapshot time.
    fn emit_progress<F, S>(
        &self,
        aggregator: &SnapshotAggregator,
        state: &mut RunState,
        elapsed: Duration,
        on_progress: &mut F,
        mut on_speed: S,
    ) where
        F: FnMut(ProgressEvent),
        S: FnMut(f64, &mut RunState),
    {
        let now_ms = aggregator.elapsed_ms();
        let recent = aggregator.recent_snapshots(now_ms, self.settings.aggregation_window_ms);
        let window_duration_ms: u64 = recent.iter().map(|s| s.window_ms).sum();
        if window_duration_ms == 0 {
            return;
        }

        let speed = combined_speed_mbps(&recent);
        state.last_speed_mbps = speed;
        on_progress(ProgressEvent {
            speed_mbps: speed,
            bytes_transferred: aggregator.total_bytes(),
            elapsed_ms: elapsed.as_millis() as u64,
        });
        on_speed(speed, state);
    }

    // Stops every worker, waits for all of them to terminate, and only then
    // reports the phase as stopped with its final totals.
    async fn finish_phase(
        &self,
        cancelled: bool,
        phase: TestPhase,
        state: RunState,
        workers: Vec<JoinHandle<()>>,
        aggregator: &SnapshotAggregator,
    ) -> PhaseResult {
        self.cancel.send_replace(true);
        for worker in workers {
            if worker.await.is_err() {
                warn!("worker task panicked");
            }
        }

        let result = PhaseResult {
            speed_mbps: state.last_speed_mbps,
            total_bytes: aggregator.total_bytes(),
            elapsed_ms: state.started.elapsed().as_millis() as u64,
        };

        if cancelled {
            self.set_phase(TestPhase::Idle);
        } else if phase == TestPhase::Upload {
            self.set_phase(TestPhase::Complete);
        }
        info!(
            ?phase,
            cancelled,
            bytes = result.total_bytes,
            speed_mbps = result.speed_mbps,
            "phase stopped"
        );
        self.running.store(false, Ordering::SeqCst);
        result
    }
}

// The download scaling ladder. Monotonic: the target never shrinks within a
// run and never exceeds `max_connections`.
fn next_target(speed_mbps: f64, current: usize, max_connections: usize) -> usize {
    if speed_mbps > 50.0 && current < max_connections {
        (current + 2).min(max_connections)
    } else if speed_mbps > 10.0 && current < 5 {
        5.min(max_connections).max(current)
    } else if speed_mbps > 1.0 && current < 3 {
        3.min(max_connections).max(current)
    } else {
        current
    }
}

fn should_stop(
    elapsed: Duration,
    min_duration: Duration,
    max_duration: Duration,
    is_stable: impl FnOnce() -> bool,
) -> bool {
    elapsed > max_duration || (elapsed > min_duration && is_stable())
}

//! Workout session state machine.
//!
//! Tracks elapsed time from the clock rather than a tick counter, records
//! one data point per active second, and periodically writes a recovery
//! snapshot so a crashed process can offer to resume the ride.

use crate::error::Result;
use crate::workout::{format_duration, Workout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cadence of the elapsed-time tick
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A snapshot is written every this many recorded data points
const SNAPSHOT_EVERY_POINTS: usize = 10;

/// Snapshots older than this are discarded on restore
const SNAPSHOT_MAX_AGE_HOURS: i64 = 24;

/// One second of recorded telemetry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    /// Elapsed seconds at which the point was recorded
    pub timestamp_seconds: f64,
    /// Instantaneous power in watts
    pub power: u16,
    /// Heart rate in bpm, zero when no strap is connected
    pub heart_rate: u16,
    /// Cadence in rpm
    pub cadence: f64,
    /// Speed in m/s
    pub speed: f64,
    /// Distance ridden so far in meters
    pub cumulative_distance_m: f64,
}

/// Live values handed to [`WorkoutSession::record_data_point`] once per second
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveSample {
    /// Instantaneous power in watts
    pub power: u16,
    /// Heart rate in bpm
    pub heart_rate: u16,
    /// Cadence in rpm
    pub cadence: f64,
    /// Speed in m/s
    pub speed: f64,
}

/// Persistence collaborator for the recovery snapshot
pub trait SnapshotStore: Send + Sync {
    /// Writes the serialized snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`VeloError::Snapshot`] or [`VeloError::Io`] when the store
    /// cannot persist the blob.
    fn save(&self, snapshot: &str) -> Result<()>;

    /// Reads the serialized snapshot, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`VeloError::Snapshot`] or [`VeloError::Io`] when the store
    /// cannot be read.
    fn load(&self) -> Result<Option<String>>;

    /// Removes any stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`VeloError::Snapshot`] or [`VeloError::Io`] when the store
    /// cannot be cleared.
    fn clear(&self) -> Result<()>;
}

/// In-memory [`SnapshotStore`], used in tests and as a default
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blob: Mutex<Option<String>>,
}

impl MemorySnapshotStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// [`SnapshotStore`] backed by a single JSON file
#[derive(Debug)]
pub struct FileSnapshotStore {
    path: std::path::PathBuf,
}

impl FileSnapshotStore {
    /// Creates a store writing to `path`; the file is created on first save
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &str) -> Result<()> {
        std::fs::write(&self.path, snapshot)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &str) -> Result<()> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.to_string());
        Ok(())
    }

    fn load(&self) -> Result<Option<String>> {
        Ok(self
            .blob
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn clear(&self) -> Result<()> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Serialized recovery state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionSnapshot {
    is_active: bool,
    start_time: DateTime<Utc>,
    elapsed_seconds: f64,
    data_points: Vec<DataPoint>,
    workout: Workout,
    ftp: f64,
    is_paused: bool,
    last_distance: f64,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionState {
    workout: Option<Workout>,
    ftp: f64,
    is_active: bool,
    is_paused: bool,
    start: Option<Instant>,
    start_wall: Option<DateTime<Utc>>,
    paused_ms: f64,
    pause_started: Option<Instant>,
    offset_ms: f64,
    elapsed_seconds: f64,
    data_points: Vec<DataPoint>,
    distance_m: f64,
}

impl SessionState {
    /// Wall-clock-driven elapsed seconds at 0.1 s resolution. Robust to
    /// missed ticks since every call recomputes from the start instant.
    fn compute_elapsed(&self, now: Instant) -> f64 {
        let Some(start) = self.start else {
            return 0.0;
        };
        let active_ms =
            now.saturating_duration_since(start).as_millis() as f64 - self.paused_ms + self.offset_ms;
        ((active_ms / 100.0).round() / 10.0).max(0.0)
    }
}

struct SessionInner {
    store: Arc<dyn SnapshotStore>,
    state: Mutex<SessionState>,
    elapsed_tx: watch::Sender<f64>,
    tick: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Elapsed seconds as of this call. While the clock is running the
    /// cached value only advances on ticks, so reads between ticks
    /// recompute from the start instant.
    fn current_elapsed(&self) -> f64 {
        let mut state = self.lock();
        if state.is_active && !state.is_paused {
            state.elapsed_seconds = state.compute_elapsed(Instant::now());
        }
        state.elapsed_seconds
    }

    fn start_tick(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let elapsed = {
                    let mut state = inner.lock();
                    if !state.is_active || state.is_paused {
                        break;
                    }
                    state.elapsed_seconds = state.compute_elapsed(Instant::now());
                    state.elapsed_seconds
                };
                inner.elapsed_tx.send_replace(elapsed);
            }
        });
        if let Some(previous) = self
            .tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }

    fn stop_tick(&self) {
        if let Some(task) = self
            .tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// Snapshot failures never interrupt the ride.
    fn save_snapshot(&self) {
        let snapshot = {
            let state = self.lock();
            let (Some(workout), Some(start_wall)) = (state.workout.clone(), state.start_wall)
            else {
                return;
            };
            SessionSnapshot {
                is_active: state.is_active,
                start_time: start_wall,
                elapsed_seconds: state.elapsed_seconds,
                data_points: state.data_points.clone(),
                workout,
                ftp: state.ftp,
                is_paused: state.is_paused,
                last_distance: state.distance_m,
                saved_at: Utc::now(),
            }
        };
        match serde_json::to_string(&snapshot) {
            Ok(blob) => {
                if let Err(err) = self.store.save(&blob) {
                    warn!(error = %err, "snapshot save failed");
                }
            }
            Err(err) => warn!(error = %err, "snapshot serialization failed"),
        }
    }
}

/// The one workout session of the process
pub struct WorkoutSession {
    inner: Arc<SessionInner>,
}

impl WorkoutSession {
    /// Creates an idle session writing recovery snapshots to `store`
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                state: Mutex::new(SessionState::default()),
                elapsed_tx: watch::channel(0.0).0,
                tick: Mutex::new(None),
            }),
        }
    }

    /// Starts a workout. Returns false without disturbing the run when a
    /// session is already active.
    pub fn start(&self, workout: Workout, ftp: f64) -> bool {
        {
            let mut state = self.inner.lock();
            if state.is_active {
                return false;
            }
            *state = SessionState {
                workout: Some(workout),
                ftp,
                is_active: true,
                start: Some(Instant::now()),
                start_wall: Some(Utc::now()),
                ..SessionState::default()
            };
        }
        self.inner.elapsed_tx.send_replace(0.0);
        self.inner.start_tick();
        info!(ftp, "workout started");
        true
    }

    /// Pauses the running workout; no-op when idle or already paused
    pub fn pause(&self) {
        {
            let mut state = self.inner.lock();
            if !state.is_active || state.is_paused {
                return;
            }
            let now = Instant::now();
            state.elapsed_seconds = state.compute_elapsed(now);
            state.is_paused = true;
            state.pause_started = Some(now);
        }
        self.inner.stop_tick();
        self.inner.save_snapshot();
        debug!("workout paused");
    }

    /// Resumes a paused workout; no-op otherwise
    pub fn resume(&self) {
        {
            let mut state = self.inner.lock();
            if !state.is_active || !state.is_paused {
                return;
            }
            if let Some(pause_started) = state.pause_started.take() {
                state.paused_ms += Instant::now()
                    .saturating_duration_since(pause_started)
                    .as_millis() as f64;
            }
            state.is_paused = false;
        }
        self.inner.start_tick();
        self.inner.save_snapshot();
        debug!("workout resumed");
    }

    /// Ends the workout, keeping the recorded data for the summary
    pub fn stop(&self) {
        {
            let mut state = self.inner.lock();
            if !state.is_active {
                return;
            }
            // A paused session already cached its elapsed at pause time;
            // recomputing here would count the open pause interval.
            if !state.is_paused {
                state.elapsed_seconds = state.compute_elapsed(Instant::now());
            }
            state.is_active = false;
            state.is_paused = false;
        }
        self.inner.stop_tick();
        if let Err(err) = self.inner.store.clear() {
            warn!(error = %err, "snapshot clear failed");
        }
        info!("workout stopped");
    }

    /// Returns the session to idle, discarding all data and the snapshot
    pub fn reset(&self) {
        self.inner.stop_tick();
        *self.inner.lock() = SessionState::default();
        self.inner.elapsed_tx.send_replace(0.0);
        if let Err(err) = self.inner.store.clear() {
            warn!(error = %err, "snapshot clear failed");
        }
    }

    /// Rewrites the elapsed clock, used to skip ahead to a later interval.
    /// The running tick keeps producing consistent values afterwards.
    pub fn set_elapsed_seconds(&self, seconds: f64) {
        let elapsed = {
            let mut state = self.inner.lock();
            if !state.is_active {
                return;
            }
            let now = Instant::now();
            let current = state.compute_elapsed(now);
            state.offset_ms += (seconds - current) * 1000.0;
            state.elapsed_seconds = state.compute_elapsed(now);
            state.elapsed_seconds
        };
        self.inner.elapsed_tx.send_replace(elapsed);
    }

    /// Records one second of telemetry. No-op unless active and unpaused.
    ///
    /// Distance treats the sampled speed as constant over the one-second
    /// recording interval.
    pub fn record_data_point(&self, sample: LiveSample) {
        let save = {
            let mut state = self.inner.lock();
            if !state.is_active || state.is_paused {
                return;
            }
            state.elapsed_seconds = state.compute_elapsed(Instant::now());
            state.distance_m += sample.speed;
            let point = DataPoint {
                timestamp_seconds: state.elapsed_seconds,
                power: sample.power,
                heart_rate: sample.heart_rate,
                cadence: sample.cadence,
                speed: sample.speed,
                cumulative_distance_m: state.distance_m,
            };
            state.data_points.push(point);
            state.data_points.len() % SNAPSHOT_EVERY_POINTS == 0
        };
        if save {
            self.inner.save_snapshot();
        }
    }

    /// Restores a recent snapshot, paused, so the rider explicitly chooses
    /// to resume. Returns false when no usable snapshot exists; corrupt or
    /// stale snapshots are discarded.
    pub fn try_restore(&self) -> bool {
        let blob = match self.inner.store.load() {
            Ok(Some(blob)) => blob,
            Ok(None) => return false,
            Err(err) => {
                warn!(error = %err, "snapshot load failed");
                return false;
            }
        };
        let snapshot: SessionSnapshot = match serde_json::from_str(&blob) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "discarding corrupt snapshot");
                let _ = self.inner.store.clear();
                return false;
            }
        };
        let age = Utc::now().signed_duration_since(snapshot.saved_at);
        if !snapshot.is_active || age.num_hours() >= SNAPSHOT_MAX_AGE_HOURS {
            debug!(age_hours = age.num_hours(), "discarding stale snapshot");
            let _ = self.inner.store.clear();
            return false;
        }

        let now = Instant::now();
        {
            let mut state = self.inner.lock();
            if state.is_active {
                return false;
            }
            *state = SessionState {
                workout: Some(snapshot.workout),
                ftp: snapshot.ftp,
                is_active: true,
                is_paused: true,
                start: Some(now),
                start_wall: Some(snapshot.start_time),
                offset_ms: snapshot.elapsed_seconds * 1000.0,
                elapsed_seconds: snapshot.elapsed_seconds,
                data_points: snapshot.data_points,
                distance_m: snapshot.last_distance,
                pause_started: Some(now),
                paused_ms: 0.0,
            };
        }
        self.inner.elapsed_tx.send_replace(snapshot.elapsed_seconds);
        info!(elapsed = snapshot.elapsed_seconds, "workout restored from snapshot");
        true
    }

    /// Whether a workout is running or paused
    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active
    }

    /// Whether the active workout is paused
    pub fn is_paused(&self) -> bool {
        self.inner.lock().is_paused
    }

    /// Elapsed workout seconds, excluding paused time
    pub fn elapsed_seconds(&self) -> f64 {
        self.inner.current_elapsed()
    }

    /// Watch channel following the elapsed clock at tick resolution
    pub fn elapsed(&self) -> watch::Receiver<f64> {
        self.inner.elapsed_tx.subscribe()
    }

    /// Elapsed time formatted as M:SS
    pub fn formatted_elapsed(&self) -> String {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        format_duration(self.inner.current_elapsed().max(0.0) as u32)
    }

    /// Copy of the recorded data points
    pub fn data_points(&self) -> Vec<DataPoint> {
        self.inner.lock().data_points.clone()
    }

    /// Seconds of recorded active riding; one data point per second
    pub fn active_elapsed_seconds(&self) -> usize {
        self.inner.lock().data_points.len()
    }

    /// Distance ridden so far in meters
    pub fn distance_m(&self) -> f64 {
        self.inner.lock().distance_m
    }

    /// FTP in watts the session was started with
    pub fn ftp(&self) -> f64 {
        self.inner.lock().ftp
    }

    /// The workout being ridden, if a session exists
    pub fn workout(&self) -> Option<Workout> {
        self.inner.lock().workout.clone()
    }

    /// Whether the elapsed clock has run past the workout duration
    pub fn is_workout_complete(&self) -> bool {
        let elapsed = self.inner.current_elapsed();
        match &self.inner.lock().workout {
            Some(workout) => elapsed >= f64::from(workout.duration_seconds),
            None => false,
        }
    }
}

impl Drop for WorkoutSession {
    fn drop(&mut self) {
        self.inner.stop_tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workout::{Interval, IntervalNode};
    use tokio::time::{advance, Duration};

    fn workout() -> Workout {
        Workout {
            id: "w1".into(),
            name: "Test Ride".into(),
            duration_seconds: 180,
            intervals: vec![IntervalNode::Leaf(Interval {
                kind: "work".into(),
                duration: 180,
                power: Some(0.8),
                power_start: None,
                power_end: None,
            })],
        }
    }

    fn session() -> WorkoutSession {
        WorkoutSession::new(Arc::new(MemorySnapshotStore::new()))
    }

    fn sample(power: u16, speed: f64) -> LiveSample {
        LiveSample {
            power,
            heart_rate: 140,
            cadence: 90.0,
            speed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_is_excluded_from_elapsed() {
        let session = session();
        assert!(session.start(workout(), 200.0));

        advance(Duration::from_secs(5)).await;
        session.pause();
        advance(Duration::from_secs(5)).await;
        session.resume();
        advance(Duration::from_secs(3)).await;

        assert!((session.elapsed_seconds() - 8.0).abs() < 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_reads_are_fresh_between_ticks() {
        let session = session();
        session.start(workout(), 200.0);

        // Reads must not depend on the tick task having caught up.
        advance(Duration::from_millis(5230)).await;
        assert!((session.elapsed_seconds() - 5.2).abs() < 0.05);
        advance(Duration::from_millis(2070)).await;
        assert!((session.elapsed_seconds() - 7.3).abs() < 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn data_points_carry_fresh_timestamps() {
        let session = session();
        session.start(workout(), 200.0);

        advance(Duration::from_secs(7)).await;
        session.record_data_point(sample(200, 8.0));
        let points = session.data_points();
        assert!((points[0].timestamp_seconds - 7.0).abs() < 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_rejected_while_active() {
        let session = session();
        assert!(session.start(workout(), 200.0));
        assert!(!session.start(workout(), 250.0));
        assert!((session.ftp() - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn data_points_define_active_seconds() {
        let session = session();
        session.start(workout(), 200.0);
        for _ in 0..30 {
            advance(Duration::from_secs(1)).await;
            session.record_data_point(sample(200, 8.0));
        }
        assert_eq!(session.active_elapsed_seconds(), 30);
        assert_eq!(session.data_points().len(), 30);
        assert!((session.distance_m() - 240.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_is_suspended_while_paused() {
        let session = session();
        session.start(workout(), 200.0);
        session.record_data_point(sample(200, 8.0));
        session.pause();
        session.record_data_point(sample(200, 8.0));
        assert_eq!(session.active_elapsed_seconds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_rewrites_the_clock_consistently() {
        let session = session();
        session.start(workout(), 200.0);
        advance(Duration::from_secs(10)).await;
        session.set_elapsed_seconds(60.0);
        assert!((session.elapsed_seconds() - 60.0).abs() < 0.2);

        // The running tick keeps counting from the new value.
        advance(Duration::from_secs(5)).await;
        assert!((session.elapsed_seconds() - 65.0).abs() < 0.3);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_written_every_ten_points() {
        let store = Arc::new(MemorySnapshotStore::new());
        let session = WorkoutSession::new(store.clone());
        session.start(workout(), 200.0);

        for _ in 0..9 {
            session.record_data_point(sample(200, 8.0));
        }
        assert!(store.load().unwrap().is_none());
        session.record_data_point(sample(200, 8.0));
        assert!(store.load().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn restore_resumes_paused_within_24_hours() {
        let store = Arc::new(MemorySnapshotStore::new());
        {
            let session = WorkoutSession::new(store.clone());
            session.start(workout(), 200.0);
            advance(Duration::from_secs(30)).await;
            for _ in 0..10 {
                session.record_data_point(sample(200, 8.0));
            }
        }

        let revived = WorkoutSession::new(store);
        assert!(revived.try_restore());
        assert!(revived.is_active());
        assert!(revived.is_paused());
        assert_eq!(revived.active_elapsed_seconds(), 10);
        assert!(revived.elapsed_seconds() >= 29.9);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_is_discarded() {
        let store = Arc::new(MemorySnapshotStore::new());
        let session = WorkoutSession::new(store.clone());
        session.start(workout(), 200.0);
        for _ in 0..10 {
            session.record_data_point(sample(200, 8.0));
        }

        // Age the snapshot 25 hours by rewriting its savedAt field.
        let blob = store.load().unwrap().unwrap();
        let mut snapshot: serde_json::Value = serde_json::from_str(&blob).unwrap();
        let old = Utc::now() - chrono::Duration::hours(25);
        snapshot["savedAt"] = serde_json::json!(old);
        store.save(&snapshot.to_string()).unwrap();

        let revived = WorkoutSession::new(store.clone());
        assert!(!revived.try_restore());
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_snapshot_is_discarded() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.save("not json at all").unwrap();

        let session = WorkoutSession::new(store.clone());
        assert!(!session.try_restore());
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_data_and_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let session = WorkoutSession::new(store.clone());
        session.start(workout(), 200.0);
        for _ in 0..10 {
            session.record_data_point(sample(200, 8.0));
        }
        session.reset();

        assert!(!session.is_active());
        assert_eq!(session.active_elapsed_seconds(), 0);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_tracks_workout_duration() {
        let session = session();
        session.start(workout(), 200.0);
        assert!(!session.is_workout_complete());
        session.set_elapsed_seconds(180.0);
        assert!(session.is_workout_complete());
    }
}

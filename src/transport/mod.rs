//! The clock and dispatcher: a monotonic, tempo-aware priority queue of
//! callbacks.

mod worker_pool;

pub use worker_pool::ThreadPoolStats;

use crate::error::SchedulerError;
use crate::types::timed_event::Callback;
use crate::types::TimedEvent;
use crate::util::IdFactory;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use worker_pool::WorkerPool;

/// Jitter is classified against these thresholds into the severities the
/// dispatcher logs at.
const JITTER_GOOD_NS: i64 = 500_000;
const JITTER_ACCEPTABLE_NS: i64 = 2_000_000;
const JITTER_WARNING_NS: i64 = 5_000_000;

const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Observability snapshot of fire-time accuracy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterStats {
    /// Number of events whose jitter has been recorded.
    pub count: u64,
    /// Mean absolute jitter, in microseconds.
    pub avg_jitter_us: f64,
    /// Largest absolute jitter observed, in microseconds.
    pub max_jitter_us: f64,
}

#[derive(Debug, Default)]
struct JitterCounters {
    count: AtomicU64,
    sum_abs_ns: AtomicU64,
    max_abs_ns: AtomicU64,
}

impl JitterCounters {
    fn record(&self, jitter_ns: i64) {
        let abs_ns = jitter_ns.unsigned_abs();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_abs_ns.fetch_add(abs_ns, Ordering::Relaxed);
        self.max_abs_ns.fetch_max(abs_ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> JitterStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_abs_ns.load(Ordering::Relaxed);
        let max = self.max_abs_ns.load(Ordering::Relaxed);
        JitterStats {
            count,
            avg_jitter_us: if count == 0 {
                0.0
            } else {
                (sum as f64 / count as f64) / 1_000.0
            },
            max_jitter_us: max as f64 / 1_000.0,
        }
    }
}

/// Everything about the queue that must change atomically together: the
/// heap itself, and the tempo it's keyed against.
struct Clock {
    heap: BinaryHeap<Reverse<TimedEvent>>,
    bpm: f64,
    ns_per_beat: f64,
    start_time_ns: u64,
}

impl Clock {
    fn new(bpm: f64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            bpm,
            ns_per_beat: ns_per_beat(bpm),
            start_time_ns: 0,
        }
    }
}

fn ns_per_beat(bpm: f64) -> f64 {
    60.0 * 1_000_000_000.0 / bpm
}

/// The clock and dispatcher. Accepts `(beat, callback)` pairs and fires the
/// callback at the corresponding wall-clock instant, either inline
/// ("critical") or on a worker pool ("concurrent").
///
/// Construct with [`Transport::new`], call [`Transport::start`] before
/// scheduling anything, and [`Transport::stop`] when done.
///
/// Always held behind an `Arc`: the dispatcher thread started by
/// [`Transport::start`] needs to call back into the transport, so the
/// transport keeps a [`Weak`] reference to itself (set up with
/// [`Arc::new_cyclic`]) rather than requiring every caller to thread a
/// reference through, the same ownership discipline [`crate::Sequencer`]
/// uses for its own self-rescheduling callbacks.
pub struct Transport {
    this: Weak<Transport>,
    clock: Mutex<Clock>,
    running: AtomicBool,
    origin: Instant,
    ids: IdFactory,
    jitter: JitterCounters,
    stopped_beat: Mutex<f64>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Option<WorkerPool>>,
    max_workers: usize,
}

impl Transport {
    /// Constructs a transport at `initial_bpm` with a worker pool sized
    /// `max_workers`. Does not start the dispatcher.
    pub fn new(initial_bpm: f64, max_workers: usize) -> Result<Arc<Self>, SchedulerError> {
        if !(60.0..=300.0).contains(&initial_bpm) {
            return Err(SchedulerError::Config(format!(
                "initial_bpm {initial_bpm} is outside 60.0..=300.0"
            )));
        }
        if max_workers == 0 {
            return Err(SchedulerError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(Arc::new_cyclic(|weak| Self {
            this: weak.clone(),
            clock: Mutex::new(Clock::new(initial_bpm)),
            running: AtomicBool::new(false),
            origin: Instant::now(),
            ids: IdFactory::default(),
            jitter: JitterCounters::default(),
            stopped_beat: Mutex::new(0.0),
            dispatcher: Mutex::new(None),
            workers: Mutex::new(None),
            max_workers,
        }))
    }

    /// Builds a transport from a validated [`crate::SchedulerConfig`].
    pub fn from_config(config: &crate::SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        config.validate()?;
        Self::new(config.default_bpm, config.max_workers)
    }

    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// Starts the dispatcher thread and worker pool. A second call while
    /// already running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Transport::start called while already running; ignoring");
            return;
        }

        {
            let mut clock = self.clock.lock().unwrap();
            clock.start_time_ns = self.now_ns();
        }
        *self.workers.lock().unwrap() = Some(WorkerPool::start(self.max_workers));

        let transport = self
            .this
            .upgrade()
            .expect("Transport must be held behind an Arc to call start()");
        let handle = thread::Builder::new()
            .name("baton-dispatcher".to_string())
            .spawn(move || transport.dispatch_loop())
            .expect("failed to spawn dispatcher thread");
        *self.dispatcher.lock().unwrap() = Some(handle);
        log::info!("transport started at {:.1} bpm", self.clock.lock().unwrap().bpm);
    }

    /// Stops the dispatcher, awaits in-flight worker callbacks up to a 1s
    /// grace period, and clears the event queue.
    pub fn stop(&self) {
        // Snapshot the live beat before flipping `running` off: `current_beat`
        // reads `stopped_beat` once the transport is no longer running, so
        // computing it after the swap below would just assign `stopped_beat`
        // to itself.
        let beat = self.current_beat();
        if !self.running.swap(false, Ordering::SeqCst) {
            log::warn!("Transport::stop called while already stopped; ignoring");
            return;
        }

        *self.stopped_beat.lock().unwrap() = beat;

        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }

        if let Some(workers) = self.workers.lock().unwrap().take() {
            let grace = Duration::from_secs(1);
            let poll_interval = Duration::from_millis(10);
            let deadline = Instant::now() + grace;
            while workers.in_flight_count() > 0 && Instant::now() < deadline {
                thread::sleep(poll_interval);
            }
            if workers.in_flight_count() > 0 {
                log::warn!(
                    "{} worker callback(s) still in flight after 1s shutdown grace",
                    workers.in_flight_count()
                );
            }
            workers.shutdown();
        }

        self.clock.lock().unwrap().heap.clear();
        log::info!("transport stopped");
    }

    /// Equivalent to `stop(); current_beat = 0; start()` if running,
    /// otherwise just zeroes the beat.
    pub fn reset(&self) {
        let was_running = self.running.load(Ordering::SeqCst);
        if was_running {
            self.stop();
        }
        *self.stopped_beat.lock().unwrap() = 0.0;
        if was_running {
            self.start();
        }
    }

    /// Changes tempo, rescaling every pending event so its musical beat
    /// position is preserved. `start_time_ns` is left fixed; see §4.1.
    pub fn set_tempo(&self, bpm: f64) -> Result<(), SchedulerError> {
        if bpm <= 0.0 {
            return Err(SchedulerError::Validation(format!(
                "bpm {bpm} must be positive"
            )));
        }
        let now_ns = self.now_ns();
        let mut clock = self.clock.lock().unwrap();
        let old_ns_per_beat = clock.ns_per_beat;
        let new_ns_per_beat = ns_per_beat(bpm);
        let start_time_ns = clock.start_time_ns;

        let mut rescheduled = BinaryHeap::with_capacity(clock.heap.len());
        for Reverse(mut event) in clock.heap.drain() {
            if event.fire_at_ns > now_ns {
                let beat = (event.fire_at_ns - start_time_ns) as f64 / old_ns_per_beat;
                event.fire_at_ns = start_time_ns + (beat * new_ns_per_beat).round() as u64;
            }
            rescheduled.push(Reverse(event));
        }
        clock.heap = rescheduled;
        clock.bpm = bpm;
        clock.ns_per_beat = new_ns_per_beat;
        log::info!("tempo changed to {bpm:.2} bpm");
        Ok(())
    }

    /// Enqueues `callback` to run at `beat`, either on the worker pool
    /// (`concurrent = true`) or inline on the dispatcher thread
    /// (`concurrent = false`). Returns the new event's id, or `-1` if the
    /// transport isn't running.
    ///
    /// If the computed fire time has already passed, `callback` runs
    /// synchronously on the caller's thread instead of being enqueued.
    pub fn schedule_event(
        &self,
        beat: f64,
        callback: impl FnOnce() + Send + 'static,
        concurrent: bool,
    ) -> i64 {
        if !self.running.load(Ordering::SeqCst) {
            log::warn!("schedule_event called while transport is not running");
            return -1;
        }

        let now_ns = self.now_ns();
        let event_id = self.ids.mint();
        let fire_at_ns = {
            let clock = self.clock.lock().unwrap();
            clock.start_time_ns + (beat * clock.ns_per_beat).round() as u64
        };

        if fire_at_ns <= now_ns {
            run_callback(Box::new(callback), event_id);
            return event_id as i64;
        }

        let event = TimedEvent::new(fire_at_ns, event_id, concurrent, Box::new(callback));
        self.clock.lock().unwrap().heap.push(Reverse(event));
        event_id as i64
    }

    /// Equivalent to `schedule_event(beat, callback, false)`.
    pub fn schedule_critical_event(
        &self,
        beat: f64,
        callback: impl FnOnce() + Send + 'static,
    ) -> i64 {
        self.schedule_event(beat, callback, false)
    }

    /// Removes a pending event by id. A no-op if it's already fired or
    /// never existed. `O(n)` in the number of pending events.
    pub fn remove_event(&self, event_id: i64) {
        if event_id < 0 {
            return;
        }
        let event_id = event_id as u64;
        let mut clock = self.clock.lock().unwrap();
        let remaining: BinaryHeap<Reverse<TimedEvent>> = clock
            .heap
            .drain()
            .filter(|Reverse(e)| e.event_id != event_id)
            .collect();
        clock.heap = remaining;
    }

    /// The current position in the song, in beats. Monotonically
    /// non-decreasing while running at constant tempo.
    pub fn current_beat(&self) -> f64 {
        if !self.running.load(Ordering::SeqCst) {
            return *self.stopped_beat.lock().unwrap();
        }
        let clock = self.clock.lock().unwrap();
        let now_ns = self.now_ns();
        if now_ns <= clock.start_time_ns {
            0.0
        } else {
            (now_ns - clock.start_time_ns) as f64 / clock.ns_per_beat
        }
    }

    /// Whether the dispatcher and worker pool are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Rolling jitter statistics, updated by the dispatcher thread. Reads
    /// are advisory and may race with an in-progress update.
    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.snapshot()
    }

    /// A snapshot of worker pool activity. All-zero with `max_workers`
    /// reflecting configuration if the transport isn't running.
    pub fn thread_pool_stats(&self) -> ThreadPoolStats {
        match self.workers.lock().unwrap().as_ref() {
            Some(pool) => pool.stats(),
            None => ThreadPoolStats {
                active: 0,
                max_workers: self.max_workers,
                active_futures: 0,
            },
        }
    }

    fn dispatch_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let now_ns = self.now_ns();
            let ready = self.drain_ready(now_ns);

            for mut event in ready {
                let jitter_ns = now_ns as i64 - event.fire_at_ns as i64;
                self.jitter.record(jitter_ns);
                log_jitter(jitter_ns, event.event_id);

                let callback = event.callback.take().expect("event fires exactly once");
                if event.concurrent {
                    if let Some(pool) = self.workers.lock().unwrap().as_ref() {
                        pool.submit(callback);
                    }
                } else {
                    run_callback(callback, event.event_id);
                }
            }

            let wait_ns = self.next_wait_ns();
            match wait_ns {
                Some(ns) => adaptive_wait(ns, &self.running),
                None => thread::sleep(IDLE_SLEEP),
            }
        }
    }

    fn drain_ready(&self, now_ns: u64) -> Vec<TimedEvent> {
        let mut clock = self.clock.lock().unwrap();
        let mut ready = Vec::new();
        while let Some(Reverse(event)) = clock.heap.peek() {
            if event.fire_at_ns > now_ns {
                break;
            }
            let Reverse(event) = clock.heap.pop().unwrap();
            ready.push(event);
        }
        ready
    }

    fn next_wait_ns(&self) -> Option<i64> {
        let clock: MutexGuard<Clock> = self.clock.lock().unwrap();
        clock
            .heap
            .peek()
            .map(|Reverse(e)| e.fire_at_ns as i64 - self.now_ns() as i64)
    }
}

fn run_callback(callback: Callback, event_id: u64) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        log::error!("event {event_id} callback panicked: {}", describe_panic(&panic));
    }
}

fn describe_panic(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn log_jitter(jitter_ns: i64, event_id: u64) {
    let abs_ns = jitter_ns.abs();
    if abs_ns <= JITTER_GOOD_NS {
        log::debug!("event {event_id} jitter {jitter_ns}ns (good)");
    } else if abs_ns <= JITTER_ACCEPTABLE_NS {
        log::info!("event {event_id} jitter {jitter_ns}ns (acceptable)");
    } else if abs_ns <= JITTER_WARNING_NS {
        log::warn!("event {event_id} jitter {jitter_ns}ns (warning)");
    } else {
        log::error!("event {event_id} jitter {jitter_ns}ns (critical)");
    }
}

/// Sleeps for roughly `remaining_ns`, trading precision for CPU as the
/// deadline gets closer: coarse sleeps while there's slack, a busy-spin for
/// the last stretch. Bails early if `running` flips to `false`.
fn adaptive_wait(remaining_ns: i64, running: &AtomicBool) {
    if remaining_ns <= 0 || !running.load(Ordering::SeqCst) {
        return;
    }
    let remaining_ns = remaining_ns as u64;
    if remaining_ns > 10_000_000 {
        thread::sleep(Duration::from_millis(5));
    } else if remaining_ns > 1_000_000 {
        thread::sleep(Duration::from_micros(500));
    } else if remaining_ns > 100_000 {
        thread::sleep(Duration::from_micros(50));
    }
    // Below 100us, return immediately: the dispatcher loop recomputes the
    // deadline on its very next pass, which is a tighter busy-spin than any
    // sleep quantum could give us.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started_transport(bpm: f64) -> Arc<Transport> {
        let t = Transport::new(bpm, 2).unwrap();
        t.start();
        t
    }

    #[test]
    fn rejects_out_of_range_bpm() {
        assert!(Transport::new(10.0, 2).is_err());
        assert!(Transport::new(120.0, 0).is_err());
    }

    #[test]
    fn schedule_event_before_start_returns_sentinel() {
        let t = Transport::new(120.0, 2).unwrap();
        assert_eq!(t.schedule_event(1.0, || {}, true), -1);
    }

    #[test]
    fn past_due_event_runs_synchronously() {
        let t = started_transport(120.0);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let id = t.schedule_event(0.0, move || ran_clone.store(true, Ordering::SeqCst), true);
        assert!(id >= 0);
        assert!(ran.load(Ordering::SeqCst));
        t.stop();
    }

    #[test]
    fn future_event_fires_close_to_its_deadline() {
        let t = started_transport(120.0);
        let fired_at = Arc::new(Mutex::new(None));
        let fired_at_clone = Arc::clone(&fired_at);
        let scheduled_at = Instant::now();
        // beat 1.0 at 120bpm is 500ms
        t.schedule_event(
            1.0,
            move || {
                *fired_at_clone.lock().unwrap() = Some(Instant::now());
            },
            true,
        );

        thread::sleep(Duration::from_millis(700));
        let fired_at = fired_at.lock().unwrap().expect("event should have fired");
        let elapsed = fired_at.duration_since(scheduled_at);
        assert!(elapsed.as_millis() >= 490 && elapsed.as_millis() <= 520, "{elapsed:?}");
        t.stop();
    }

    #[test]
    fn removed_event_does_not_fire() {
        let t = started_transport(120.0);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let id = t.schedule_event(2.0, move || fired_clone.store(true, Ordering::SeqCst), true);
        t.remove_event(id);
        thread::sleep(Duration::from_millis(1100));
        assert!(!fired.load(Ordering::SeqCst));
        t.stop();
    }

    #[test]
    fn tempo_change_preserves_beat_position() {
        let t = started_transport(120.0);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        // beat 4 at 120bpm is 2s out.
        t.schedule_event(4.0, move || { count_clone.fetch_add(1, Ordering::SeqCst); }, true);
        thread::sleep(Duration::from_millis(200));
        t.set_tempo(60.0).unwrap();
        // remaining beats (4 - 0.4) at 60bpm take roughly twice as long in
        // wall time as the same beats would have at 120bpm.
        thread::sleep(Duration::from_millis(6200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        t.stop();
    }

    #[test]
    fn reset_zeroes_the_beat() {
        let t = started_transport(120.0);
        thread::sleep(Duration::from_millis(50));
        t.reset();
        assert!(t.current_beat() < 0.5);
        t.stop();
    }

    #[test]
    fn stop_snapshots_the_live_beat() {
        // 480bpm is 8 beats/sec, so 250ms of running is ~2.0 beats: enough
        // headroom above scheduling jitter to assert a non-trivial snapshot.
        let t = started_transport(480.0);
        thread::sleep(Duration::from_millis(250));
        t.stop();
        let stopped_beat = t.current_beat();
        assert!(stopped_beat > 1.0, "{stopped_beat}");
    }
}

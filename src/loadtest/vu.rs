//! Virtual user (VU) pool and task loop.
//!
//! Each VU is a tokio task that repeatedly runs one scenario iteration and
//! then idles for a random think time. The [`VirtualUserPool`] keeps the
//! number of looping VUs equal to the scheduler's target:
//!
//! - Scaling up spawns new VU tasks on a shared [`TaskTracker`].
//! - Scaling down retires the most recently spawned VUs first (LIFO) by
//!   cancelling their own child token. A retired VU finishes its current
//!   iteration, think time included, and exits at the iteration boundary.
//! - A hard stop token interrupts everything still running once the graceful
//!   stop window has expired. Interrupted iterations record nothing.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngExt, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::loadtest::scenario::ScenarioRunner;

/// Atomic counter tracking the number of VU tasks currently alive.
///
/// Lightweight wrapper around `Arc<AtomicU32>` for clone-friendly sharing
/// across VU tasks and the engine.
#[derive(Clone, Debug, Default)]
pub struct ActiveVuCounter(Arc<AtomicU32>);

impl ActiveVuCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Uniform think time range between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    min: Duration,
    max: Duration,
}

impl ThinkTime {
    /// Creates a range; the bounds are swapped if given in the wrong order.
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// No idle time between iterations.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Draws a think time uniformly from `[min, max]`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let nanos = rng.random_range(self.min.as_nanos()..=self.max.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Global iteration budget shared by every VU.
///
/// Slots are claimed with `fetch_add` before an iteration starts; the VU that
/// finds the budget spent cancels `exhausted` so the engine can stop the run.
#[derive(Debug)]
pub struct IterationBudget {
    limit: u64,
    claimed: AtomicU64,
    exhausted: CancellationToken,
}

impl IterationBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            claimed: AtomicU64::new(0),
            exhausted: CancellationToken::new(),
        }
    }

    /// Claims one iteration. Returns `false` once the limit is reached.
    pub fn try_claim(&self) -> bool {
        let prev = self.claimed.fetch_add(1, Ordering::Relaxed);
        if prev >= self.limit {
            self.exhausted.cancel();
            return false;
        }
        if prev + 1 == self.limit {
            // Last slot handed out; let the engine start stopping now.
            self.exhausted.cancel();
        }
        true
    }

    /// Cancelled once every iteration of the budget has been handed out.
    pub fn exhausted(&self) -> &CancellationToken {
        &self.exhausted
    }
}

/// State shared by every VU of a pool.
struct VuShared {
    runner: Arc<ScenarioRunner>,
    think: ThinkTime,
    budget: Option<Arc<IterationBudget>>,
    active: ActiveVuCounter,
}

/// A dynamically resized set of looping virtual users.
pub struct VirtualUserPool {
    shared: Arc<VuShared>,
    tracker: TaskTracker,
    hard_stop: CancellationToken,
    /// Retirement tokens of the non-retired VUs, oldest first.
    workers: Vec<(u32, CancellationToken)>,
    next_id: u32,
}

impl VirtualUserPool {
    pub fn new(runner: Arc<ScenarioRunner>, think: ThinkTime) -> Self {
        Self {
            shared: Arc::new(VuShared {
                runner,
                think,
                budget: None,
                active: ActiveVuCounter::new(),
            }),
            tracker: TaskTracker::new(),
            hard_stop: CancellationToken::new(),
            workers: Vec::new(),
            next_id: 0,
        }
    }

    /// Caps the total number of iterations across all VUs.
    ///
    /// Must be called before the first [`reconcile`](Self::reconcile).
    pub fn with_iteration_budget(mut self, budget: Arc<IterationBudget>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.budget = Some(budget);
        }
        self
    }

    /// Brings the number of non-retired VUs to `target`.
    ///
    /// Scaling up spawns immediately; scaling down only signals retirement,
    /// so [`live`](Self::live) may stay above `target` until the retiring
    /// VUs reach their iteration boundary.
    pub fn reconcile(&mut self, target: u32) {
        let running = self.active();
        if running < target {
            for _ in running..target {
                self.spawn_one();
            }
            tracing::debug!(from = running, to = target, "scaled up");
        } else if running > target {
            for _ in target..running {
                if let Some((vu_id, retire)) = self.workers.pop() {
                    retire.cancel();
                    tracing::debug!(vu_id, "retiring virtual user");
                }
            }
            tracing::debug!(from = running, to = target, "scaled down");
        }
    }

    fn spawn_one(&mut self) {
        let vu_id = self.next_id;
        self.next_id += 1;
        let retire = self.hard_stop.child_token();
        self.workers.push((vu_id, retire.clone()));
        // Counted here rather than inside the task so `live()` never lags a spawn.
        self.shared.active.increment();
        self.tracker.spawn(vu_loop(
            vu_id,
            self.shared.clone(),
            retire,
            self.hard_stop.clone(),
        ));
    }

    /// Number of VUs that have not been told to retire.
    pub fn active(&self) -> u32 {
        u32::try_from(self.workers.len()).unwrap_or(u32::MAX)
    }

    /// Number of VU tasks still running, retiring ones included.
    pub fn live(&self) -> u32 {
        self.shared.active.get()
    }

    /// Shared handle to the live VU counter.
    pub fn live_counter(&self) -> ActiveVuCounter {
        self.shared.active.clone()
    }

    /// Total VUs ever spawned by this pool.
    pub fn spawned(&self) -> u32 {
        self.next_id
    }

    /// Signals every VU to retire at its next iteration boundary.
    pub fn retire_all(&mut self) {
        self.reconcile(0);
    }

    /// Waits for every VU to exit.
    ///
    /// VUs get `grace` to finish their current iteration; whatever is still
    /// running afterwards is interrupted. Returns `true` if every VU finished
    /// within the grace period.
    pub async fn drain(&mut self, grace: Duration) -> bool {
        self.retire_all();
        self.tracker.close();
        let graceful = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !graceful {
            tracing::warn!(
                remaining = self.live(),
                "graceful stop expired, interrupting in-flight iterations"
            );
            self.hard_stop.cancel();
            self.tracker.wait().await;
        }
        graceful
    }
}

/// Main virtual user task loop.
///
/// Each pass: check retirement, claim an iteration from the budget (if any),
/// run one iteration, think, then record `iterations` and
/// `iteration_duration`. The live counter is decremented on every exit path.
async fn vu_loop(
    vu_id: u32,
    shared: Arc<VuShared>,
    retire: CancellationToken,
    hard_stop: CancellationToken,
) {
    tracing::debug!(vu_id, "virtual user started");
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let metrics = shared.runner.metrics().clone();

    loop {
        if retire.is_cancelled() {
            break;
        }
        if let Some(budget) = &shared.budget {
            if !budget.try_claim() {
                break;
            }
        }

        let started = Instant::now();
        tokio::select! {
            biased;
            _ = hard_stop.cancelled() => break,
            _ = shared.runner.run_iteration(&mut rng) => {}
        }

        let think = shared.think.sample(&mut rng);
        tokio::select! {
            biased;
            _ = hard_stop.cancelled() => break,
            _ = tokio::time::sleep(think) => {}
        }

        metrics.iterations.inc();
        metrics.iteration_duration.add_duration(started.elapsed());
    }

    shared.active.decrement();
    tracing::debug!(vu_id, "virtual user stopped");
}

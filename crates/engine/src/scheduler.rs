//! Periodic tasks run on pool workers.
//!
//! Tasks fire on a cron pattern or a fixed interval. A fire borrows a worker
//! through the same pool as requests but skips admission, deadlines, and the
//! cache. A fire that comes due while the previous run is still going is
//! skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use pool::WorkerPool;

use crate::config::ConfigError;
use crate::cron::CronPattern;

/// How long the loop sleeps when nothing is scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronPattern),
    Every(Duration),
}

impl Schedule {
    /// Next fire after `now`. `None` if the schedule can never fire again.
    fn next_fire(&self, now: Instant) -> Option<Instant> {
        match self {
            Schedule::Every(period) => Some(now + *period),
            Schedule::Cron(pattern) => {
                let wall = chrono::Local::now();
                let next = pattern.next_after(&wall)?;
                let wait = (next - wall).to_std().unwrap_or_default();
                Some(now + wait)
            }
        }
    }

    /// Whether a fire at local wall time `wall` is on schedule. A cron timer
    /// that woke before its minute, or across a clock change, is not.
    fn on_schedule(&self, wall: &NaiveDateTime) -> bool {
        match self {
            Schedule::Every(_) => true,
            Schedule::Cron(pattern) => pattern.matches(wall),
        }
    }
}

struct ScheduledTask {
    name: String,
    schedule: Schedule,
    next_fire: Option<Instant>,
    running: Arc<AtomicBool>,
    fired: Arc<AtomicU64>,
    skipped: u64,
}

pub struct PeriodicScheduler {
    pool: WorkerPool,
    tasks: Mutex<Vec<ScheduledTask>>,
    changed: Notify,
}

impl PeriodicScheduler {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            tasks: Mutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    /// Register `name` and return its registration index.
    pub fn add(&self, name: impl Into<String>, schedule: Schedule) -> usize {
        let name = name.into();
        let next_fire = schedule.next_fire(Instant::now());
        match next_fire {
            Some(at) => tracing::info!(
                "scheduled task '{}' ({:?}), first run in {}s",
                name,
                schedule,
                at.saturating_duration_since(Instant::now()).as_secs()
            ),
            None => tracing::warn!("task '{}' ({:?}) can never fire", name, schedule),
        }

        let index = {
            let mut tasks = self.tasks.lock();
            tasks.push(ScheduledTask {
                name,
                schedule,
                next_fire,
                running: Arc::new(AtomicBool::new(false)),
                fired: Arc::new(AtomicU64::new(0)),
                skipped: 0,
            });
            tasks.len() - 1
        };
        self.changed.notify_one();
        index
    }

    pub fn add_cron(&self, name: impl Into<String>, pattern: &str) -> Result<usize, ConfigError> {
        let pattern = CronPattern::parse(pattern)?;
        Ok(self.add(name, Schedule::Cron(pattern)))
    }

    pub fn add_interval(&self, name: impl Into<String>, period: Duration) -> usize {
        self.add(name, Schedule::Every(period.max(Duration::from_millis(1))))
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// How many times task `index` has been started.
    pub fn fired(&self, index: usize) -> Option<u64> {
        self.tasks
            .lock()
            .get(index)
            .map(|task| task.fired.load(Ordering::Relaxed))
    }

    fn time_to_next(&self, now: Instant) -> Duration {
        self.tasks
            .lock()
            .iter()
            .filter_map(|task| task.next_fire)
            .min()
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(IDLE_WAKE)
    }

    fn tick(&self) {
        self.tick_at(Instant::now(), chrono::Local::now().naive_local());
    }

    /// Start every task that is due and schedule its next fire.
    fn tick_at(&self, now: Instant, wall: NaiveDateTime) {
        let mut tasks = self.tasks.lock();
        for task in tasks.iter_mut() {
            let Some(due) = task.next_fire else {
                continue;
            };
            if due > now {
                continue;
            }
            task.next_fire = match task.schedule {
                // Interval tasks keep their cadence from the previous fire.
                Schedule::Every(period) => {
                    let next = due + period;
                    Some(if next > now { next } else { now + period })
                }
                Schedule::Cron(_) => task.schedule.next_fire(now),
            };

            if !task.schedule.on_schedule(&wall) {
                tracing::debug!("task '{}' woke off schedule at {}; rescheduled", task.name, wall);
                continue;
            }

            if task.running.swap(true, Ordering::AcqRel) {
                task.skipped += 1;
                tracing::debug!(
                    "task '{}' still running; skipped ({} so far)",
                    task.name,
                    task.skipped
                );
                continue;
            }
            task.fired.fetch_add(1, Ordering::Relaxed);

            let pool = self.pool.clone();
            let name = task.name.clone();
            let running = Arc::clone(&task.running);
            tokio::spawn(async move {
                let started = Instant::now();
                match pool.run_task(&name).await {
                    Ok(Ok(())) => tracing::debug!(
                        "task '{}' finished in {}ms",
                        name,
                        started.elapsed().as_millis()
                    ),
                    Ok(Err(err)) => tracing::error!("task '{}' failed: {}", name, err),
                    Err(err) => tracing::error!("task '{}' could not run: {}", name, err),
                }
                running.store(false, Ordering::Release);
            });
        }
    }

    /// Run the schedule loop until the returned task is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = scheduler.time_to_next(Instant::now());
                tokio::select! {
                    _ = scheduler.changed.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
                scheduler.tick();
            }
        })
    }

    pub fn stats(&self) -> serde_json::Value {
        let now = Instant::now();
        let tasks: Vec<serde_json::Value> = self
            .tasks
            .lock()
            .iter()
            .map(|task| {
                let schedule = match &task.schedule {
                    Schedule::Cron(pattern) => pattern.to_string(),
                    Schedule::Every(period) => format!("every {}ms", period.as_millis()),
                };
                serde_json::json!({
                    "name": task.name,
                    "schedule": schedule,
                    "next_fire_ms": task.next_fire.map(|at| at.saturating_duration_since(now).as_millis() as u64),
                    "running": task.running.load(Ordering::Relaxed),
                    "fired": task.fired.load(Ordering::Relaxed),
                    "skipped": task.skipped,
                })
            })
            .collect();
        serde_json::Value::Array(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool::{Handler, HandlerError, HandlerFactory, InvokeContext, NoopControl, PoolConfig, Reply, Request};
    use std::sync::atomic::AtomicUsize;

    struct TaskHandler {
        runs: Arc<AtomicUsize>,
        inside: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Handler for TaskHandler {
        fn invoke(&mut self, _request: &Request, _ctx: &mut InvokeContext) -> Result<Reply, HandlerError> {
            Err(HandlerError::failed("no routes"))
        }

        fn run_task(&mut self, task: &str, ctx: &mut InvokeContext) -> Result<(), HandlerError> {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if task == "slow" {
                ctx.sleep(Duration::from_millis(200))?;
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler() -> (Arc<PeriodicScheduler>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&runs), Arc::clone(&peak));
        let factory: HandlerFactory = Arc::new(move |_| {
            Box::new(TaskHandler {
                runs: Arc::clone(&r),
                inside: Arc::clone(&inside),
                peak: Arc::clone(&p),
            })
        });
        let config = PoolConfig {
            num_workers: 4,
            request_timeout_ms: 0,
            reclaim_grace_ms: 100,
            pin_workers: false,
        };
        let pool = WorkerPool::new(config, factory, Arc::new(NoopControl));
        (Arc::new(PeriodicScheduler::new(pool)), runs, peak)
    }

    #[tokio::test]
    async fn interval_task_fires_repeatedly() {
        let (scheduler, runs, _) = scheduler();
        let handle = scheduler.spawn();
        let index = scheduler.add_interval("tick", Duration::from_millis(50));
        assert_eq!(index, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert!(scheduler.fired(0).unwrap_or(0) >= 3);
    }

    #[tokio::test]
    async fn overlapping_fires_are_skipped() {
        let (scheduler, runs, peak) = scheduler();
        let handle = scheduler.spawn();
        scheduler.add_interval("slow", Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.abort();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert!(runs.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let (scheduler, _, _) = scheduler();
        assert!(scheduler.add_cron("bad", "61 * * * *").is_err());
        assert!(scheduler.is_empty());
    }

    fn wall(hour: u32, minute: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|date| date.and_hms_opt(hour, minute, 0))
            .expect("valid date")
    }

    fn force_due(scheduler: &PeriodicScheduler, index: usize, now: Instant) {
        scheduler.tasks.lock()[index].next_fire = Some(now);
    }

    #[tokio::test]
    async fn cron_fire_off_its_minute_is_rescheduled() {
        let (scheduler, _, _) = scheduler();
        let index = scheduler.add_cron("nightly", "30 3 * * *").expect("add");
        let now = Instant::now();
        force_due(&scheduler, index, now);

        scheduler.tick_at(now, wall(12, 30));
        assert_eq!(scheduler.fired(index), Some(0));
        let next = scheduler.tasks.lock()[index].next_fire;
        assert!(next.is_some_and(|at| at > now));

        force_due(&scheduler, index, now);
        scheduler.tick_at(now, wall(3, 30));
        assert_eq!(scheduler.fired(index), Some(1));
    }

    #[test]
    fn intervals_are_always_on_schedule() {
        assert!(Schedule::Every(Duration::from_secs(1)).on_schedule(&wall(12, 30)));
        let pattern = CronPattern::parse("30 3 * * *").expect("parse");
        assert!(Schedule::Cron(pattern).on_schedule(&wall(3, 30)));
        assert!(!Schedule::Cron(pattern).on_schedule(&wall(3, 31)));
    }

    #[tokio::test]
    async fn cron_task_is_scheduled_within_a_minute() {
        let (scheduler, _, _) = scheduler();
        scheduler.add_cron("every-minute", "* * * * *").expect("add");
        let wait = scheduler.time_to_next(Instant::now());
        assert!(wait <= Duration::from_secs(60));
        assert_eq!(scheduler.stats()[0]["schedule"], "* * * * *");
    }
}

//! Job acquisition: the loop that locks due jobs and hands them to the pool,
//! and the strategies deciding how long it idles between cycles.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use procengine_core::{EngineError, EngineResult};

use super::cmd::AcquireJobsCmd;
use super::executor::{ExecutorStats, JobDispatcher};
use crate::command::CommandExecutor;
use crate::config::JobExecutorConfig;

/// Message to a running acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionSignal {
    /// New jobs were committed; cut the current wait short.
    Hint,
    Shutdown,
}

/// What one acquisition cycle achieved, across all engines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub acquired: usize,
    pub lock_conflicts: usize,
    /// Engines whose acquisition returned a full page.
    pub full_pages: usize,
    /// Jobs the pool did not accept.
    pub rejected: usize,
    /// At least one engine failed to acquire.
    pub failed: bool,
}

impl AcquisitionReport {
    pub fn is_full(&self) -> bool {
        self.full_pages > 0
    }
}

/// Decides the wait before the next acquisition cycle.
pub trait AcquisitionStrategy: Send {
    fn name(&self) -> &str;

    fn next_wait(&mut self, report: &AcquisitionReport) -> Duration;
}

type StrategyFactory = Arc<dyn Fn(&JobExecutorConfig) -> Box<dyn AcquisitionStrategy> + Send + Sync>;

/// Acquisition strategies by name. The default registry knows `sequential`
/// and `fixed`.
#[derive(Clone)]
pub struct AcquisitionStrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl Default for AcquisitionStrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register(SEQUENTIAL_STRATEGY, |config| {
            Box::new(BackoffAcquisitionStrategy::from_config(config))
        });
        registry.register(FIXED_STRATEGY, |config| {
            Box::new(FixedAcquisitionStrategy::new(config.wait_time))
        });
        registry
    }
}

impl AcquisitionStrategyRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&JobExecutorConfig) -> Box<dyn AcquisitionStrategy> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn create(
        &self,
        name: &str,
        config: &JobExecutorConfig,
    ) -> EngineResult<Box<dyn AcquisitionStrategy>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            EngineError::validation(format!("unknown acquisition strategy '{name}'"))
        })?;
        Ok(factory(config))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl core::fmt::Debug for AcquisitionStrategyRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AcquisitionStrategyRegistry")
            .field("names", &self.names())
            .finish()
    }
}

pub const SEQUENTIAL_STRATEGY: &str = "sequential";
pub const FIXED_STRATEGY: &str = "fixed";

/// Adaptive waits.
///
/// A full page means more work is waiting, so the next cycle starts at once.
/// Empty cycles grow the wait geometrically up to `max_wait`. Lock conflicts
/// (other nodes competing for the same jobs) back off, when enabled, with a
/// deterministic jitter so competing nodes spread out.
#[derive(Debug, Clone)]
pub struct BackoffAcquisitionStrategy {
    wait_time: Duration,
    max_wait: Duration,
    factor: f64,
    backoff_time: Duration,
    max_backoff: Duration,
    idle_level: u32,
    backoff_level: u32,
}

impl BackoffAcquisitionStrategy {
    pub fn from_config(config: &JobExecutorConfig) -> Self {
        Self {
            wait_time: config.wait_time,
            max_wait: config.max_wait.max(config.wait_time),
            factor: config.wait_increase_factor,
            backoff_time: config.backoff_time,
            max_backoff: config.max_backoff.max(config.backoff_time),
            idle_level: 0,
            backoff_level: 0,
        }
    }

    fn grown(&self, base: Duration, level: u32, cap: Duration) -> Duration {
        let exp = self.factor.powi(level.saturating_sub(1).min(32) as i32);
        let secs = (base.as_secs_f64() * exp).min(cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

impl AcquisitionStrategy for BackoffAcquisitionStrategy {
    fn name(&self) -> &str {
        SEQUENTIAL_STRATEGY
    }

    fn next_wait(&mut self, report: &AcquisitionReport) -> Duration {
        if report.failed || report.rejected > 0 {
            self.idle_level = 0;
            return self.wait_time;
        }

        if report.lock_conflicts > 0 && !self.backoff_time.is_zero() {
            self.idle_level = 0;
            self.backoff_level += 1;
            let backoff = self.grown(self.backoff_time, self.backoff_level, self.max_backoff);
            let pseudo_random = ((self.backoff_level as f64 * 17.0) % 100.0) / 100.0;
            return backoff.mul_f64(0.5 + pseudo_random / 2.0);
        }
        self.backoff_level = self.backoff_level.saturating_sub(1);

        if report.is_full() {
            self.idle_level = 0;
            return Duration::ZERO;
        }
        if report.acquired == 0 {
            self.idle_level += 1;
            return self.grown(self.wait_time, self.idle_level, self.max_wait);
        }
        self.idle_level = 0;
        self.wait_time
    }
}

/// Always waits the configured time. Hints still cut the wait short.
#[derive(Debug, Clone)]
pub struct FixedAcquisitionStrategy {
    wait_time: Duration,
}

impl FixedAcquisitionStrategy {
    pub fn new(wait_time: Duration) -> Self {
        Self { wait_time }
    }
}

impl AcquisitionStrategy for FixedAcquisitionStrategy {
    fn name(&self) -> &str {
        FIXED_STRATEGY
    }

    fn next_wait(&mut self, _report: &AcquisitionReport) -> Duration {
        self.wait_time
    }
}

/// One acquisition loop over a set of engines.
pub struct AcquisitionRunnable {
    name: String,
    engines: Vec<CommandExecutor>,
    config: JobExecutorConfig,
    strategy: Box<dyn AcquisitionStrategy>,
    dispatcher: JobDispatcher,
    rx: mpsc::Receiver<AcquisitionSignal>,
    tx: mpsc::Sender<AcquisitionSignal>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl AcquisitionRunnable {
    pub(crate) fn new(
        name: impl Into<String>,
        engines: Vec<CommandExecutor>,
        config: JobExecutorConfig,
        strategy: Box<dyn AcquisitionStrategy>,
        dispatcher: JobDispatcher,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        for engine in &engines {
            engine.services().subscribe_job_hints(tx.clone());
        }
        let stats = dispatcher.stats();
        Self {
            name: name.into(),
            engines,
            config,
            strategy,
            dispatcher,
            rx,
            tx,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sender that wakes or stops this acquisition.
    pub fn signal(&self) -> mpsc::Sender<AcquisitionSignal> {
        self.tx.clone()
    }

    /// Acquire from every engine once and dispatch what was locked.
    pub fn run_cycle(&mut self) -> AcquisitionReport {
        let mut report = AcquisitionReport::default();
        let max_jobs = self.config.max_jobs_per_acquisition;

        for engine in &self.engines {
            let command = AcquireJobsCmd::new(
                self.config.lock_owner.as_str(),
                self.config.lock_time,
                max_jobs,
            );
            match engine.execute(command) {
                Ok(acquired) => {
                    let job_ids = acquired.job_ids();
                    if acquired.selected_count() >= max_jobs {
                        report.full_pages += 1;
                    }
                    report.acquired += job_ids.len();
                    report.lock_conflicts += acquired.lost_count();
                    if !job_ids.is_empty() {
                        debug!(
                            acquisition = %self.name,
                            engine = %engine.services().config().name,
                            jobs = job_ids.len(),
                            "acquired jobs"
                        );
                        report.rejected += self.dispatcher.execute_jobs(job_ids, engine);
                    }
                }
                Err(err) => {
                    error!(
                        acquisition = %self.name,
                        engine = %engine.services().config().name,
                        error = %err,
                        "job acquisition failed"
                    );
                    report.failed = true;
                }
            }
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.acquisition_cycles += 1;
        stats.jobs_acquired += report.acquired as u64;
        stats.lock_conflicts += report.lock_conflicts as u64;
        report
    }

    /// Run cycles until a shutdown signal arrives.
    pub fn run(mut self) {
        info!(
            acquisition = %self.name,
            strategy = self.strategy.name(),
            engines = self.engines.len(),
            "job acquisition started"
        );

        loop {
            if matches!(self.rx.try_recv(), Ok(AcquisitionSignal::Shutdown)) {
                break;
            }
            let report = self.run_cycle();
            let wait = self.strategy.next_wait(&report);
            if wait.is_zero() {
                continue;
            }

            debug!(acquisition = %self.name, wait_ms = wait.as_millis() as u64, "waiting");
            match self.rx.recv_timeout(wait) {
                Ok(AcquisitionSignal::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Ok(AcquisitionSignal::Hint) => {
                    // collapse hints that piled up while we slept
                    if self.rx.try_iter().any(|s| s == AcquisitionSignal::Shutdown) {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }

        info!(acquisition = %self.name, "job acquisition stopped");
    }
}

/// Handle to a scheduled acquisition thread; dropping it stops the thread.
#[derive(Debug)]
pub struct AcquisitionHandle {
    name: String,
    tx: mpsc::Sender<AcquisitionSignal>,
    join: Option<thread::JoinHandle<()>>,
}

impl AcquisitionHandle {
    pub(crate) fn spawn(runnable: AcquisitionRunnable) -> EngineResult<Self> {
        let name = runnable.name().to_string();
        let tx = runnable.signal();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || runnable.run())
            .map_err(|e| EngineError::internal(format!("failed to spawn acquisition thread: {e}")))?;
        Ok(Self {
            name,
            tx,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake the acquisition as if new jobs were committed.
    pub fn hint(&self) {
        let _ = self.tx.send(AcquisitionSignal::Hint);
    }

    /// Ask the acquisition to stop after its current cycle, without waiting.
    pub fn request_stop(&self) {
        let _ = self.tx.send(AcquisitionSignal::Shutdown);
    }

    /// Stop the acquisition and wait for its current cycle to end.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.request_stop();
        if join.join().is_err() {
            warn!(acquisition = %self.name, "acquisition thread panicked");
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_wait_time(Duration::from_millis(100), Duration::from_millis(1000))
            .with_backoff(Duration::from_millis(50), Duration::from_millis(400))
    }

    fn report(acquired: usize, conflicts: usize, full: bool) -> AcquisitionReport {
        AcquisitionReport {
            acquired,
            lock_conflicts: conflicts,
            full_pages: usize::from(full),
            ..Default::default()
        }
    }

    #[test]
    fn full_pages_trigger_an_immediate_cycle() {
        let mut strategy = BackoffAcquisitionStrategy::from_config(&config());
        assert_eq!(strategy.next_wait(&report(3, 0, true)), Duration::ZERO);
    }

    #[test]
    fn idle_cycles_grow_the_wait_up_to_the_maximum() {
        let mut strategy = BackoffAcquisitionStrategy::from_config(&config());
        let waits: Vec<Duration> = (0..6)
            .map(|_| strategy.next_wait(&report(0, 0, false)))
            .collect();

        assert_eq!(waits[0], Duration::from_millis(100));
        assert_eq!(waits[1], Duration::from_millis(200));
        assert_eq!(waits[2], Duration::from_millis(400));
        assert_eq!(waits[5], Duration::from_millis(1000));

        // any work resets the idle growth
        assert_eq!(strategy.next_wait(&report(1, 0, false)), Duration::from_millis(100));
        assert_eq!(strategy.next_wait(&report(0, 0, false)), Duration::from_millis(100));
    }

    #[test]
    fn lock_conflicts_back_off_within_bounds() {
        let mut strategy = BackoffAcquisitionStrategy::from_config(&config());
        for _ in 0..10 {
            let wait = strategy.next_wait(&report(1, 2, false));
            assert!(wait >= Duration::from_millis(25), "{wait:?}");
            assert!(wait <= Duration::from_millis(400), "{wait:?}");
        }
    }

    #[test]
    fn conflicts_are_ignored_when_backoff_is_disabled() {
        let config = config().with_backoff(Duration::ZERO, Duration::ZERO);
        let mut strategy = BackoffAcquisitionStrategy::from_config(&config);
        assert_eq!(strategy.next_wait(&report(3, 2, true)), Duration::ZERO);
    }

    #[test]
    fn failures_and_rejections_wait_the_base_time() {
        let mut strategy = BackoffAcquisitionStrategy::from_config(&config());
        let failed = AcquisitionReport {
            failed: true,
            ..Default::default()
        };
        let rejected = AcquisitionReport {
            acquired: 3,
            full_pages: 1,
            rejected: 2,
            ..Default::default()
        };
        assert_eq!(strategy.next_wait(&failed), Duration::from_millis(100));
        assert_eq!(strategy.next_wait(&rejected), Duration::from_millis(100));
    }

    #[test]
    fn registry_creates_known_strategies() {
        let registry = AcquisitionStrategyRegistry::default();
        assert_eq!(registry.names(), vec![FIXED_STRATEGY, SEQUENTIAL_STRATEGY]);

        let mut fixed = registry.create(FIXED_STRATEGY, &config()).unwrap();
        assert_eq!(fixed.next_wait(&report(3, 0, true)), Duration::from_millis(100));
        assert!(matches!(
            registry.create("round-robin", &config()),
            Err(EngineError::Validation(_))
        ));
    }
}

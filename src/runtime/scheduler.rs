use super::{TickError, TickReport, tick};
use crate::events::ChangeOrigin;
use crate::storage::tenant_key;
use crate::tenant::TenantContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consecutive failed passes after which the scheduler reports itself degraded.
pub const DEGRADED_AFTER: u32 = 3;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerMeta {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval: Option<Duration>,
    pub last_sync: Option<DateTime<Utc>>,
    pub next_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub ticks_completed: u64,
    pub ticks_skipped: u64,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

#[derive(Default)]
struct Stats {
    meta: SchedulerMeta,
    interval: Option<Duration>,
    next_sync: Option<DateTime<Utc>>,
    ticks_completed: u64,
    ticks_skipped: u64,
    consecutive_failures: u32,
}

struct Shared {
    ctx: TenantContext,
    in_flight: AtomicBool,
    stats: Mutex<Stats>,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta_key(&self) -> String {
        tenant_key(self.ctx.tenant_id(), "scheduler")
    }
}

/// Clears the in-flight flag when a pass ends, even by panic.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn try_begin(flag: &AtomicBool) -> Option<InFlight<'_>> {
    flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .ok()
        .map(|_| InFlight(flag))
}

struct Ticker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Polling loop for one tenant.
///
/// Passes never overlap: a timer firing while the previous pass is still
/// running is skipped and counted, not queued. `stop` ends the timer only;
/// a pass already running finishes and its effects still apply.
pub struct SyncScheduler {
    shared: Arc<Shared>,
    ticker: Option<Ticker>,
}

impl SyncScheduler {
    pub fn new(ctx: TenantContext) -> Self {
        let key = tenant_key(ctx.tenant_id(), "scheduler");
        let meta = ctx.state.load_json::<SchedulerMeta>(&key).unwrap_or_else(|e| {
            warn!(error = %e, "scheduler metadata unreadable; starting fresh");
            SchedulerMeta::default()
        });
        Self {
            shared: Arc::new(Shared {
                ctx,
                in_flight: AtomicBool::new(false),
                stats: Mutex::new(Stats {
                    meta,
                    ..Stats::default()
                }),
            }),
            ticker: None,
        }
    }

    /// Starts polling every `interval`, replacing any running timer.
    pub fn start(&mut self, interval: Duration) {
        self.stop();

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        {
            let mut stats = shared.stats();
            stats.interval = Some(interval);
            stats.next_sync = next_after(interval);
        }

        let handle = thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => fire(&shared, interval),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        info!(tenant = self.shared.ctx.tenant_id(), ?interval, "sync scheduler started");
        self.ticker = Some(Ticker { stop_tx, handle });
    }

    pub fn stop(&mut self) {
        let Some(ticker) = self.ticker.take() else {
            return;
        };
        let _ = ticker.stop_tx.send(());
        if ticker.handle.join().is_err() {
            error!("sync scheduler timer thread panicked");
        }
        let mut stats = self.shared.stats();
        stats.next_sync = None;
        info!(tenant = self.shared.ctx.tenant_id(), "sync scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Runs one pass on the caller's thread. `None` when a pass is already running.
    pub fn run_now(&self) -> Option<Result<TickReport, TickError>> {
        let _guard = try_begin(&self.shared.in_flight)?;
        Some(run_pass(&self.shared))
    }

    pub fn status(&self) -> SchedulerStatus {
        let stats = self.shared.stats();
        SchedulerStatus {
            running: self.is_running(),
            interval: stats.interval.filter(|_| self.is_running()),
            last_sync: stats.meta.last_sync,
            next_sync: stats.next_sync,
            last_error: stats.meta.last_error.clone(),
            ticks_completed: stats.ticks_completed,
            ticks_skipped: stats.ticks_skipped,
            consecutive_failures: stats.consecutive_failures,
            degraded: stats.consecutive_failures >= DEGRADED_AFTER,
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn next_after(interval: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(interval)
        .ok()
        .map(|step| Utc::now() + step)
}

fn fire(shared: &Arc<Shared>, interval: Duration) {
    shared.stats().next_sync = next_after(interval);

    if shared
        .in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        shared.stats().ticks_skipped += 1;
        debug!(tenant = shared.ctx.tenant_id(), "previous sync pass still running; tick skipped");
        return;
    }

    let shared = Arc::clone(shared);
    thread::spawn(move || {
        let _guard = InFlight(&shared.in_flight);
        let _ = run_pass(&shared);
    });
}

fn run_pass(shared: &Shared) -> Result<TickReport, TickError> {
    let result = tick(&shared.ctx, ChangeOrigin::Poll);

    let meta = {
        let mut stats = shared.stats();
        stats.ticks_completed += 1;
        match &result {
            Ok(_) => {
                stats.meta.last_sync = Some(Utc::now());
                stats.meta.last_error = None;
                stats.consecutive_failures = 0;
            }
            Err(e) => {
                stats.meta.last_error = Some(e.message());
                stats.consecutive_failures += 1;
                if stats.consecutive_failures == DEGRADED_AFTER {
                    warn!(
                        tenant = shared.ctx.tenant_id(),
                        failures = stats.consecutive_failures,
                        "background sync degraded"
                    );
                }
            }
        }
        stats.meta.clone()
    };

    if let Err(e) = shared.ctx.state.save_json(&shared.meta_key(), &meta) {
        warn!(error = %e, "failed to queue scheduler metadata");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LEADS_GID, ScriptedSource, context};

    const SHEET: &str = "id,Nome,Etapa Etiquetas\nL1,Ana,NOVO\n";

    #[test]
    fn slow_fetches_never_overlap() {
        let source = ScriptedSource::new();
        source.set_csv(LEADS_GID, SHEET);
        source.set_delay(Duration::from_millis(200));
        let mut scheduler = SyncScheduler::new(context(source.clone(), None));

        scheduler.start(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(900));
        scheduler.stop();
        thread::sleep(Duration::from_millis(300));

        assert!(source.fetches() >= 2);
        assert_eq!(source.max_in_flight(), 1);
        assert!(scheduler.status().ticks_skipped > 0);
    }

    #[test]
    fn start_twice_keeps_a_single_timer() {
        let source = ScriptedSource::new();
        source.set_csv(LEADS_GID, SHEET);
        let mut scheduler = SyncScheduler::new(context(source.clone(), None));

        scheduler.start(Duration::from_secs(60));
        scheduler.start(Duration::from_millis(40));
        assert!(scheduler.is_running());
        assert_eq!(scheduler.status().interval, Some(Duration::from_millis(40)));

        thread::sleep(Duration::from_millis(300));
        scheduler.stop();
        scheduler.stop();
        thread::sleep(Duration::from_millis(100));
        let after_stop = source.fetches();
        assert!(after_stop >= 1);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(source.fetches(), after_stop);
        assert!(!scheduler.status().running);
    }

    #[test]
    fn run_now_is_refused_while_a_pass_is_running() {
        let source = ScriptedSource::new();
        source.set_csv(LEADS_GID, SHEET);
        source.set_delay(Duration::from_millis(300));
        let scheduler = SyncScheduler::new(context(source, None));

        thread::scope(|scope| {
            let busy = scope.spawn(|| scheduler.run_now());
            thread::sleep(Duration::from_millis(100));
            assert!(scheduler.run_now().is_none());
            assert!(busy.join().expect("join").is_some());
        });
        assert!(!scheduler.is_busy());
    }

    #[test]
    fn repeated_failures_mark_the_scheduler_degraded() {
        let source = ScriptedSource::new();
        source.set_error(LEADS_GID, "HTTP 404");
        let scheduler = SyncScheduler::new(context(source.clone(), None));

        for _ in 0..DEGRADED_AFTER {
            assert!(matches!(scheduler.run_now(), Some(Err(_))));
        }
        let status = scheduler.status();
        assert!(status.degraded);
        assert!(status.last_error.is_some());

        source.set_csv(LEADS_GID, SHEET);
        assert!(matches!(scheduler.run_now(), Some(Ok(_))));
        assert!(!scheduler.status().degraded);
    }

    #[test]
    fn last_sync_survives_a_new_scheduler() {
        let source = ScriptedSource::new();
        source.set_csv(LEADS_GID, SHEET);
        let ctx = context(source, None);

        let first = SyncScheduler::new(ctx.clone());
        assert!(first.run_now().is_some());
        ctx.flush();

        let second = SyncScheduler::new(ctx);
        assert!(second.status().last_sync.is_some());
    }
}

//! Drives poll cycles on an interval or back to back.
//!
//! At most one cycle runs at a time. The in-flight guard is an owned mutex
//! taken with `try_lock_owned`; a tick that cannot take it is dropped and
//! counted, never queued. `stop()` prevents new cycles and then waits for the
//! running one to release the guard.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::cycle::PollCycle;
use super::delivery::MessageConsumer;
use super::observe::{CycleObserver, PollStats, StatsSnapshot, TracingObserver};
use crate::error::SchedulerError;

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Created, never started.
    Idle,
    /// Ticking and running cycles.
    Polling,
    /// No new cycles; waiting for the in-flight one.
    Stopping,
    Stopped,
}

impl SchedulerState {
    pub fn can_transition_to(&self, target: SchedulerState) -> bool {
        use SchedulerState::*;

        matches!(
            (self, target),
            (Idle, Polling) | (Idle, Stopped) | (Polling, Stopping) | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// How cycles are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Fixed period between cycle starts. The first tick fires immediately.
    Interval(Duration),
    /// Next cycle starts `pause` after the previous one finished.
    Continuous { pause: Duration },
}

/// Everything a spawned cycle needs, cheap to clone into tasks.
#[derive(Clone)]
struct CycleRunner {
    cycle: Arc<PollCycle>,
    consumer: Arc<dyn MessageConsumer>,
    observer: Arc<dyn CycleObserver>,
    stats: Arc<PollStats>,
    in_flight: Arc<Mutex<()>>,
}

impl CycleRunner {
    /// Spawn a cycle unless one is already running.
    fn try_run(&self) -> Option<JoinHandle<()>> {
        let Ok(guard) = Arc::clone(&self.in_flight).try_lock_owned() else {
            self.stats.record_skipped_tick();
            self.observer.on_tick_skipped();
            return None;
        };

        let runner = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            runner.run_guarded().await;
        }))
    }

    async fn run_guarded(&self) {
        let attempt = AssertUnwindSafe(self.cycle.run(self.consumer.as_ref())).catch_unwind();
        match attempt.await {
            Ok(outcome) => {
                self.stats.record(&outcome);
                self.observer.on_cycle(&outcome);
            }
            Err(_) => error!("Poll cycle panicked; scheduler continues"),
        }
    }
}

pub struct PollScheduler {
    runner: CycleRunner,
    state: RwLock<SchedulerState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(cycle: Arc<PollCycle>, consumer: Arc<dyn MessageConsumer>) -> Self {
        Self {
            runner: CycleRunner {
                cycle,
                consumer,
                observer: Arc::new(TracingObserver),
                stats: Arc::new(PollStats::default()),
                in_flight: Arc::new(Mutex::new(())),
            },
            state: RwLock::new(SchedulerState::Idle),
            shutdown: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    /// Replace the default tracing observer.
    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.runner.observer = observer;
        self
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.runner.stats.snapshot()
    }

    /// Poll every `interval`, starting now.
    pub async fn start(&self, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        self.launch(PollMode::Interval(interval)).await
    }

    /// Poll back to back with `pause` between cycles.
    pub async fn start_continuous(&self, pause: Duration) -> Result<(), SchedulerError> {
        self.launch(PollMode::Continuous { pause }).await
    }

    async fn launch(&self, mode: PollMode) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        if !state.can_transition_to(SchedulerState::Polling) {
            return Err(SchedulerError::InvalidTransition {
                from: *state,
                to: SchedulerState::Polling,
            });
        }

        let (tx, rx) = watch::channel(false);
        let runner = self.runner.clone();
        let handle = match mode {
            PollMode::Interval(period) => tokio::spawn(run_interval(runner, period, rx)),
            PollMode::Continuous { pause } => tokio::spawn(run_continuous(runner, pause, rx)),
        };

        *self.shutdown.lock().await = Some(tx);
        *self.ticker.lock().await = Some(handle);
        *state = SchedulerState::Polling;

        info!(
            protocol = %self.runner.cycle.strategy().protocol(),
            mode = ?mode,
            "Poll scheduler started"
        );
        Ok(())
    }

    /// Run one cycle now. Returns `None` when a cycle is already in flight.
    pub async fn trigger(&self) -> Result<Option<JoinHandle<()>>, SchedulerError> {
        let state = self.state.read().await;
        if *state != SchedulerState::Polling {
            return Err(SchedulerError::NotPolling(*state));
        }
        Ok(self.runner.try_run())
    }

    /// Stop polling and wait for the in-flight cycle. Safe to call repeatedly.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            match *state {
                SchedulerState::Idle => {
                    *state = SchedulerState::Stopped;
                    info!("Poll scheduler stopped before starting");
                    return;
                }
                SchedulerState::Stopping | SchedulerState::Stopped => return,
                SchedulerState::Polling => *state = SchedulerState::Stopping,
            }
        }
        info!("Poll scheduler stopping");

        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.ticker.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Poll ticker task ended abnormally");
        }

        // Wait for a cycle spawned by a tick or trigger to finish.
        let _idle = self.runner.in_flight.lock().await;

        *self.state.write().await = SchedulerState::Stopped;
        info!("Poll scheduler stopped");
    }
}

async fn run_interval(runner: CycleRunner, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let _ = runner.try_run();
            }
        }
    }
    debug!("Interval ticker exited");
}

async fn run_continuous(runner: CycleRunner, pause: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Some(handle) = runner.try_run()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Poll cycle task ended abnormally");
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    debug!("Continuous poll loop exited");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::config::{Protocol, SessionConfig};
    use crate::error::DeliveryError;
    use crate::mail::{FailPoint, InMemoryMailServer, InboundMail};
    use crate::poller::delivery::DeliveryResult;
    use crate::protocol::Pop3Strategy;

    /// Blocks inside `deliver` until the test hands out a permit.
    struct Gated {
        entered: Notify,
        gate: Semaphore,
    }

    impl Gated {
        fn new() -> Self {
            Self {
                entered: Notify::new(),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageConsumer for Gated {
        async fn deliver(&self, _mail: &InboundMail) -> Result<DeliveryResult, DeliveryError> {
            self.entered.notify_one();
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;
            permit.forget();
            Ok(DeliveryResult::Delivered)
        }
    }

    async fn scheduler(consumer: Arc<dyn MessageConsumer>) -> (PollScheduler, InMemoryMailServer) {
        let server = InMemoryMailServer::new();
        server
            .append("INBOX", "Subject: one\r\nMessage-ID: <one@x>\r\n\r\nhi\r\n")
            .await;
        let session = SessionConfig::new(Protocol::Pop3, "mem.local", "bot", "pw");
        let strategy = Arc::new(Pop3Strategy::new(session, Arc::new(server.clone())));
        let cycle = Arc::new(PollCycle::new(strategy));
        (PollScheduler::new(cycle, consumer), server)
    }

    #[test]
    fn state_transitions() {
        use SchedulerState::*;

        assert!(Idle.can_transition_to(Polling));
        assert!(Idle.can_transition_to(Stopped));
        assert!(Polling.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(!Polling.can_transition_to(Polling));
        assert!(!Polling.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Polling));
        assert!(!Stopping.can_transition_to(Polling));

        assert!(Stopped.is_terminal());
        assert!(!Stopping.is_terminal());
        assert_eq!(Stopping.to_string(), "stopping");
        assert_eq!(serde_json::to_string(&Polling).unwrap(), "\"polling\"");
    }

    #[tokio::test]
    async fn stop_from_idle_is_terminal() {
        let (sched, _server) = scheduler(Arc::new(Gated::new())).await;
        sched.stop().await;
        assert_eq!(sched.state().await, SchedulerState::Stopped);

        let err = sched.start(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InvalidTransition {
                from: SchedulerState::Stopped,
                to: SchedulerState::Polling,
            }
        );
        sched.stop().await;
    }

    #[tokio::test]
    async fn rejects_zero_interval_and_double_start() {
        let consumer = Arc::new(Gated::new());
        consumer.gate.add_permits(8);
        let (sched, _server) = scheduler(consumer).await;
        assert_eq!(
            sched.start(Duration::ZERO).await.unwrap_err(),
            SchedulerError::InvalidInterval
        );
        assert_eq!(sched.state().await, SchedulerState::Idle);

        sched.start_continuous(Duration::from_secs(3600)).await.unwrap();
        assert!(matches!(
            sched.start(Duration::from_secs(1)).await,
            Err(SchedulerError::InvalidTransition {
                from: SchedulerState::Polling,
                ..
            })
        ));
        sched.stop().await;
    }

    #[tokio::test]
    async fn trigger_requires_polling() {
        let (sched, _server) = scheduler(Arc::new(Gated::new())).await;
        assert_eq!(
            sched.trigger().await.unwrap_err(),
            SchedulerError::NotPolling(SchedulerState::Idle)
        );
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let consumer = Arc::new(Gated::new());
        let (sched, server) = scheduler(consumer.clone()).await;

        sched.start(Duration::from_secs(3600)).await.unwrap();
        consumer.entered.notified().await;

        assert!(sched.trigger().await.unwrap().is_none());
        assert_eq!(sched.stats().ticks_skipped, 1);

        consumer.gate.add_permits(1);
        sched.stop().await;

        let stats = sched.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(server.stats().await.connects, 1);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_cycle() {
        let consumer = Arc::new(Gated::new());
        let (sched, server) = scheduler(consumer.clone()).await;
        let sched = Arc::new(sched);

        sched.start(Duration::from_secs(3600)).await.unwrap();
        consumer.entered.notified().await;

        let stopping = {
            let sched = Arc::clone(&sched);
            tokio::spawn(async move { sched.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert_eq!(sched.state().await, SchedulerState::Stopping);
        assert!(sched.trigger().await.is_err());

        consumer.gate.add_permits(1);
        stopping.await.unwrap();

        assert_eq!(sched.state().await, SchedulerState::Stopped);
        assert_eq!(sched.stats().delivered, 1);
        let server_stats = server.stats().await;
        assert_eq!(server_stats.store_closes, 1);
        assert!(server.uids("INBOX").await.is_empty());
    }

    #[tokio::test]
    async fn failing_cycles_do_not_stop_polling() {
        let (sched, server) = scheduler(Arc::new(Gated::new())).await;
        server.inject(FailPoint::Connect).await;

        sched.start_continuous(Duration::from_millis(5)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while sched.stats().failed_cycles < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(sched.state().await, SchedulerState::Polling);
        sched.stop().await;
        assert_eq!(sched.state().await, SchedulerState::Stopped);
    }
}

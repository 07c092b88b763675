//! Poll cycle, scheduler and consumer contract.

pub mod cycle;
pub mod delivery;
pub mod observe;
pub mod scheduler;

use std::sync::Arc;

use tracing::info;

pub use cycle::{CycleOutcome, PollCycle};
pub use delivery::{DeliveryResult, MessageConsumer, deliver_guarded};
pub use observe::{CycleObserver, PollStats, StatsSnapshot, TracingObserver};
pub use scheduler::{PollMode, PollScheduler, SchedulerState};

use crate::config::PollerConfig;
use crate::error::Result;
use crate::mail::MailConnector;
use crate::protocol::strategy_for;
use crate::seen::{LibSqlSeenStore, MemorySeenSet, SeenStore};

/// A configured poller: strategy, seen set, cycle and scheduler wired
/// together from a [`PollerConfig`].
pub struct Poller {
    config: PollerConfig,
    scheduler: PollScheduler,
}

impl Poller {
    /// Build everything the config describes. Opens the seen-set database
    /// when `seen_db_path` is set; otherwise IMAP gets a process-local set
    /// and POP3 relies on deletion alone.
    pub async fn from_config(
        config: PollerConfig,
        connector: Arc<dyn MailConnector>,
        consumer: Arc<dyn MessageConsumer>,
    ) -> Result<Self> {
        config.validate()?;

        let strategy = strategy_for(config.session.clone(), connector);

        let seen: Option<Arc<dyn SeenStore>> = match &config.seen_db_path {
            Some(path) => {
                let store = LibSqlSeenStore::new_local(path, config.session.scope()).await?;
                Some(Arc::new(store))
            }
            None if strategy.tracks_seen() => Some(Arc::new(MemorySeenSet::new())),
            None => None,
        };

        let mut cycle = PollCycle::new(strategy)
            .with_max_messages(config.max_messages)
            .with_delivery_timeout(config.delivery_timeout);
        if let Some(seen) = seen {
            cycle = cycle.with_seen_store(seen);
        }

        info!(
            scope = %config.session.scope(),
            interval_secs = config.poll_interval.as_secs(),
            persistent_seen = config.seen_db_path.is_some(),
            "Poller configured"
        );

        Ok(Self {
            scheduler: PollScheduler::new(Arc::new(cycle), consumer),
            config,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.scheduler = self.scheduler.with_observer(observer);
        self
    }

    /// Start polling at the configured interval.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start(self.config.poll_interval).await?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }
}

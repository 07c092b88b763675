//! Mail inflow: poll a POP3 or IMAP mailbox and hand each new message to a
//! consumer with at-least-once delivery.
//!
//! A [`poller::PollScheduler`] runs [`poller::PollCycle`]s. Each cycle opens
//! the mailbox through a [`protocol::ProtocolStrategy`], delivers every
//! message not already in the [`seen`] set, marks the successful ones
//! consumed and closes the mailbox, committing deletions only when the cycle
//! succeeded.

pub mod config;
pub mod error;
pub mod mail;
pub mod poller;
pub mod protocol;
pub mod seen;
pub mod telemetry;

pub use config::{PollerConfig, Protocol, SessionConfig};
pub use error::{Error, Result};
pub use poller::{DeliveryResult, MessageConsumer, Poller};

//! Consumer contract and the guard that turns every consumer failure into a
//! transient delivery failure.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DeliveryError;
use crate::mail::InboundMail;

/// Outcome of handing one message to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    /// Accepted; the message is consumed.
    Delivered,
    /// Unprocessable (poison); consumed anyway so it is not retried forever.
    Rejected,
    /// Try again next cycle; the message stays on the server.
    TransientFailure,
}

impl DeliveryResult {
    /// Whether the message should be marked consumed.
    pub fn consumes(&self) -> bool {
        matches!(self, Self::Delivered | Self::Rejected)
    }
}

/// Receives new messages. Delivery is at-least-once, so implementations
/// must tolerate seeing the same message twice.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn deliver(&self, mail: &InboundMail) -> Result<DeliveryResult, DeliveryError>;
}

/// Run the consumer, mapping errors, panics and timeouts to `TransientFailure`.
pub async fn deliver_guarded(
    consumer: &dyn MessageConsumer,
    mail: &InboundMail,
    timeout: Option<Duration>,
) -> DeliveryResult {
    let attempt = AssertUnwindSafe(consumer.deliver(mail)).catch_unwind();

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(r) => r,
            Err(_) => Ok(Err(DeliveryError::Timeout(limit))),
        },
        None => attempt.await,
    };

    let error = match result {
        Ok(Ok(outcome)) => return outcome,
        Ok(Err(e)) => e,
        Err(payload) => DeliveryError::Panicked(panic_message(payload.as_ref())),
    };

    warn!(
        message = %mail.display_id(),
        error = %error,
        "Delivery failed, leaving message for redelivery"
    );
    DeliveryResult::TransientFailure
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

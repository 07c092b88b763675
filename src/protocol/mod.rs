//! Protocol strategies: the per-protocol half of a poll cycle.
//!
//! A strategy knows which store provider to ask for, which messages count
//! as pending, what "consumed" means on the server, and how to release the
//! folder and store. The polling core only ever sees `dyn ProtocolStrategy`.
//!
//! - `pop3`: delete-on-consume, expunge on close when flushing
//! - `imap`: flag `\Seen` on consume, dedup through the seen set

pub mod imap;
pub mod pop3;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{Protocol, SessionConfig};
use crate::error::{ConnectionError, ProtocolError};
use crate::mail::{MailConnector, MailFolder, MailStore, MessageRef};

pub use imap::ImapStrategy;
pub use pop3::Pop3Strategy;

/// Scoped connection owned by one poll cycle: the store and its open folder.
pub struct StoreHandle {
    store: Box<dyn MailStore>,
    folder: Box<dyn MailFolder>,
}

impl StoreHandle {
    pub fn new(store: Box<dyn MailStore>, folder: Box<dyn MailFolder>) -> Self {
        Self { store, folder }
    }

    pub fn folder_name(&self) -> &str {
        self.folder.name()
    }

    pub fn folder_mut(&mut self) -> &mut dyn MailFolder {
        self.folder.as_mut()
    }

    /// Close the folder, then the store.
    ///
    /// The folder is closed only if still open, expunging when `expunge` is
    /// set. The store is closed whenever it is connected, whatever happened
    /// to the folder. The first error is returned; later ones are logged.
    pub async fn close(mut self, expunge: bool) -> Result<(), CloseError> {
        let mut first: Option<CloseError> = None;

        if self.folder.is_open() {
            let folder = self.folder.name().to_string();
            if let Err(source) = self.folder.close(expunge).await {
                first = Some(CloseError::Protocol(ProtocolError::CloseFolder { folder, source }));
            }
        }

        if self.store.is_connected()
            && let Err(e) = self.store.close().await
        {
            let err = CloseError::Connection(ConnectionError::Close(e));
            if first.is_none() {
                first = Some(err);
            } else {
                warn!(error = %err, "Store close failed after folder close error");
            }
        }

        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Error from the two-stage close.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<CloseError> for crate::error::CycleError {
    fn from(e: CloseError) -> Self {
        match e {
            CloseError::Protocol(p) => Self::Protocol(p),
            CloseError::Connection(c) => Self::Connection(c),
        }
    }
}

/// Protocol-specific behaviour plugged into the poll cycle.
#[async_trait]
pub trait ProtocolStrategy: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Whether the cycle should consult a seen set by default.
    fn tracks_seen(&self) -> bool;

    /// Whether consuming removes the message from the server once the
    /// folder is closed with expunge.
    fn consumes_destructively(&self) -> bool {
        !self.tracks_seen()
    }

    fn session(&self) -> &SessionConfig;

    /// Connect and open the configured folder read-write.
    async fn open_store(&self) -> Result<StoreHandle, ConnectionError>;

    /// Messages pending consumption, in server order.
    async fn list_messages(&self, handle: &mut StoreHandle) -> Result<Vec<MessageRef>, ProtocolError>;

    /// Raw bytes of one listed message.
    async fn fetch(&self, handle: &mut StoreHandle, message: &MessageRef) -> Result<Vec<u8>, ProtocolError> {
        handle
            .folder_mut()
            .fetch(message)
            .await
            .map_err(|source| ProtocolError::Fetch {
                seq: message.seq,
                source,
            })
    }

    async fn mark_consumed(&self, handle: &mut StoreHandle, message: &MessageRef) -> Result<(), ProtocolError>;

    /// Release the folder and store. Expunges only when `success` and flush are both set.
    async fn close_store(&self, success: bool, handle: StoreHandle) -> Result<(), CloseError> {
        let expunge = success && self.session().flush;
        debug!(
            protocol = %self.protocol(),
            success,
            flush = self.session().flush,
            expunge,
            "Closing store"
        );
        handle.close(expunge).await
    }
}

/// Connect through `connector` and open the session's folder.
///
/// If the folder cannot be opened the connected store is closed before the
/// error is returned.
pub(crate) async fn open_with(
    connector: &dyn MailConnector,
    session: &SessionConfig,
) -> Result<StoreHandle, ConnectionError> {
    let provider = session.protocol.provider_name();
    let mut store = connector
        .connect(provider, session)
        .await
        .map_err(|source| ConnectionError::Open {
            protocol: provider.to_string(),
            host: session.host.clone(),
            source,
        })?;

    match store.open_folder(&session.folder).await {
        Ok(folder) => Ok(StoreHandle::new(store, folder)),
        Err(source) => {
            if store.is_connected()
                && let Err(e) = store.close().await
            {
                warn!(error = %e, "Failed to close store after folder open error");
            }
            Err(ConnectionError::OpenFolder {
                folder: session.folder.clone(),
                source,
            })
        }
    }
}

/// Build the strategy for the session's protocol.
pub fn strategy_for(
    session: SessionConfig,
    connector: Arc<dyn MailConnector>,
) -> Arc<dyn ProtocolStrategy> {
    match session.protocol {
        Protocol::Pop3 => Arc::new(Pop3Strategy::new(session, connector)),
        Protocol::Imap => Arc::new(ImapStrategy::new(session, connector)),
    }
}

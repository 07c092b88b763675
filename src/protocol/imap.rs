//! IMAP strategy: unseen messages are pending; consuming a message sets
//! `\Seen`, which is non-destructive. Redelivery across restarts is
//! suppressed by the seen set.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ProtocolStrategy, StoreHandle, open_with};
use crate::config::{Protocol, SessionConfig};
use crate::error::{ConnectionError, ProtocolError};
use crate::mail::{Flag, MailConnector, MessageRef};

pub struct ImapStrategy {
    session: SessionConfig,
    connector: Arc<dyn MailConnector>,
}

impl ImapStrategy {
    pub fn new(session: SessionConfig, connector: Arc<dyn MailConnector>) -> Self {
        Self { session, connector }
    }
}

#[async_trait]
impl ProtocolStrategy for ImapStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Imap
    }

    fn tracks_seen(&self) -> bool {
        true
    }

    fn session(&self) -> &SessionConfig {
        &self.session
    }

    async fn open_store(&self) -> Result<StoreHandle, ConnectionError> {
        let mut session = self.session.clone();
        session.protocol = Protocol::Imap;
        open_with(self.connector.as_ref(), &session).await
    }

    async fn list_messages(&self, handle: &mut StoreHandle) -> Result<Vec<MessageRef>, ProtocolError> {
        let folder = handle.folder_name().to_string();
        handle
            .folder_mut()
            .search_unseen()
            .await
            .map_err(|source| ProtocolError::List { folder, source })
    }

    async fn mark_consumed(&self, handle: &mut StoreHandle, message: &MessageRef) -> Result<(), ProtocolError> {
        handle
            .folder_mut()
            .set_flag(message, Flag::Seen, true)
            .await
            .map_err(|source| ProtocolError::MarkConsumed {
                seq: message.seq,
                source,
            })
    }
}

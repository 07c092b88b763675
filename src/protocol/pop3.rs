//! POP3 strategy: every message in the maildrop is pending; consuming a
//! message marks it deleted, and the deletion is committed when the folder
//! closes with flush enabled.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ProtocolStrategy, StoreHandle, open_with};
use crate::config::{Protocol, SessionConfig};
use crate::error::{ConnectionError, ProtocolError};
use crate::mail::{Flag, MailConnector, MessageRef};

pub struct Pop3Strategy {
    session: SessionConfig,
    connector: Arc<dyn MailConnector>,
}

impl Pop3Strategy {
    pub fn new(session: SessionConfig, connector: Arc<dyn MailConnector>) -> Self {
        Self { session, connector }
    }
}

#[async_trait]
impl ProtocolStrategy for Pop3Strategy {
    fn protocol(&self) -> Protocol {
        Protocol::Pop3
    }

    fn tracks_seen(&self) -> bool {
        false
    }

    fn session(&self) -> &SessionConfig {
        &self.session
    }

    async fn open_store(&self) -> Result<StoreHandle, ConnectionError> {
        let mut session = self.session.clone();
        session.protocol = Protocol::Pop3;
        open_with(self.connector.as_ref(), &session).await
    }

    async fn list_messages(&self, handle: &mut StoreHandle) -> Result<Vec<MessageRef>, ProtocolError> {
        let folder = handle.folder_name().to_string();
        handle
            .folder_mut()
            .messages()
            .await
            .map_err(|source| ProtocolError::List { folder, source })
    }

    async fn mark_consumed(&self, handle: &mut StoreHandle, message: &MessageRef) -> Result<(), ProtocolError> {
        handle
            .folder_mut()
            .set_flag(message, Flag::Deleted, true)
            .await
            .map_err(|source| ProtocolError::MarkConsumed {
                seq: message.seq,
                source,
            })
    }
}

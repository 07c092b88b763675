//! Mail client boundary: the store/folder surface a protocol strategy drives.
//!
//! These traits stand in for a mail protocol client library. A connector
//! turns a session into a connected [`MailStore`]; the store opens
//! [`MailFolder`]s; folders list, fetch and flag messages and commit
//! deletions when closed with `expunge = true`.

pub mod memory;
pub mod message;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::SessionConfig;
use crate::error::MailError;

pub use memory::{FailPoint, InMemoryMailServer};
pub use message::InboundMail;

/// Message flags the poller manipulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Deleted,
}

/// Identifies one message within an open folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageRef {
    /// Server sequence number, valid for the folder session that listed it.
    pub seq: u32,
    /// Stable server identifier (POP3 UIDL or IMAP `uidvalidity:uid`).
    pub uid: Option<String>,
    /// `Message-ID` header, when the server exposes it at listing time.
    pub message_id: Option<String>,
}

impl MessageRef {
    pub fn new(seq: u32) -> Self {
        Self {
            seq,
            uid: None,
            message_id: None,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Key used for duplicate suppression. UID first, then Message-ID.
    pub fn dedup_key(&self) -> Option<String> {
        if let Some(uid) = &self.uid {
            return Some(format!("uid:{uid}"));
        }
        self.message_id.as_ref().map(|id| format!("mid:{id}"))
    }
}

/// Opens store connections for a provider name (`"pop3"`, `"imap"`).
#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(
        &self,
        provider: &str,
        session: &SessionConfig,
    ) -> Result<Box<dyn MailStore>, MailError>;
}

/// A connected mail store.
#[async_trait]
pub trait MailStore: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open a folder read-write.
    async fn open_folder(&mut self, name: &str) -> Result<Box<dyn MailFolder>, MailError>;

    async fn close(&mut self) -> Result<(), MailError>;
}

/// An open folder.
#[async_trait]
pub trait MailFolder: Send + Sync {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// All visible messages in server order.
    async fn messages(&mut self) -> Result<Vec<MessageRef>, MailError>;

    /// Messages without the `\Seen` flag, in server order.
    async fn search_unseen(&mut self) -> Result<Vec<MessageRef>, MailError>;

    /// Raw RFC 5322 bytes of one message.
    async fn fetch(&mut self, message: &MessageRef) -> Result<Vec<u8>, MailError>;

    async fn set_flag(&mut self, message: &MessageRef, flag: Flag, value: bool)
    -> Result<(), MailError>;

    /// Close the folder, removing `\Deleted` messages only when `expunge` is set.
    async fn close(&mut self, expunge: bool) -> Result<(), MailError>;
}

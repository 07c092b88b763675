//! In-memory mail server implementing the client boundary.
//!
//! Deletion marks are scoped to one folder session and only take effect
//! when the folder is closed with `expunge = true`, which matches how POP3
//! commits `DELE` on `QUIT` and how IMAP applies `EXPUNGE`. `\Seen` flags
//! persist on the server. Failure points can be injected for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Flag, MailConnector, MailFolder, MailStore, MessageRef};
use crate::config::SessionConfig;
use crate::error::MailError;

const UID_VALIDITY: u32 = 1;

/// Operation that can be made to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Connect,
    OpenFolder,
    List,
    /// Fetching the message with this server UID.
    Fetch(u32),
    SetFlag,
    CloseFolder,
    CloseStore,
}

#[derive(Debug, Clone)]
struct StoredMail {
    uid: u32,
    raw: Vec<u8>,
    message_id: Option<String>,
    seen: bool,
}

/// Call counters, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connects: usize,
    pub folder_opens: usize,
    /// `expunge` argument of every folder close, in order.
    pub folder_closes: Vec<bool>,
    pub store_closes: usize,
    pub flags_set: usize,
    pub fetches: usize,
}

#[derive(Debug, Default)]
struct ServerState {
    folders: HashMap<String, Vec<StoredMail>>,
    next_uid: u32,
    credentials: Option<(String, String)>,
    failures: HashSet<FailPoint>,
    stats: ServerStats,
}

impl ServerState {
    fn check(&self, point: FailPoint) -> Result<(), MailError> {
        if self.failures.contains(&point) {
            return Err(MailError::Command(format!("injected failure: {point:?}")));
        }
        Ok(())
    }
}

/// Shared in-memory mailbox server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMailServer {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryMailServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials on connect.
    pub async fn require_login(&self, username: &str, password: &str) {
        self.state.lock().await.credentials = Some((username.to_string(), password.to_string()));
    }

    /// Append a message to a folder, creating the folder if needed. Returns its UID.
    pub async fn append(&self, folder: &str, raw: impl Into<Vec<u8>>) -> u32 {
        let raw = raw.into();
        let message_id = MessageParser::default()
            .parse(raw.as_slice())
            .and_then(|m| m.message_id().map(|s| s.to_string()));

        let mut state = self.state.lock().await;
        state.next_uid += 1;
        let uid = state.next_uid;
        state
            .folders
            .entry(folder.to_string())
            .or_default()
            .push(StoredMail {
                uid,
                raw,
                message_id,
                seen: false,
            });
        uid
    }

    pub async fn create_folder(&self, folder: &str) {
        self.state
            .lock()
            .await
            .folders
            .entry(folder.to_string())
            .or_default();
    }

    pub async fn inject(&self, point: FailPoint) {
        self.state.lock().await.failures.insert(point);
    }

    pub async fn clear(&self, point: &FailPoint) {
        self.state.lock().await.failures.remove(point);
    }

    /// UIDs currently stored in a folder.
    pub async fn uids(&self, folder: &str) -> Vec<u32> {
        self.state
            .lock()
            .await
            .folders
            .get(folder)
            .map(|msgs| msgs.iter().map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    pub async fn is_seen(&self, folder: &str, uid: u32) -> bool {
        self.state
            .lock()
            .await
            .folders
            .get(folder)
            .and_then(|msgs| msgs.iter().find(|m| m.uid == uid))
            .is_some_and(|m| m.seen)
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.lock().await.stats.clone()
    }
}

#[async_trait]
impl MailConnector for InMemoryMailServer {
    async fn connect(
        &self,
        provider: &str,
        session: &SessionConfig,
    ) -> Result<Box<dyn MailStore>, MailError> {
        if provider != "pop3" && provider != "imap" {
            return Err(MailError::NoSuchProvider(provider.to_string()));
        }

        let mut state = self.state.lock().await;
        if state.failures.contains(&FailPoint::Connect) {
            return Err(MailError::Connect {
                host: session.host.clone(),
                reason: "connection refused".into(),
            });
        }
        if let Some((user, pass)) = &state.credentials
            && (user != &session.username || pass != session.password.expose_secret())
        {
            return Err(MailError::AuthFailed {
                user: session.username.clone(),
            });
        }
        state.stats.connects += 1;
        debug!(provider, host = %session.host, "In-memory store connected");

        Ok(Box::new(MemoryStore {
            state: Arc::clone(&self.state),
            provider: provider.to_string(),
            connected: true,
        }))
    }
}

struct MemoryStore {
    state: Arc<Mutex<ServerState>>,
    provider: String,
    connected: bool,
}

#[async_trait]
impl MailStore for MemoryStore {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn open_folder(&mut self, name: &str) -> Result<Box<dyn MailFolder>, MailError> {
        let mut state = self.state.lock().await;
        state.check(FailPoint::OpenFolder)?;
        let Some(messages) = state.folders.get(name) else {
            return Err(MailError::FolderNotFound(name.to_string()));
        };
        let snapshot = messages.iter().map(|m| m.uid).collect();
        state.stats.folder_opens += 1;

        Ok(Box::new(MemoryFolder {
            state: Arc::clone(&self.state),
            provider: self.provider.clone(),
            name: name.to_string(),
            open: true,
            snapshot,
            deleted: HashSet::new(),
        }))
    }

    async fn close(&mut self) -> Result<(), MailError> {
        let mut state = self.state.lock().await;
        state.stats.store_closes += 1;
        // The connection is gone even when the logout fails.
        self.connected = false;
        state.check(FailPoint::CloseStore)
    }
}

struct MemoryFolder {
    state: Arc<Mutex<ServerState>>,
    provider: String,
    name: String,
    open: bool,
    /// UIDs by sequence number (index + 1) at open time.
    snapshot: Vec<u32>,
    deleted: HashSet<u32>,
}

impl MemoryFolder {
    fn ensure_open(&self) -> Result<(), MailError> {
        if self.open {
            Ok(())
        } else {
            Err(MailError::FolderClosed(self.name.clone()))
        }
    }

    fn uid_for(&self, message: &MessageRef) -> Result<u32, MailError> {
        message
            .seq
            .checked_sub(1)
            .and_then(|idx| self.snapshot.get(idx as usize))
            .copied()
            .ok_or(MailError::MessageNotFound(message.seq))
    }

    fn to_ref(&self, seq: u32, mail: &StoredMail) -> MessageRef {
        let uid = if self.provider == "imap" {
            format!("{UID_VALIDITY}:{}", mail.uid)
        } else {
            format!("{:08x}", mail.uid)
        };
        let mut r = MessageRef::new(seq).with_uid(uid);
        r.message_id = mail.message_id.clone();
        r
    }

    async fn list(&mut self, unseen_only: bool) -> Result<Vec<MessageRef>, MailError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        state.check(FailPoint::List)?;
        let stored = state.folders.get(&self.name);

        let mut refs = Vec::new();
        for (idx, uid) in self.snapshot.iter().enumerate() {
            let Some(mail) = stored.and_then(|msgs| msgs.iter().find(|m| m.uid == *uid)) else {
                continue;
            };
            if unseen_only && mail.seen {
                continue;
            }
            refs.push(self.to_ref(idx as u32 + 1, mail));
        }
        Ok(refs)
    }
}

#[async_trait]
impl MailFolder for MemoryFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn messages(&mut self) -> Result<Vec<MessageRef>, MailError> {
        self.list(false).await
    }

    async fn search_unseen(&mut self) -> Result<Vec<MessageRef>, MailError> {
        self.list(true).await
    }

    async fn fetch(&mut self, message: &MessageRef) -> Result<Vec<u8>, MailError> {
        self.ensure_open()?;
        let uid = self.uid_for(message)?;
        let mut state = self.state.lock().await;
        state.check(FailPoint::Fetch(uid))?;
        state.stats.fetches += 1;
        state
            .folders
            .get(&self.name)
            .and_then(|msgs| msgs.iter().find(|m| m.uid == uid))
            .map(|m| m.raw.clone())
            .ok_or(MailError::MessageNotFound(message.seq))
    }

    async fn set_flag(
        &mut self,
        message: &MessageRef,
        flag: Flag,
        value: bool,
    ) -> Result<(), MailError> {
        self.ensure_open()?;
        let uid = self.uid_for(message)?;
        let mut state = self.state.lock().await;
        state.check(FailPoint::SetFlag)?;
        state.stats.flags_set += 1;

        match flag {
            Flag::Deleted => {
                if value {
                    self.deleted.insert(uid);
                } else {
                    self.deleted.remove(&uid);
                }
            }
            Flag::Seen => {
                if let Some(mail) = state
                    .folders
                    .get_mut(&self.name)
                    .and_then(|msgs| msgs.iter_mut().find(|m| m.uid == uid))
                {
                    mail.seen = value;
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self, expunge: bool) -> Result<(), MailError> {
        let mut state = self.state.lock().await;
        state.stats.folder_closes.push(expunge);
        state.check(FailPoint::CloseFolder)?;

        if expunge && !self.deleted.is_empty() {
            let deleted = std::mem::take(&mut self.deleted);
            if let Some(msgs) = state.folders.get_mut(&self.name) {
                msgs.retain(|m| !deleted.contains(&m.uid));
            }
            debug!(folder = %self.name, count = deleted.len(), "Expunged messages");
        }
        self.deleted.clear();
        self.open = false;
        Ok(())
    }
}

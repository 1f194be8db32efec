//! Stable per-session correlation identifier.
//!
//! The identifier is read from the persistence slot when present and issued
//! by the backend otherwise. Issuance is memoized: concurrent `ensure` calls
//! wait on the same in-flight request, so one process never ends up holding
//! two different identifiers.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::issuer::SessionIssuer;
use crate::slot::{PersistenceSlot, SESSION_ID_KEY};

pub struct SessionIdentity {
    slot: Arc<dyn PersistenceSlot>,
    issuer: Arc<dyn SessionIssuer>,
    resolved: OnceCell<String>,
}

impl SessionIdentity {
    pub fn new(slot: Arc<dyn PersistenceSlot>, issuer: Arc<dyn SessionIssuer>) -> Self {
        Self {
            slot,
            issuer,
            resolved: OnceCell::new(),
        }
    }

    /// Return the session identifier, issuing and persisting one if needed.
    ///
    /// A failed issuance is not cached; the next call tries again.
    pub async fn ensure(&self) -> Result<String> {
        let id = self
            .resolved
            .get_or_try_init(|| self.load_or_issue())
            .await?;
        Ok(id.clone())
    }

    async fn load_or_issue(&self) -> Result<String> {
        if let Some(id) = self.slot.get(SESSION_ID_KEY)?.filter(|id| !id.is_empty()) {
            debug!("[SessionIdentity] Reusing persisted session {}", id);
            return Ok(id);
        }

        let session = self.issuer.issue().await?;
        self.slot.set(SESSION_ID_KEY, &session.id)?;
        info!("[SessionIdentity] Persisted new session {}", session.id);
        Ok(session.id)
    }

    /// The identifier if it has already been resolved.
    pub fn current(&self) -> Option<&str> {
        self.resolved.get().map(String::as_str)
    }
}

use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::swap::store::SwapStore;

/// Version of the persisted swap records written by this build.
pub const STORE_VERSION: &str = "v3";

const VERSION_KEY: &str = "store_version";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("cannot upgrade while swaps are active, downgrade to store version {stored}")]
    ActiveSwaps { stored: String },
}

/// Refuses to switch the store to a new record version while swaps written
/// by the old version are still in flight.
pub struct VersionGate {
    store: Arc<dyn SwapStore>,
}

impl VersionGate {
    pub fn new(store: Arc<dyn SwapStore>) -> Self {
        Self { store }
    }

    pub fn stored_version(&self) -> Result<Option<String>> {
        self.store.get_meta(VERSION_KEY)
    }

    pub fn safe_upgrade(&self) -> Result<()> {
        let stored = self.stored_version().context("read store version")?;
        if stored.as_deref() == Some(STORE_VERSION) {
            return Ok(());
        }

        let has_active = !self
            .store
            .list_active()
            .context("list active swaps")?
            .is_empty();
        if has_active {
            return Err(VersionError::ActiveSwaps {
                stored: stored.unwrap_or_else(|| "unknown".to_string()),
            }
            .into());
        }

        self.store
            .set_meta(VERSION_KEY, STORE_VERSION)
            .context("write store version")?;
        tracing::info!(
            from = stored.as_deref().unwrap_or("none"),
            to = STORE_VERSION,
            "swap store version upgraded"
        );
        Ok(())
    }
}

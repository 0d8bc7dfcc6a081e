//! The application-wide "pause indexing" switch.
//!
//! Pausing is advisory: live writers are expected to check the flag before
//! indexing. Migrations that declare `pause_indexing` flip it for the length
//! of their run.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read and write the pause-indexing setting.
pub trait IndexingControl: Send + Sync {
    fn is_paused(&self) -> Result<bool>;

    fn set_paused(&self, paused: bool) -> Result<()>;
}

/// In-process pause flag. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct IndexingSwitch {
    paused: Arc<AtomicBool>,
}

impl IndexingSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paused() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl IndexingControl for IndexingSwitch {
    fn is_paused(&self) -> Result<bool> {
        Ok(self.paused.load(Ordering::SeqCst))
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        self.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }
}

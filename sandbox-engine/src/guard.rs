use std::ops::Deref;
use std::sync::Arc;

use sandbox::Result;
use tracing::{debug, warn};

use crate::lifecycle::SandboxController;
use crate::manager::SandboxManager;

/// A sandbox that is cleaned up when the guard goes away.
///
/// Prefer [`release`](Self::release), which reports cleanup errors. Dropping
/// an unreleased guard schedules a forced cleanup on the current runtime.
pub struct SandboxGuard {
    manager: SandboxManager,
    controller: Arc<SandboxController>,
    released: bool,
}

impl SandboxGuard {
    pub(crate) fn new(manager: SandboxManager, controller: Arc<SandboxController>) -> Self {
        Self {
            manager,
            controller,
            released: false,
        }
    }

    pub fn controller(&self) -> Arc<SandboxController> {
        Arc::clone(&self.controller)
    }

    /// Clean up the sandbox. If the graceful pass fails a forced pass runs,
    /// and the graceful error is returned.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let id = self.controller.id().clone();

        match self.manager.cleanup(&id, false).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(id = %id, error = %e, "graceful release failed, forcing cleanup");
                if let Err(forced) = self.manager.cleanup(&id, true).await {
                    warn!(id = %id, error = %forced, "forced release failed");
                }
                Err(e)
            }
        }
    }
}

impl Deref for SandboxGuard {
    type Target = SandboxController;

    fn deref(&self) -> &SandboxController {
        &self.controller
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.controller.id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                debug!(id = %id, "guard dropped, scheduling cleanup");
                handle.spawn(async move {
                    if let Err(e) = manager.cleanup(&id, true).await {
                        warn!(id = %id, error = %e, "cleanup of dropped guard failed");
                    }
                });
            }
            Err(_) => {
                warn!(id = %id, "guard dropped outside a runtime; sandbox left for the scheduler");
            }
        }
    }
}

pub mod multi;
pub mod unified;

pub use multi::{MultiHandle, MultiTransportManager};
pub use unified::{UnifiedHandle, UnifiedManager, UnifiedState};

use crate::domain::ServerSpec;
use crate::supervisor::SupervisorHandle;

/// Uniform entry point for handing a new desired set to whichever mode is
/// running; the reload loop does not care which one it is.
#[derive(Clone)]
pub enum ModeHandle {
    Individual(SupervisorHandle),
    Unified(UnifiedHandle),
    Multi(MultiHandle),
}

impl ModeHandle {
    pub async fn apply(&self, desired: Vec<ServerSpec>) {
        match self {
            Self::Individual(handle) => handle.reconcile(desired).await,
            Self::Unified(handle) => handle.reload(desired).await,
            Self::Multi(handle) => {
                handle.unified.reload(desired.clone()).await;
                handle.reload(desired).await;
            }
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Individual(handle) => handle.shutdown().await,
            Self::Unified(handle) => handle.shutdown().await,
            Self::Multi(handle) => handle.shutdown().await,
        }
    }
}

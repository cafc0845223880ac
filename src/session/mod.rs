#![forbid(unsafe_code)]

// Session pair - the two endpoints of one test run and everything bound to them

pub mod channel;
pub mod negotiator;
pub mod stream;

pub use channel::{ChannelDescriptor, ChannelPairs, ChannelState};
pub use negotiator::Negotiator;
pub use stream::{RenderTarget, StreamPairs};

use crate::error::HarnessResult;
use crate::transport::{EndpointRole, Platform, SessionEndpoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Local and remote endpoints of one run. Closed at most once.
pub struct SessionPair<E: SessionEndpoint> {
    pub local: Arc<E>,
    pub remote: Arc<E>,
    closed: AtomicBool,
}

impl<E: SessionEndpoint> SessionPair<E> {
    pub async fn open<P>(platform: &P) -> HarnessResult<Self>
    where
        P: Platform<Endpoint = E>,
    {
        let local = platform.create_endpoint(EndpointRole::Local).await?;
        let remote = platform.create_endpoint(EndpointRole::Remote).await?;
        debug!("Opened {} session pair", platform.name());
        Ok(Self {
            local,
            remote,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes both endpoints. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.local.close().await {
            warn!("Failed to close local endpoint: {}", e);
        }
        if let Err(e) = self.remote.close().await {
            warn!("Failed to close remote endpoint: {}", e);
        }
    }
}

impl<E: SessionEndpoint> Drop for SessionPair<E> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropped mid-run, e.g. when the run future was cancelled
        let local = Arc::clone(&self.local);
        let remote = Arc::clone(&self.remote);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = local.close().await;
                let _ = remote.close().await;
            });
        }
    }
}

#![forbid(unsafe_code)]

// Negotiator - offer/answer exchange plus candidate relay between the two endpoints.
// Candidates gathered before the target holds a remote description are queued.

use super::SessionPair;
use crate::error::{HarnessError, HarnessResult};
use crate::transport::{IceCandidate, SessionEndpoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum RelayState {
    Queued(Vec<IceCandidate>),
    Open,
}

/// Forwards candidates from one endpoint to the other.
struct CandidateRelay<E: SessionEndpoint> {
    name: &'static str,
    target: Weak<E>,
    state: Mutex<RelayState>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    rejected: AtomicBool,
}

impl<E: SessionEndpoint> CandidateRelay<E> {
    fn new(name: &'static str, target: &Arc<E>) -> Arc<Self> {
        Arc::new(Self {
            name,
            target: Arc::downgrade(target),
            state: Mutex::new(RelayState::Queued(Vec::new())),
            in_flight: Mutex::new(Vec::new()),
            rejected: AtomicBool::new(false),
        })
    }

    /// Candidate callbacks are synchronous, so once open each one is handed
    /// to a task that [`CandidateRelay::settle`] can later await.
    fn relay(self: &Arc<Self>, candidate: IceCandidate) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let RelayState::Queued(pending) = &mut *state {
                pending.push(candidate);
                return;
            }
        }
        let relay = Arc::clone(self);
        let handle = tokio::spawn(async move { relay.deliver(vec![candidate]).await });
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Called once the target has its remote description; delivers the queue
    /// before returning.
    async fn open(&self) {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, RelayState::Open) {
                RelayState::Queued(pending) => pending,
                RelayState::Open => Vec::new(),
            }
        };
        if !pending.is_empty() {
            debug!("Flushing {} queued candidates {}", pending.len(), self.name);
            self.deliver(pending).await;
        }
    }

    async fn deliver(&self, candidates: Vec<IceCandidate>) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        for candidate in candidates {
            if let Err(e) = target.add_ice_candidate(candidate).await {
                warn!("Candidate rejected {}: {}", self.name, e);
                self.rejected.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Waits for every candidate relayed so far to be accepted or refused.
    async fn settle(&self) {
        let handles = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Candidate delivery {} aborted: {}", self.name, e);
            }
        }
    }

    fn was_rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Drives the handshake for one session pair.
pub struct Negotiator<E: SessionEndpoint> {
    local: Arc<E>,
    remote: Arc<E>,
    to_remote: Arc<CandidateRelay<E>>,
    to_local: Arc<CandidateRelay<E>>,
}

impl<E: SessionEndpoint> Negotiator<E> {
    /// Installs candidate relays in both directions. Call before [`Negotiator::negotiate`].
    pub fn attach(pair: &SessionPair<E>) -> Self {
        let to_remote = CandidateRelay::new("local -> remote", &pair.remote);
        let to_local = CandidateRelay::new("remote -> local", &pair.local);

        let relay = Arc::clone(&to_remote);
        pair.local
            .on_ice_candidate(Box::new(move |candidate| relay.relay(candidate)));
        let relay = Arc::clone(&to_local);
        pair.remote
            .on_ice_candidate(Box::new(move |candidate| relay.relay(candidate)));

        Self {
            local: Arc::clone(&pair.local),
            remote: Arc::clone(&pair.remote),
            to_remote,
            to_local,
        }
    }

    /// Runs offer/answer to completion. Either application in a phase failing
    /// fails the whole negotiation, as does any candidate refused by the time
    /// the answer is committed.
    pub async fn negotiate(&self) -> HarnessResult<()> {
        let offer = self
            .local
            .create_offer()
            .await
            .map_err(|e| HarnessError::NegotiationFailure(format!("create offer: {e}")))?;

        tokio::try_join!(
            self.local.set_local_description(offer.clone()),
            self.remote.set_remote_description(offer),
        )
        .map_err(|e| HarnessError::NegotiationFailure(format!("apply offer: {e}")))?;
        self.to_remote.open().await;

        let answer = self
            .remote
            .create_answer()
            .await
            .map_err(|e| HarnessError::NegotiationFailure(format!("create answer: {e}")))?;

        tokio::try_join!(
            self.remote.set_local_description(answer.clone()),
            self.local.set_remote_description(answer),
        )
        .map_err(|e| HarnessError::NegotiationFailure(format!("apply answer: {e}")))?;
        self.to_local.open().await;

        tokio::join!(self.to_remote.settle(), self.to_local.settle());
        self.check_candidates()
    }

    /// Fails if any relayed candidate was refused so far.
    pub fn check_candidates(&self) -> HarnessResult<()> {
        if self.to_remote.was_rejected() || self.to_local.was_rejected() {
            return Err(HarnessError::NegotiationFailure(
                "peer rejected a connectivity candidate".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackLimits, LoopbackPlatform};
    use std::time::Duration;

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:0 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_negotiation_completes() {
        let platform = LoopbackPlatform::default();
        let pair = SessionPair::open(&platform).await.unwrap();
        let negotiator = Negotiator::attach(&pair);

        negotiator.negotiate().await.unwrap();
        assert!(negotiator.check_candidates().is_ok());
        pair.close().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_rejected_candidate_fails_negotiation() {
        let platform = LoopbackPlatform::new(LoopbackLimits {
            reject_candidates: true,
            ..Default::default()
        });
        let pair = SessionPair::open(&platform).await.unwrap();
        let negotiator = Negotiator::attach(&pair);

        match negotiator.negotiate().await {
            Err(HarnessError::NegotiationFailure(reason)) => assert!(reason.contains("candidate")),
            other => panic!("unexpected result: {other:?}"),
        }
        pair.close().await;
    }

    #[tokio::test]
    async fn test_settle_waits_for_trickled_candidates() {
        let platform = LoopbackPlatform::new(LoopbackLimits {
            reject_candidates: true,
            ..Default::default()
        });
        let pair = SessionPair::open(&platform).await.unwrap();
        let offer = pair.local.create_offer().await.unwrap();
        pair.remote.set_remote_description(offer).await.unwrap();

        let relay = CandidateRelay::new("local -> remote", &pair.remote);
        relay.open().await;
        relay.relay(candidate());
        relay.settle().await;
        assert!(relay.was_rejected());
    }

    #[tokio::test]
    async fn test_rejected_offer_fails_negotiation() {
        let platform = LoopbackPlatform::new(LoopbackLimits {
            reject_offer: true,
            ..Default::default()
        });
        let pair = SessionPair::open(&platform).await.unwrap();
        let negotiator = Negotiator::attach(&pair);

        match negotiator.negotiate().await {
            Err(HarnessError::NegotiationFailure(reason)) => assert!(reason.contains("offer")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let platform = LoopbackPlatform::default();
        let pair = SessionPair::open(&platform).await.unwrap();
        let relay = CandidateRelay::new("local -> remote", &pair.remote);

        // Remote has no description yet; forwarding now would be rejected
        relay.relay(candidate());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!relay.was_rejected());

        let offer = pair.local.create_offer().await.unwrap();
        pair.remote.set_remote_description(offer).await.unwrap();
        relay.open().await;
        assert!(!relay.was_rejected());
    }
}

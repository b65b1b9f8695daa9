//! # Decryption Request Correlator
//!
//! Tracks the decryption requests one contract has in flight and decides
//! whether a responder's answer is acceptable. Each contract owns its own
//! correlator; the runtime routes a resolution to whichever contract's
//! correlator knows the request id.
//!
//! ## Lifecycle
//!
//! ```text
//!            submit
//!              |
//!              v
//!          [Pending] --- mark_resolved ---> [Resolved]
//!              |
//!           expire (now >= deadline)
//!              |
//!              v
//!          [Expired]
//! ```
//!
//! Both exits are terminal and guarded by the `Pending` check, so a request
//! resolves at most once, expires at most once, and never does both.
//!
//! ## What `verify` checks
//!
//! 1. The request exists and is still `Pending` (kills replays and late
//!    answers).
//! 2. The attestation verifies under the responder key pinned at
//!    deployment, over a message binding the request id and handle.
//! 3. `commit(plaintext, blinding)` equals the handle's stored commitment.
//!
//! Any failure is [`CorrelatorError::InvalidResolution`] and leaves the
//! request untouched.
//!
//! ## Retention
//!
//! Requests are kept for the life of the process, terminal ones included.
//! A resolved or expired id must stay known so a replayed or late answer is
//! refused as such, and so lookups by id keep returning the final state.
//! Nothing is pruned; the correlator is in-memory and starts empty on
//! restart.

use chrono::{DateTime, Duration, Utc};
use cloak_protocol::commitment::verify_commitment;
use cloak_protocol::config::REQUEST_ID_DOMAIN;
use cloak_protocol::crypto::hash::derive;
use cloak_protocol::crypto::CloakPublicKey;
use cloak_protocol::{Address, CiphertextHandle, CiphertextStore, RequestId, Resolution, StoreError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use crate::events::Event;
use crate::receiver::ExecutionContext;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a resolution was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionFault {
    UnknownRequest,
    AlreadyResolved,
    Expired,
    BadAttestation,
    MalformedBlinding,
    CommitmentMismatch,
}

impl fmt::Display for ResolutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionFault::UnknownRequest => write!(f, "unknown request"),
            ResolutionFault::AlreadyResolved => write!(f, "request already resolved"),
            ResolutionFault::Expired => write!(f, "request expired"),
            ResolutionFault::BadAttestation => write!(f, "attestation does not verify"),
            ResolutionFault::MalformedBlinding => write!(f, "malformed blinding factor"),
            ResolutionFault::CommitmentMismatch => {
                write!(f, "plaintext does not open the handle's commitment")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("invalid resolution for {request_id}: {fault}")]
    InvalidResolution {
        request_id: RequestId,
        fault: ResolutionFault,
    },

    #[error("{requester} is not allowed to request decryption of {handle}")]
    HandleNotAllowed {
        handle: CiphertextHandle,
        requester: Address,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CorrelatorError {
    pub fn invalid(request_id: RequestId, fault: ResolutionFault) -> Self {
        CorrelatorError::InvalidResolution { request_id, fault }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which suspended operation is waiting on the plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    Withdrawal,
    Unwrap,
    Disclosure,
}

impl fmt::Display for RequestPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPurpose::Withdrawal => write!(f, "withdrawal"),
            RequestPurpose::Unwrap => write!(f, "unwrap"),
            RequestPurpose::Disclosure => write!(f, "disclosure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Resolved {
        plaintext: u64,
        resolved_at: DateTime<Utc>,
    },
    Expired {
        expired_at: DateTime<Utc>,
    },
}

impl RequestStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "Pending"),
            RequestStatus::Resolved { .. } => write!(f, "Resolved"),
            RequestStatus::Expired { .. } => write!(f, "Expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionRequest {
    pub id: RequestId,
    /// The contract that submitted the request.
    pub requester: Address,
    pub handle: CiphertextHandle,
    pub purpose: RequestPurpose,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DecryptionCorrelator {
    owner: Address,
    responder: CloakPublicKey,
    timeout: Duration,
    requests: BTreeMap<RequestId, DecryptionRequest>,
    nonce: u64,
}

impl DecryptionCorrelator {
    /// `owner` is the contract submitting requests; `responder` is the only
    /// key whose attestations will be accepted, for the correlator's lifetime.
    pub fn new(owner: Address, responder: CloakPublicKey, timeout: Duration) -> Self {
        Self {
            owner,
            responder,
            timeout,
            requests: BTreeMap::new(),
            nonce: 0,
        }
    }

    pub fn responder(&self) -> &CloakPublicKey {
        &self.responder
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a new request for `handle`.
    ///
    /// # Errors
    ///
    /// [`CorrelatorError::HandleNotAllowed`] if the owning contract is not on
    /// the handle's access list.
    pub fn submit(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        handle: CiphertextHandle,
        purpose: RequestPurpose,
    ) -> Result<RequestId, CorrelatorError> {
        if !ctx.store.contains(&handle) {
            return Err(StoreError::UnknownHandle(handle).into());
        }
        if !ctx.store.is_allowed(handle, &self.owner) {
            return Err(CorrelatorError::HandleNotAllowed {
                handle,
                requester: self.owner,
            });
        }

        self.nonce += 1;
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);
        let id = RequestId::from_bytes(derive(
            REQUEST_ID_DOMAIN,
            &[
                self.owner.as_bytes(),
                handle.as_bytes(),
                &self.nonce.to_le_bytes(),
                &entropy,
            ],
        ));

        let request = DecryptionRequest {
            id,
            requester: self.owner,
            handle,
            purpose,
            status: RequestStatus::Pending,
            submitted_at: ctx.now,
            deadline: ctx.now + self.timeout,
        };
        info!(
            requester = %self.owner,
            request_id = %id,
            purpose = %purpose,
            deadline = %request.deadline,
            "decryption requested"
        );
        self.requests.insert(id, request);
        ctx.emit(Event::DecryptionRequested {
            requester: self.owner,
            request_id: id,
            handle,
            purpose,
        });
        Ok(id)
    }

    /// Check a resolution without changing anything.
    pub fn verify(
        &self,
        store: &CiphertextStore,
        resolution: &Resolution,
    ) -> Result<&DecryptionRequest, CorrelatorError> {
        let id = resolution.request_id;
        let request = self
            .requests
            .get(&id)
            .ok_or_else(|| CorrelatorError::invalid(id, ResolutionFault::UnknownRequest))?;

        match request.status {
            RequestStatus::Pending => {}
            RequestStatus::Resolved { .. } => {
                warn!(request_id = %id, "replayed resolution");
                return Err(CorrelatorError::invalid(id, ResolutionFault::AlreadyResolved));
            }
            RequestStatus::Expired { .. } => {
                return Err(CorrelatorError::invalid(id, ResolutionFault::Expired));
            }
        }

        if !self
            .responder
            .verify(&resolution.signed_message(&request.handle), &resolution.attestation)
        {
            warn!(request_id = %id, "resolution attestation rejected");
            return Err(CorrelatorError::invalid(id, ResolutionFault::BadAttestation));
        }

        let blinding = resolution
            .blinding_scalar()
            .map_err(|_| CorrelatorError::invalid(id, ResolutionFault::MalformedBlinding))?;
        let commitment = store.commitment(&request.handle)?;
        if !verify_commitment(store.params(), &commitment, resolution.plaintext, blinding) {
            warn!(request_id = %id, "resolution does not open the commitment");
            return Err(CorrelatorError::invalid(id, ResolutionFault::CommitmentMismatch));
        }

        Ok(request)
    }

    /// `Pending -> Resolved`. Call only after the continuation succeeded.
    pub fn mark_resolved(
        &mut self,
        id: &RequestId,
        plaintext: u64,
        now: DateTime<Utc>,
    ) -> Result<(), CorrelatorError> {
        let request = self.pending_mut(id)?;
        request.status = RequestStatus::Resolved {
            plaintext,
            resolved_at: now,
        };
        info!(request_id = %id, purpose = %request.purpose, "decryption resolved");
        Ok(())
    }

    /// Pending requests whose deadline has passed, oldest id first.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<RequestId> {
        self.requests
            .values()
            .filter(|r| r.status.is_pending() && now >= r.deadline)
            .map(|r| r.id)
            .collect()
    }

    /// `Pending -> Expired`, emitting `DecryptionExpired`.
    pub fn expire(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        id: &RequestId,
    ) -> Result<DecryptionRequest, CorrelatorError> {
        let now = ctx.now;
        let request = self.pending_mut(id)?;
        request.status = RequestStatus::Expired { expired_at: now };
        let expired = request.clone();
        warn!(request_id = %id, purpose = %expired.purpose, "decryption request expired");
        ctx.emit(Event::DecryptionExpired {
            requester: expired.requester,
            request_id: *id,
        });
        Ok(expired)
    }

    pub fn request(&self, id: &RequestId) -> Option<&DecryptionRequest> {
        self.requests.get(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &DecryptionRequest> {
        self.requests.values().filter(|r| r.status.is_pending())
    }

    fn pending_mut(&mut self, id: &RequestId) -> Result<&mut DecryptionRequest, CorrelatorError> {
        let request = self
            .requests
            .get_mut(id)
            .ok_or_else(|| CorrelatorError::invalid(*id, ResolutionFault::UnknownRequest))?;
        match request.status {
            RequestStatus::Pending => Ok(request),
            RequestStatus::Resolved { .. } => {
                Err(CorrelatorError::invalid(*id, ResolutionFault::AlreadyResolved))
            }
            RequestStatus::Expired { .. } => Err(CorrelatorError::invalid(*id, ResolutionFault::Expired)),
        }
    }
}

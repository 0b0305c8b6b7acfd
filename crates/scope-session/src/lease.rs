use std::sync::Arc;
use std::time::SystemTime;

use scope_registry::{ErrorKind, RegistryError, ResourceRegistry, TelescopeStatus};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::metrics;

/// Exclusive right to one telescope, backed by a LOCK on the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub telescope_id: String,
    pub holder_id: String,
    pub acquired_at: SystemTime,
    /// Monotonic acquisition instant on the tokio clock.
    pub started: Instant,
    pub session_token: String,
}

/// Acquires and releases leases. Every call is a fresh registry round-trip.
#[derive(Clone)]
pub struct LeaseClient {
    registry: Arc<dyn ResourceRegistry>,
}

impl LeaseClient {
    pub fn new(registry: Arc<dyn ResourceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn acquire(&self, telescope_id: &str, holder_id: &str) -> Result<Lease, SessionError> {
        let result = self
            .registry
            .set_status(holder_id, telescope_id, TelescopeStatus::Locked)
            .await;
        let outcome = match result {
            Ok(state) if !state.subscribe_token.trim().is_empty() => Ok(Lease {
                telescope_id: telescope_id.to_string(),
                holder_id: holder_id.to_string(),
                acquired_at: SystemTime::now(),
                started: Instant::now(),
                session_token: state.subscribe_token,
            }),
            Ok(_) => {
                self.compensate(telescope_id, holder_id).await;
                Err(SessionError::Unreachable {
                    telescope_id: telescope_id.to_string(),
                    reason: "backend granted the lock without a session token".into(),
                })
            }
            Err(RegistryError::Decode(reason)) => {
                // The LOCK may have landed even though the answer was unreadable.
                self.compensate(telescope_id, holder_id).await;
                Err(SessionError::Unreachable {
                    telescope_id: telescope_id.to_string(),
                    reason,
                })
            }
            Err(err) => Err(classify_acquire_error(telescope_id, &err)),
        };
        match &outcome {
            Ok(_) => {
                metrics::LEASE_ACQUIRE.with_label_values(&["ok"]).inc();
                info!(target = "scope.lease", telescope_id, holder_id, "lease acquired");
            }
            Err(err) => {
                metrics::LEASE_ACQUIRE
                    .with_label_values(&[err.metric_label()])
                    .inc();
                warn!(target = "scope.lease", telescope_id, holder_id, error = %err, "lease not acquired");
            }
        }
        outcome
    }

    /// Single best-effort FREE. Never retried; the caller decides whether to log.
    pub async fn release(&self, telescope_id: &str, holder_id: &str) -> Result<(), SessionError> {
        match self
            .registry
            .set_status(holder_id, telescope_id, TelescopeStatus::Free)
            .await
        {
            Ok(_) => {
                metrics::LEASE_RELEASE.with_label_values(&["ok"]).inc();
                info!(target = "scope.lease", telescope_id, holder_id, "lease released");
                Ok(())
            }
            Err(err) => {
                metrics::LEASE_RELEASE.with_label_values(&["failed"]).inc();
                Err(SessionError::ReleaseFailed {
                    telescope_id: telescope_id.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn compensate(&self, telescope_id: &str, holder_id: &str) {
        if let Err(err) = self.release(telescope_id, holder_id).await {
            warn!(target = "scope.lease", telescope_id, error = %err, "compensating release failed");
        }
    }
}

/// Transient and unclassified failures leave the telescope state unknown;
/// everything else is a refusal.
fn classify_acquire_error(telescope_id: &str, err: &RegistryError) -> SessionError {
    let telescope_id = telescope_id.to_string();
    let reason = err.to_string();
    if err.is_transient() || err.kind() == ErrorKind::Unknown {
        SessionError::Unreachable {
            telescope_id,
            reason,
        }
    } else {
        SessionError::LeaseDenied {
            telescope_id,
            reason,
        }
    }
}

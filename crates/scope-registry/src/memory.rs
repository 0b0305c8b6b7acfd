use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    ControlMessage, Interests, Location, MountType, OpticalDesign, RegistryError,
    ResourceRegistry, Specifications, StateResponse, Telescope, TelescopeList, TelescopeStatus,
};

/// One recorded `set_status` request, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCall {
    pub holder_id: String,
    pub telescope_id: String,
    pub status: TelescopeStatus,
}

/// Parks LOCK requests until the test lets them through.
#[derive(Clone)]
pub struct LockGate {
    permits: Arc<Semaphore>,
    arrived: Arc<Notify>,
}

impl LockGate {
    fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            arrived: Arc::new(Notify::new()),
        }
    }

    /// Resolves once a LOCK request is parked at the gate.
    pub async fn arrival(&self) {
        self.arrived.notified().await;
    }

    /// Lets one parked (or future) LOCK request proceed.
    pub fn admit_one(&self) {
        self.permits.add_permits(1);
    }

    async fn pass(&self) {
        self.arrived.notify_one();
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

struct Entry {
    telescope: Telescope,
    specifications: Option<Specifications>,
    holder: Option<String>,
}

/// Registry kept in memory. Enforces a single holder per telescope the way the
/// backend does and records every status request for inspection.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: Mutex<Vec<Entry>>,
    status_calls: Mutex<Vec<StatusCall>>,
    controls: Mutex<Vec<(String, ControlMessage)>>,
    interests: Mutex<HashMap<String, Interests>>,
    unreachable: AtomicBool,
    fail_releases: AtomicBool,
    gate: Mutex<Option<LockGate>>,
}

impl InMemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry seeded with a handful of telescopes in every status.
    pub fn demo() -> Arc<Self> {
        let registry = Self::default();
        let site = |city: &str, country: &str, latitude, longitude| Location {
            city: Some(city.to_string()),
            country: Some(country.to_string()),
            latitude,
            longitude,
        };
        registry.insert(
            Telescope {
                telescope_id: "T1".into(),
                telescope_name: "Skawina Dobsonian".into(),
                price_per_minute: 0.5,
                location: site("Kraków", "Poland", 50.0614, 19.9366),
                status: TelescopeStatus::Free,
            },
            Some(Specifications {
                aperture: 254.0,
                focal_length: 1200.0,
                focal_ratio: 4.7,
                weight: 21.0,
                length: 1145.0,
                width: 300.0,
                height: 300.0,
                mount_type: MountType::Dobsonian,
                optical_design: OpticalDesign::Reflector,
            }),
        );
        registry.insert(
            Telescope {
                telescope_id: "T2".into(),
                telescope_name: "Tatra Refractor".into(),
                price_per_minute: 0.8,
                location: site("Zakopane", "Poland", 49.2992, 19.9496),
                status: TelescopeStatus::Locked,
            },
            Some(Specifications {
                aperture: 120.0,
                focal_length: 900.0,
                focal_ratio: 7.5,
                weight: 6.2,
                length: 1000.0,
                width: 140.0,
                height: 140.0,
                mount_type: MountType::Equatorial,
                optical_design: OpticalDesign::Refractor,
            }),
        );
        registry.insert(
            Telescope {
                telescope_id: "T3".into(),
                telescope_name: "Baltic SCT".into(),
                price_per_minute: 1.2,
                location: site("Gdańsk", "Poland", 54.3520, 18.6466),
                status: TelescopeStatus::Damaged,
            },
            Some(Specifications {
                aperture: 203.0,
                focal_length: 2032.0,
                focal_ratio: 10.0,
                weight: 14.0,
                length: 432.0,
                width: 230.0,
                height: 230.0,
                mount_type: MountType::Goto,
                optical_design: OpticalDesign::SchmidtCassegrain,
            }),
        );
        registry.insert(
            Telescope {
                telescope_id: "T4".into(),
                telescope_name: "Bieszczady Maksutov".into(),
                price_per_minute: 0.3,
                location: site("Ustrzyki Górne", "Poland", 49.1053, 22.6508),
                status: TelescopeStatus::Free,
            },
            None,
        );
        Arc::new(registry)
    }

    pub fn insert(&self, telescope: Telescope, specifications: Option<Specifications>) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.telescope.telescope_id != telescope.telescope_id);
        let holder = match telescope.status {
            TelescopeStatus::Locked => Some(String::from("someone-else")),
            _ => None,
        };
        entries.push(Entry {
            telescope,
            specifications,
            holder,
        });
    }

    pub fn status_of(&self, telescope_id: &str) -> Option<TelescopeStatus> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.telescope.telescope_id == telescope_id)
            .map(|entry| entry.telescope.status)
    }

    pub fn holder_of(&self, telescope_id: &str) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.telescope.telescope_id == telescope_id)
            .and_then(|entry| entry.holder.clone())
    }

    pub fn status_calls(&self) -> Vec<StatusCall> {
        self.status_calls.lock().clone()
    }

    pub fn calls_with_status(&self, telescope_id: &str, status: TelescopeStatus) -> usize {
        self.status_calls
            .lock()
            .iter()
            .filter(|call| call.telescope_id == telescope_id && call.status == status)
            .count()
    }

    pub fn controls(&self) -> Vec<(String, ControlMessage)> {
        self.controls.lock().clone()
    }

    pub fn interests_of(&self, telescope_id: &str) -> Option<Interests> {
        self.interests.lock().get(telescope_id).cloned()
    }

    /// Every call fails with a network error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// FREE requests fail with a network error while set; the telescope stays locked.
    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    /// Installs a gate that parks every subsequent LOCK request.
    pub fn gate_locks(&self) -> LockGate {
        let gate = LockGate::closed();
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    fn ensure_reachable(&self) -> Result<(), RegistryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RegistryError::Network("registry unreachable".into()));
        }
        Ok(())
    }

    fn transition(
        &self,
        holder_id: &str,
        telescope_id: &str,
        status: TelescopeStatus,
    ) -> Result<StateResponse, RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.telescope.telescope_id == telescope_id)
            .ok_or_else(|| RegistryError::NotFound(telescope_id.to_string()))?;
        let current = entry.telescope.status;
        match status {
            TelescopeStatus::Locked => {
                if current != TelescopeStatus::Free {
                    return Err(RegistryError::Conflict {
                        telescope_id: telescope_id.to_string(),
                        reason: format!("telescope is {current}"),
                    });
                }
                entry.telescope.status = TelescopeStatus::Locked;
                entry.holder = Some(holder_id.to_string());
                Ok(StateResponse {
                    subscribe_token: Uuid::new_v4().to_string(),
                })
            }
            TelescopeStatus::Free => {
                if current == TelescopeStatus::Locked
                    && entry.holder.as_deref() != Some(holder_id)
                {
                    warn!(
                        target = "registry.memory",
                        telescope_id,
                        holder_id,
                        holder = ?entry.holder,
                        "telescope freed by a user that does not hold it"
                    );
                }
                entry.telescope.status = TelescopeStatus::Free;
                entry.holder = None;
                Ok(StateResponse::default())
            }
            TelescopeStatus::Damaged => {
                entry.telescope.status = TelescopeStatus::Damaged;
                entry.holder = None;
                Ok(StateResponse::default())
            }
        }
    }
}

#[async_trait]
impl ResourceRegistry for InMemoryRegistry {
    async fn list(&self) -> Result<TelescopeList, RegistryError> {
        self.ensure_reachable()?;
        let telescopes = self
            .entries
            .lock()
            .iter()
            .map(|entry| entry.telescope.clone())
            .collect();
        Ok(TelescopeList::from_telescopes(telescopes))
    }

    async fn details(&self, telescope_id: &str) -> Result<Specifications, RegistryError> {
        self.ensure_reachable()?;
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.telescope.telescope_id == telescope_id)
            .and_then(|entry| entry.specifications.clone())
            .ok_or_else(|| RegistryError::NotFound(telescope_id.to_string()))
    }

    async fn set_status(
        &self,
        holder_id: &str,
        telescope_id: &str,
        status: TelescopeStatus,
    ) -> Result<StateResponse, RegistryError> {
        self.status_calls.lock().push(StatusCall {
            holder_id: holder_id.to_string(),
            telescope_id: telescope_id.to_string(),
            status,
        });
        if status == TelescopeStatus::Locked {
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                gate.pass().await;
            }
        }
        self.ensure_reachable()?;
        if status == TelescopeStatus::Free && self.fail_releases.load(Ordering::SeqCst) {
            return Err(RegistryError::Network("release dropped".into()));
        }
        let result = self.transition(holder_id, telescope_id, status);
        debug!(
            target = "registry.memory",
            telescope_id,
            holder_id,
            %status,
            ok = result.is_ok(),
            "status transition"
        );
        result
    }

    async fn publish_interests(
        &self,
        telescope_id: &str,
        interests: &Interests,
    ) -> Result<(), RegistryError> {
        self.ensure_reachable()?;
        if self.status_of(telescope_id).is_none() {
            return Err(RegistryError::NotFound(telescope_id.to_string()));
        }
        self.interests
            .lock()
            .insert(telescope_id.to_string(), interests.clone());
        Ok(())
    }

    async fn control(
        &self,
        telescope_id: &str,
        message: &ControlMessage,
    ) -> Result<(), RegistryError> {
        self.ensure_reachable()?;
        if self.status_of(telescope_id).is_none() {
            return Err(RegistryError::NotFound(telescope_id.to_string()));
        }
        self.controls
            .lock()
            .push((telescope_id.to_string(), message.clone()));
        Ok(())
    }
}

//! Client side of the telescope registry backend.
//!
//! The registry owns the list of telescopes and their lifecycle status. Session
//! code talks to it through [`ResourceRegistry`]; [`RegistryClient`] is the HTTP
//! implementation and [`InMemoryRegistry`] backs tests and offline runs.

mod client;
mod error;
mod memory;
mod model;

use async_trait::async_trait;

pub use client::RegistryClient;
pub use error::{ErrorKind, RegistryError};
pub use memory::{InMemoryRegistry, LockGate, StatusCall};
pub use model::{
    ControlMessage, Interests, Location, MountType, OpticalDesign, PostTelescopeResponse,
    Specifications, StateResponse, Telescope, TelescopeKind, TelescopeList, TelescopeRequest,
    TelescopeStatus,
};

#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    async fn list(&self) -> Result<TelescopeList, RegistryError>;

    async fn details(&self, telescope_id: &str) -> Result<Specifications, RegistryError>;

    /// Requests a status transition on behalf of `holder_id`. A transition to
    /// [`TelescopeStatus::Locked`] returns the token for the media session.
    async fn set_status(
        &self,
        holder_id: &str,
        telescope_id: &str,
        status: TelescopeStatus,
    ) -> Result<StateResponse, RegistryError>;

    async fn publish_interests(
        &self,
        telescope_id: &str,
        interests: &Interests,
    ) -> Result<(), RegistryError>;

    /// Forwards one control command to the telescope through the backend.
    async fn control(
        &self,
        telescope_id: &str,
        message: &ControlMessage,
    ) -> Result<(), RegistryError>;
}

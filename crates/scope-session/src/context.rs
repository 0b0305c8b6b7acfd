use std::sync::Arc;

use scope_registry::TelescopeStatus;
use tokio::sync::watch;

/// The user on whose behalf leases are taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub id: String,
    pub username: String,
}

impl Holder {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Session-scoped state shared between a coordinator and its presentation
/// layer. Passed explicitly; nothing here is process-wide.
#[derive(Debug, Clone)]
pub struct SessionContext {
    holder: Holder,
    cost: Arc<watch::Sender<f64>>,
}

impl SessionContext {
    pub fn new(holder: Holder) -> Self {
        let (cost, _) = watch::channel(0.0);
        Self {
            holder,
            cost: Arc::new(cost),
        }
    }

    pub fn holder(&self) -> &Holder {
        &self.holder
    }

    pub fn current_cost(&self) -> f64 {
        *self.cost.borrow()
    }

    pub fn cost_updates(&self) -> watch::Receiver<f64> {
        self.cost.subscribe()
    }

    pub(crate) fn publish_cost(&self, amount: f64) {
        self.cost.send_replace(amount);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    View,
    Control,
}

impl SessionMode {
    pub fn permits_control(self) -> bool {
        matches!(self, SessionMode::Control)
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionMode::View => "View Mode",
            SessionMode::Control => "Control and View Mode",
        }
    }
}

/// Modes a user may open on a telescope in the given status.
pub fn permitted_modes(status: TelescopeStatus) -> &'static [SessionMode] {
    match status {
        TelescopeStatus::Free => &[SessionMode::View, SessionMode::Control],
        TelescopeStatus::Locked => &[SessionMode::View],
        TelescopeStatus::Damaged => &[],
    }
}

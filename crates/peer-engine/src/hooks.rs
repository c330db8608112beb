use std::net::IpAddr;
use std::sync::Arc;

use crate::conn_id::ConnId;
use crate::error::HookError;

/// Runs before a new WireGuard endpoint is installed, with the new
/// endpoint's remote IP (spec.md §4.7 step 5, §6). Lets OS-level
/// collaborators (route installer, firewall allow-listing) observe the
/// transition. Failures are logged, never abort installation (spec.md §7).
pub type BeforeAddPeerHook = Arc<dyn Fn(ConnId, IpAddr) -> Result<(), HookError> + Send + Sync>;

/// Runs after a WireGuard peer has been fully removed (spec.md §6).
/// Failures are logged, never abort removal.
pub type AfterRemovePeerHook = Arc<dyn Fn(ConnId) -> Result<(), HookError> + Send + Sync>;

/// Ordered collection of hooks, invoked in insertion order (spec.md §6).
#[derive(Default, Clone)]
pub struct Hooks {
    before_add: Vec<BeforeAddPeerHook>,
    after_remove: Vec<AfterRemovePeerHook>,
}

impl Hooks {
    pub fn add_before_add_peer_hook(&mut self, hook: BeforeAddPeerHook) {
        self.before_add.push(hook);
    }

    pub fn add_after_remove_peer_hook(&mut self, hook: AfterRemovePeerHook) {
        self.after_remove.push(hook);
    }

    pub fn run_before_add(&self, conn_id: ConnId, ip: IpAddr) {
        for hook in &self.before_add {
            if let Err(err) = hook(conn_id, ip) {
                tracing::warn!(%conn_id, %err, "Before-add-peer hook failed");
            }
        }
    }

    pub fn run_after_remove(&self, conn_id: ConnId) {
        for hook in &self.after_remove {
            if let Err(err) = hook(conn_id) {
                tracing::warn!(%conn_id, %err, "After-remove-peer hook failed");
            }
        }
    }
}

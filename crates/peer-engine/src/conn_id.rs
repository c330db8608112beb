use uuid::Uuid;

/// Opaque identifier for one installed WireGuard endpoint epoch
/// (spec.md §3 "connID"). Generated fresh on every successful endpoint
/// installation and threaded through the before-add/after-remove hooks so
/// each installation is bracketed exactly once (invariant I3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

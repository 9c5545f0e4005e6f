// Fault-injection sites
//
// Tests install hooks at fixed named points in the prepare and finish
// pipelines; the hooks may sleep, record, or panic to simulate a crash at
// exactly that point. Production builds never install hooks, so each site
// is a map lookup and nothing more.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Named injection points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSite {
    /// Payload assembly has begun for a prepare.
    StartPrepareTx,
    /// The prepare record is durable and the transaction is marked valid.
    EndPreparedTwoPhaseSleep,
    /// About to insert the commit-prepared record.
    TwoPhaseTransactionCommitPrepared,
    /// About to insert the abort-prepared record.
    TwoPhaseTransactionAbortPrepared,
    /// The finish pipeline has retired the slot.
    FinishPreparedAfterRecordCommitPrepared,
}

type FaultHook = Box<dyn Fn() + Send + Sync>;

static HOOKS: Lazy<RwLock<HashMap<FaultSite, FaultHook>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Runs the hook registered at `site`, if any.
pub fn inject(site: FaultSite) {
    if let Some(hook) = HOOKS.read().get(&site) {
        hook();
    }
}

/// Installs a hook at `site`, replacing any previous one.
pub fn set_hook(site: FaultSite, hook: impl Fn() + Send + Sync + 'static) {
    HOOKS.write().insert(site, Box::new(hook));
}

/// Removes the hook at `site`.
pub fn clear_hook(site: FaultSite) {
    HOOKS.write().remove(&site);
}

/// Removes every installed hook.
pub fn clear_all() {
    HOOKS.write().clear();
}

//! Pure predicates deciding which observed changes are worth a reconcile.

use kiln_core::{Build, Kit, KitPhase, Platform};

/// One observed change, with the previous version when there is one.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K> {
    Added(K),
    Updated { old: K, new: K },
    /// `state_unknown` marks a tombstone inferred from a relist rather than
    /// a confirmed delete event.
    Deleted { obj: K, state_unknown: bool },
}

impl<K> Change<K> {
    /// Latest known version of the object.
    pub fn object(&self) -> &K {
        match self {
            Change::Added(o) => o,
            Change::Updated { new, .. } => new,
            Change::Deleted { obj, .. } => obj,
        }
    }
}

/// Spec edits move the generation; the phase check lets this controller's
/// own phase moves re-enter the loop.
pub fn kit_changed(change: &Change<Kit>) -> bool {
    match change {
        Change::Added(_) => true,
        Change::Updated { old, new } => old.generation() != new.generation() || old.phase() != new.phase(),
        Change::Deleted { state_unknown, .. } => !state_unknown,
    }
}

/// Build tasks are immutable once submitted, so only phase moves count.
pub fn build_changed(change: &Change<Build>) -> bool {
    match change {
        Change::Added(_) => true,
        Change::Updated { old, new } => old.phase() != new.phase(),
        Change::Deleted { state_unknown, .. } => !state_unknown,
    }
}

pub fn platform_became_ready(change: &Change<Platform>) -> bool {
    match change {
        Change::Added(p) => p.is_ready(),
        Change::Updated { old, new } => new.is_ready() && !old.is_ready(),
        Change::Deleted { .. } => false,
    }
}

/// Whether a ready platform should wake this kit: it must be parked in
/// `WaitingForPlatform` and not pinned to another platform or operator.
pub fn should_wake(kit: &Kit, platform_name: &str, operator_id: &str) -> bool {
    if kit.phase() != KitPhase::WaitingForPlatform {
        return false;
    }
    if matches!(kit.platform_selector(), Some(sel) if sel != platform_name) {
        return false;
    }
    if matches!(kit.operator_id(), Some(id) if id != operator_id) {
        return false;
    }
    true
}

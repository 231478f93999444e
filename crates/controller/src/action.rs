//! The kit action chain. Each pass runs the first action that accepts the
//! kit; an action either proposes a new kit (persisted by the reconciler)
//! or returns `None` when there is nothing to record.

use kiln_builder::BuilderConfig;
use kiln_core::Kit;
use kiln_store::ClusterStore;

mod build;
mod initialize;
mod monitor;

pub use build::build_name;

/// Dependencies handed to an action for one pass. Actions hold no state.
pub struct ActionContext<'a> {
    pub store: &'a dyn ClusterStore,
    pub builder: &'a BuilderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Initialize,
    Build,
    Monitor,
    Error,
}

impl Action {
    /// Dispatch order.
    pub const CHAIN: [Action; 4] = [Action::Initialize, Action::Build, Action::Monitor, Action::Error];

    pub fn name(self) -> &'static str {
        match self {
            Action::Initialize => "initialize",
            Action::Build => "build",
            Action::Monitor => "monitor",
            Action::Error => "error",
        }
    }

    /// First action in the chain that accepts `kit`.
    pub fn select(kit: &Kit) -> Option<Action> {
        Self::CHAIN.into_iter().find(|a| a.can_handle(kit))
    }

    pub fn can_handle(self, kit: &Kit) -> bool {
        match self {
            Action::Initialize => initialize::can_handle(kit),
            Action::Build => build::can_handle(kit),
            Action::Monitor => monitor::can_handle_ready(kit),
            Action::Error => monitor::can_handle_error(kit),
        }
    }

    pub async fn handle(self, ctx: &ActionContext<'_>, kit: &Kit) -> anyhow::Result<Option<Kit>> {
        match self {
            Action::Initialize => initialize::handle(ctx, kit).await,
            Action::Build => build::handle(ctx, kit).await,
            Action::Monitor | Action::Error => Ok(monitor::handle(kit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{KitPhase, KitSpec, KitStatus};

    fn in_phase(phase: KitPhase) -> Kit {
        let mut k = Kit::new("a", KitSpec::default());
        k.status = Some(KitStatus { phase, ..Default::default() });
        k
    }

    #[test]
    fn every_post_bootstrap_phase_has_exactly_one_action() {
        use KitPhase::*;
        for phase in [Initialization, WaitingForCatalog, BuildSubmitted, BuildRunning, Ready, Error] {
            let kit = in_phase(phase);
            let n = Action::CHAIN.iter().filter(|a| a.can_handle(&kit)).count();
            assert_eq!(n, 1, "{phase}");
        }
        for phase in [None, WaitingForPlatform] {
            assert_eq!(Action::select(&in_phase(phase)), Option::None, "{phase}");
        }
    }

    #[test]
    fn select_maps_phases_to_actions() {
        assert_eq!(Action::select(&in_phase(KitPhase::WaitingForCatalog)), Some(Action::Initialize));
        assert_eq!(Action::select(&in_phase(KitPhase::BuildRunning)), Some(Action::Build));
        assert_eq!(Action::select(&in_phase(KitPhase::Ready)), Some(Action::Monitor));
        assert_eq!(Action::select(&in_phase(KitPhase::Error)), Some(Action::Error));
    }
}

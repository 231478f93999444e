use kiln_core::{Kit, KitPhase};
use kube::ResourceExt;
use tracing::info;

pub(super) fn can_handle_ready(kit: &Kit) -> bool {
    kit.phase() == KitPhase::Ready
}

pub(super) fn can_handle_error(kit: &Kit) -> bool {
    kit.phase() == KitPhase::Error
}

/// Settled kits only move again when their spec is edited.
pub(super) fn handle(kit: &Kit) -> Option<Kit> {
    if kit.generation() == kit.observed_generation() {
        return None;
    }
    info!(
        kit = %kit.name_any(),
        generation = ?kit.generation(),
        observed = ?kit.observed_generation(),
        "spec changed, restarting kit lifecycle"
    );
    let mut next = kit.clone();
    let st = next.status_mut();
    st.phase = KitPhase::WaitingForPlatform;
    st.failure = None;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{KitSpec, KitStatus};

    fn settled(phase: KitPhase, generation: i64, observed: i64) -> Kit {
        let mut k = Kit::new("a", KitSpec::default());
        k.metadata.generation = Some(generation);
        k.status = Some(KitStatus {
            phase,
            observed_generation: Some(observed),
            failure: Some("boom".into()),
            ..Default::default()
        });
        k
    }

    #[test]
    fn unchanged_generation_is_a_no_op() {
        assert_eq!(handle(&settled(KitPhase::Ready, 2, 2)), None);
        assert_eq!(handle(&settled(KitPhase::Error, 1, 1)), None);
    }

    #[test]
    fn edited_spec_resets_to_waiting_for_platform() {
        for phase in [KitPhase::Ready, KitPhase::Error] {
            let next = handle(&settled(phase, 3, 2)).unwrap();
            assert_eq!(next.phase(), KitPhase::WaitingForPlatform);
            assert_eq!(next.status.as_ref().unwrap().failure, None);
        }
    }
}

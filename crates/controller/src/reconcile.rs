//! One reconcile pass for one kit.

use std::sync::Arc;
use std::time::Duration;

use kiln_builder::BuilderConfig;
use kiln_core::conditions::{self, PLATFORM_AVAILABLE};
use kiln_core::{kit_digest, Condition, ConditionStatus, DigestError, Kit, KitPhase, ObjectKey};
use kiln_store::{ClusterStore, StoreError};
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::action::{Action, ActionContext};
use crate::events::{EventKind, EventSink, REASON_PHASE_CHANGED, REASON_RECONCILE_ERROR};
use crate::platform::{resolve_platform, OperatorConfig, PlatformError};

/// Poll interval while a kit waits for its runtime catalog.
pub const CATALOG_REQUEUE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error("action {action} failed: {error:#}")]
    Action { action: &'static str, error: anyhow::Error },
    #[error("refusing phase transition {from} -> {to}")]
    Transition { from: KitPhase, to: KitPhase },
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Store(e) if e.is_conflict())
    }
}

/// What the runtime should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Done,
    RequeueAfter(Duration),
}

pub struct KitReconciler {
    store: Arc<dyn ClusterStore>,
    events: Arc<dyn EventSink>,
    operator: OperatorConfig,
    builder: BuilderConfig,
}

impl KitReconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        events: Arc<dyn EventSink>,
        operator: OperatorConfig,
        builder: BuilderConfig,
    ) -> Self {
        Self { store, events, operator, builder }
    }

    pub fn operator(&self) -> &OperatorConfig {
        &self.operator
    }

    /// Read the kit, move it at most one step, persist the step.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Next, ReconcileError> {
        if !self.operator.watches(&key.namespace) {
            info!(kit = %key, "namespace not watched by this operator, skipping");
            return Ok(Next::Done);
        }
        let Some(instance) = self.store.get_kit(key).await? else {
            debug!(kit = %key, "kit gone");
            return Ok(Next::Done);
        };
        if !self.operator.is_responsible_for(&instance) {
            info!(kit = %key, operator = ?instance.operator_id(), "kit belongs to another operator, skipping");
            return Ok(Next::Done);
        }

        let mut target = instance.clone();
        if matches!(instance.phase(), KitPhase::None | KitPhase::WaitingForPlatform) {
            let lookup_err = self.bootstrap(&mut target).await;
            if target.status != instance.status {
                self.update_status(&instance, target).await?;
                return Ok(Next::Done);
            }
            if let Some(e) = lookup_err {
                return Err(e.into());
            }
        }

        let Some(action) = Action::select(&target) else {
            return Ok(Next::Done);
        };
        let ctx = ActionContext { store: self.store.as_ref(), builder: &self.builder };
        let span = info_span!("action", kit = %key, action = action.name(), phase = %target.phase());
        let phase = match action.handle(&ctx, &target).instrument(span).await {
            Err(error) => {
                self.events
                    .publish(&target, EventKind::Warning, REASON_RECONCILE_ERROR, format!("{:#}", error))
                    .await;
                return Err(ReconcileError::Action { action: action.name(), error });
            }
            Ok(None) => target.phase(),
            Ok(Some(next)) => {
                let (from, to) = (target.phase(), next.phase());
                if !from.can_transition_to(to) {
                    return Err(ReconcileError::Transition { from, to });
                }
                if let Err(e) = self.update_status(&instance, next).await {
                    self.events
                        .publish(&target, EventKind::Warning, REASON_RECONCILE_ERROR, e.to_string())
                        .await;
                    return Err(e);
                }
                if from != to {
                    info!(kit = %key, from = %from, to = %to, "phase changed");
                    self.events
                        .publish(&target, EventKind::Normal, REASON_PHASE_CHANGED, format!("{} -> {}", from, to))
                        .await;
                }
                to
            }
        };

        Ok(match phase {
            KitPhase::WaitingForCatalog => Next::RequeueAfter(CATALOG_REQUEUE),
            _ => Next::Done,
        })
    }

    /// Bind the kit to a platform, or park it until one is usable. Returns
    /// the lookup error, if any, so the caller can retry when nothing changed.
    async fn bootstrap(&self, target: &mut Kit) -> Option<PlatformError> {
        if target.is_prebuilt() {
            target.status_mut().phase = KitPhase::Initialization;
            return None;
        }
        let (ok, message, err) = match resolve_platform(self.store.as_ref(), target).await {
            Ok(p) if p.is_ready() => {
                let name = p.name_any();
                let st = target.status_mut();
                st.phase = KitPhase::Initialization;
                st.platform = Some(name.clone());
                (true, format!("platform {} is ready", name), None)
            }
            Ok(p) => {
                target.status_mut().phase = KitPhase::WaitingForPlatform;
                (false, format!("platform {} is not ready (phase {:?})", p.name_any(), p.phase()), None)
            }
            Err(e) => {
                warn!(kit = %target.name_any(), error = %e, "platform lookup failed");
                target.status_mut().phase = KitPhase::WaitingForPlatform;
                (false, e.to_string(), Some(e))
            }
        };
        let status = if ok { ConditionStatus::True } else { ConditionStatus::False };
        conditions::set(
            &mut target.status_mut().conditions,
            Condition::new(PLATFORM_AVAILABLE, status, PLATFORM_AVAILABLE, message),
        );
        err
    }

    /// Stamp digest and observed generation on `target`, then write its
    /// status as a merge patch guarded by `base`'s resource version.
    async fn update_status(&self, base: &Kit, mut target: Kit) -> Result<Kit, ReconcileError> {
        target.status_mut().observed_generation = base.generation();
        let digest = kit_digest(&target)?;
        target.status_mut().digest = digest;
        match self.store.patch_kit_status(base, &target).await {
            Ok(k) => {
                debug!(kit = %k.name_any(), phase = %k.phase(), "status updated");
                Ok(k)
            }
            Err(e) => {
                if e.is_conflict() {
                    debug!(kit = %base.name_any(), "status write lost a race, will retry");
                }
                Err(e.into())
            }
        }
    }
}

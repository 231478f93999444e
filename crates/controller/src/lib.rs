//! Kiln controller: drives kits through their lifecycle, one persisted
//! phase step per reconcile pass.

#![forbid(unsafe_code)]

pub mod action;
pub mod catalog;
pub mod events;
pub mod platform;
pub mod reconcile;
pub mod runtime;

pub use action::{Action, ActionContext};
pub use events::{EventKind, EventSink, KubeEvents, LogEvents, MemoryEvents};
pub use platform::{resolve_platform, OperatorConfig, PlatformError};
pub use reconcile::{KitReconciler, Next, ReconcileError, CATALOG_REQUEUE};
pub use runtime::{spawn_workers, Backoff, RuntimeConfig};

//! Kiln core types: the `Kit`, `Build` and `Platform` resources, their
//! phases and conditions, and the content digest stamped on every status write.

#![forbid(unsafe_code)]

use std::fmt;

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod digest;
pub mod resources;

pub use conditions::{Condition, ConditionStatus};
pub use digest::{kit_digest, DigestError};
pub use resources::*;

/// API group shared by all kiln resources.
pub const GROUP: &str = "kiln.dev";
/// Names the platform a kit must bind to, overriding the namespace default.
pub const PLATFORM_SELECTOR_ANNOTATION: &str = "kiln.dev/platform.selector";
/// Names the operator instance responsible for a resource.
pub const OPERATOR_ID_ANNOTATION: &str = "kiln.dev/operator.id";
/// Kit type label: `platform` (built by kiln), `external` or `synthetic`.
pub const KIT_TYPE_LABEL: &str = "kiln.dev/kit.type";
/// Kit generation a Build was submitted for.
pub const KIT_GENERATION_ANNOTATION: &str = "kiln.dev/kit.generation";

/// Namespaced identity of a resource, used as the work-queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of a namespaced resource; cluster-scoped objects get an empty namespace.
    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self { namespace: obj.namespace().unwrap_or_default(), name: obj.name_any() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub mod prelude {
    pub use super::{
        Build, BuildPhase, BuildSpec, BuildStatus, Condition, ConditionStatus, JibTask, Kit, KitPhase, KitSpec,
        KitStatus, ObjectKey, Platform, PlatformPhase, PlatformSpec, PlatformStatus, TaskSpec,
    };
}

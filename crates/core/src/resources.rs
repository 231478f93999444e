//! Custom resources: `Kit`, `Build` and `Platform`.

use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{KIT_TYPE_LABEL, OPERATOR_ID_ANNOTATION, PLATFORM_SELECTOR_ANNOTATION};

// ---- Kit ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Kit",
    namespaced,
    status = "KitStatus",
    shortname = "kit",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.image"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KitSpec {
    /// Image supplied out of band; required for external and synthetic kits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub traits: KitTraits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KitTraits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camel: Option<CamelTrait>,
}

/// Runtime selection for the kit. Cannot be disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CamelTrait {
    /// `quarkus` or `plain-quarkus`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_provider: Option<String>,
    /// Fixed (`3.2.3`) or wildcard (`3.x`) runtime version; overrides the platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported runtime provider {0:?} (expected quarkus or plain-quarkus)")]
    RuntimeProvider(String),
    #[error("invalid runtime version {0:?}")]
    RuntimeVersion(String),
    #[error("invalid property {0:?} (expected key=value)")]
    Property(String),
}

impl CamelTrait {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(p) = &self.runtime_provider {
            if p != "quarkus" && p != "plain-quarkus" {
                return Err(ValidationError::RuntimeProvider(p.clone()));
            }
        }
        if let Some(v) = &self.runtime_version {
            let ok = !v.is_empty()
                && v.split('.').all(|seg| seg == "x" || (!seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit())));
            if !ok {
                return Err(ValidationError::RuntimeVersion(v.clone()));
            }
        }
        if let Some(bad) = self.properties.iter().find(|p| !p.contains('=')) {
            return Err(ValidationError::Property(bad.clone()));
        }
        Ok(())
    }
}

/// Lifecycle of a kit, in forward order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum KitPhase {
    #[default]
    #[serde(rename = "")]
    None,
    WaitingForPlatform,
    Initialization,
    WaitingForCatalog,
    BuildSubmitted,
    BuildRunning,
    Ready,
    Error,
}

impl KitPhase {
    fn rank(self) -> u8 {
        match self {
            KitPhase::None => 0,
            KitPhase::WaitingForPlatform => 1,
            KitPhase::Initialization => 2,
            KitPhase::WaitingForCatalog => 3,
            KitPhase::BuildSubmitted => 4,
            KitPhase::BuildRunning => 5,
            KitPhase::Ready => 6,
            KitPhase::Error => 7,
        }
    }

    /// Phases a kit may be sent back to from anywhere.
    pub fn is_reset(self) -> bool {
        matches!(self, KitPhase::WaitingForPlatform | KitPhase::Error)
    }

    /// Forward moves and explicit resets are allowed; anything else is a regression.
    pub fn can_transition_to(self, next: KitPhase) -> bool {
        next == self || next.is_reset() || next.rank() > self.rank()
    }
}

impl fmt::Display for KitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KitPhase::None => "None",
            KitPhase::WaitingForPlatform => "WaitingForPlatform",
            KitPhase::Initialization => "Initialization",
            KitPhase::WaitingForCatalog => "WaitingForCatalog",
            KitPhase::BuildSubmitted => "BuildSubmitted",
            KitPhase::BuildRunning => "BuildRunning",
            KitPhase::Ready => "Ready",
            KitPhase::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KitStatus {
    #[serde(default)]
    pub phase: KitPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<crate::Condition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Name of the platform the kit is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KitType {
    Platform,
    External,
    Synthetic,
}

impl Kit {
    pub fn phase(&self) -> KitPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut KitStatus {
        self.status.get_or_insert_with(KitStatus::default)
    }

    pub fn generation(&self) -> Option<i64> {
        self.metadata.generation
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }

    pub fn kit_type(&self) -> KitType {
        match self.labels().get(KIT_TYPE_LABEL).map(String::as_str) {
            Some("external") => KitType::External,
            Some("synthetic") => KitType::Synthetic,
            _ => KitType::Platform,
        }
    }

    /// External and synthetic kits carry their image and never need a platform build.
    pub fn is_prebuilt(&self) -> bool {
        matches!(self.kit_type(), KitType::External | KitType::Synthetic)
    }

    pub fn platform_selector(&self) -> Option<&str> {
        self.annotations().get(PLATFORM_SELECTOR_ANNOTATION).map(String::as_str)
    }

    pub fn operator_id(&self) -> Option<&str> {
        self.annotations().get(OPERATOR_ID_ANNOTATION).map(String::as_str)
    }
}

// ---- Build ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Build",
    namespaced,
    status = "BuildStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// One pipeline step. Exactly one field is set; see [`TaskSpec::kind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jib: Option<JibTask>,
}

/// Typed view of a [`TaskSpec`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskKind<'a> {
    Jib(&'a JibTask),
}

impl TaskSpec {
    pub fn jib(task: JibTask) -> Self {
        Self { jib: Some(task) }
    }

    pub fn kind(&self) -> Option<TaskKind<'_>> {
        self.jib.as_ref().map(TaskKind::Jib)
    }

    pub fn name(&self) -> &str {
        match self.kind() {
            Some(TaskKind::Jib(t)) => &t.name,
            None => "",
        }
    }
}

/// Containerization task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JibTask {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<String>,
    pub image: String,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub registry: RegistrySpec,
    #[serde(default)]
    pub configuration: BuildConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    #[serde(default)]
    pub address: String,
    /// Secret holding registry credentials (dockerconfigjson).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfiguration {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_platforms: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum BuildPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub phase: BuildPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl BuildStatus {
    /// Mark failed, dropping any partial result.
    pub fn failed(mut self, err: impl fmt::Display) -> Self {
        self.phase = BuildPhase::Failed;
        self.error = Some(err.to_string());
        self.image = None;
        self.digest = None;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.phase == BuildPhase::Failed
    }
}

impl Build {
    pub fn phase(&self) -> BuildPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

// ---- Platform ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Platform",
    namespaced,
    status = "PlatformStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    #[serde(default)]
    pub build: PlatformBuildSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformBuildSpec {
    #[serde(default)]
    pub registry: RegistrySpec,
    #[serde(default)]
    pub base_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_platforms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PlatformPhase {
    #[default]
    #[serde(rename = "")]
    None,
    Creating,
    Ready,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    #[serde(default)]
    pub phase: PlatformPhase,
    /// Runtime versions for which a catalog has been resolved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catalogs: Vec<String>,
}

impl Platform {
    pub fn phase(&self) -> PlatformPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == PlatformPhase::Ready
    }
}

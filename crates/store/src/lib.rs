//! Kiln store: the seam between the reconciler and the resource API.
//!
//! Reads are plain; status writes are conditional on the resource version
//! the caller read, and a mismatch surfaces as [`StoreError::Conflict`]
//! rather than overwriting someone else's update.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kiln_core::{Build, BuildStatus, Kit, ObjectKey, Platform};

pub mod kube_store;
pub mod memory;
pub mod patch;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// The object changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("kube: {0}")]
    Kube(#[source] ::kube::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

impl From<::kube::Error> for StoreError {
    fn from(e: ::kube::Error) -> Self {
        match &e {
            ::kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message.clone()),
            ::kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(resp.message.clone())
            }
            ::kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message.clone()),
            ::kube::Error::Api(resp) if resp.code == 422 => StoreError::Invalid(resp.message.clone()),
            _ => StoreError::Kube(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_kit(&self, key: &ObjectKey) -> StoreResult<Option<Kit>>;

    async fn list_kits(&self, namespace: &str) -> StoreResult<Vec<Kit>>;

    /// Write `target.status` as a merge patch against `base`, conditional on
    /// `base`'s resource version. Returns the stored object.
    async fn patch_kit_status(&self, base: &Kit, target: &Kit) -> StoreResult<Kit>;

    async fn get_platform(&self, namespace: &str, name: &str) -> StoreResult<Option<Platform>>;

    async fn list_platforms(&self, namespace: &str) -> StoreResult<Vec<Platform>>;

    async fn get_build(&self, namespace: &str, name: &str) -> StoreResult<Option<Build>>;

    async fn create_build(&self, build: &Build) -> StoreResult<Build>;

    /// Delete a build; a build that is already gone is not an error.
    async fn delete_build(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Replace the build status, conditional on `base`'s resource version.
    async fn patch_build_status(&self, base: &Build, status: &BuildStatus) -> StoreResult<Build>;

    /// Decoded data of a secret, keyed by entry name.
    async fn get_secret_data(&self, namespace: &str, name: &str) -> StoreResult<BTreeMap<String, Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> ::kube::Error {
        ::kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "m".into(), reason: reason.into(), code })
    }

    #[test]
    fn api_errors_map_to_typed_variants() {
        assert!(StoreError::from(api_err(404, "NotFound")).is_not_found());
        assert!(StoreError::from(api_err(409, "Conflict")).is_conflict());
        assert!(matches!(StoreError::from(api_err(409, "AlreadyExists")), StoreError::AlreadyExists(_)));
        assert!(matches!(StoreError::from(api_err(422, "Invalid")), StoreError::Invalid(_)));
        assert!(matches!(StoreError::from(api_err(500, "InternalError")), StoreError::Kube(_)));
    }
}

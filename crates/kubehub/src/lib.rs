//! Kiln kubehub: watch wiring between the API server and the kit work queue.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

pub mod filter;
pub mod queue;
pub mod tracker;
pub mod watch;

pub use filter::Change;
pub use queue::WorkQueue;
pub use tracker::ChangeTracker;
pub use watch::{spawn_watchers, wake_waiting_kits, WatchConfig};

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

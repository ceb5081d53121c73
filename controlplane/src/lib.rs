/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use clusterfilter_utils::KubeFilterStore;
pub use config::Config;
pub use crd::{ClusterFilter, ClusterFilterSpec, FilterItem, Throttle};
pub use creator::{index_pod_by_creator, CreatorKey, PodId};
pub use desired_state::RateLimitPolicy;
pub use garbage_collector::stale_filters;
pub use health::Readiness;
pub use leader_election::{LeaderElectionConfig, LeaderElector};
pub use pod_index::CreatorIndex;
pub use queue::WorkQueue;
pub use ratelimit_controller::{
    controller as ratelimit_controller, process_queue, Outcome, RateLimitReconciler,
    ReconcileRequest,
};
pub use traits::FilterStore;

pub mod consts;
pub mod health;

mod clusterfilter_utils;
mod config;
mod crd;
mod creator;
mod desired_state;
mod garbage_collector;
mod leader_election;
mod pod_index;
mod queue;
mod ratelimit_controller;
mod traits;
mod utils;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Validated runtime settings
    pub config: Arc<Config>,
    pub policy: RateLimitPolicy,
    pub readiness: Readiness,
    /// Fired on shutdown signal or leadership loss
    pub shutdown: CancellationToken,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("error querying ClusterFilter CRD: `{0}`; is fluent-operator installed?")]
    CRDNotFoundError(#[source] kube::Error),
    #[error("unable to index pods by creator: `{0}`")]
    IndexRegistrationError(#[source] kube::Error),
    #[error("conflicting write to `{0}`")]
    Conflict(String),
    #[error("pod index has not completed its initial sync")]
    IndexNotSynced,
    #[error("cluster API call exceeded {0:?}")]
    Timeout(Duration),
    #[error("reconcile cancelled")]
    Cancelled,
    #[error("leader election error: `{0}`")]
    LeaderElectionError(String),
}

impl Error {
    /// Whether the failed request should go back on the queue with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Cancelled | Error::InvalidConfigError(_) | Error::CRDNotFoundError(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

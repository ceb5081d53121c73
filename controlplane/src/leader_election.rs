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

//! Lease based leader election.
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease runs watchers and
//! workers. Every write to the Lease is a conditional replace on its
//! resourceVersion, so two candidates racing for an expired Lease cannot both win.
//!
//! Expiry of another candidate's Lease is measured on the local monotonic clock
//! from the moment its record was last seen to change. The timestamps written by
//! the holder are never compared against this node's wall clock.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consts::FIELD_MANAGER;
use crate::utils::check_if_conflict_err;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    /// Identity written into `holderIdentity`.
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn default_identity() -> String {
        let host = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "rate-limiter-controller".to_string());
        format!("{host}_{}", std::process::id())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::InvalidConfigError(
                "lease duration must be greater than the renew deadline".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::InvalidConfigError(
                "renew deadline must be greater than the retry period".to_string(),
            ));
        }
        Ok(())
    }
}

/// The fields of a Lease that change whenever its holder renews or hands over.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_duration_seconds: Option<i32>,
    pub lease_transitions: Option<i32>,
}

impl LeaseRecord {
    pub fn of(spec: Option<&LeaseSpec>) -> Self {
        let Some(spec) = spec else {
            return Self::default();
        };
        Self {
            holder: spec.holder_identity.clone(),
            acquire_time: spec.acquire_time.as_ref().map(|t| t.0),
            renew_time: spec.renew_time.as_ref().map(|t| t.0),
            lease_duration_seconds: spec.lease_duration_seconds,
            lease_transitions: spec.lease_transitions,
        }
    }
}

/// A [`LeaseRecord`] together with the local instant it was first seen in that form.
#[derive(Clone, Debug)]
pub struct Observation {
    pub record: LeaseRecord,
    pub seen_at: Instant,
}

impl Observation {
    /// Keeps the earlier instant while the record is unchanged.
    pub fn update(previous: Option<Observation>, record: LeaseRecord, now: Instant) -> Self {
        match previous {
            Some(previous) if previous.record == record => previous,
            _ => Self {
                record,
                seen_at: now,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    /// The Lease is free or expired and may be taken over.
    Acquire,
    /// We already hold the Lease.
    Renew,
    /// Someone else holds a valid Lease.
    Wait { holder: String },
}

pub fn decide(
    observed: &Observation,
    identity: &str,
    now: Instant,
    default_duration: Duration,
) -> LeaseDecision {
    let holder = match observed.record.holder.as_deref() {
        None | Some("") => return LeaseDecision::Acquire,
        Some(holder) => holder,
    };
    if holder == identity {
        return LeaseDecision::Renew;
    }

    let duration = observed
        .record
        .lease_duration_seconds
        .and_then(|s| u64::try_from(s).ok())
        .map(Duration::from_secs)
        .unwrap_or(default_duration);
    if now.saturating_duration_since(observed.seen_at) < duration {
        LeaseDecision::Wait {
            holder: holder.to_string(),
        }
    } else {
        LeaseDecision::Acquire
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderElectionConfig,
    observed: Mutex<Option<Observation>>,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
            observed: Mutex::new(None),
        }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }

    fn map_write_err(&self, error: kube::Error) -> Error {
        if check_if_conflict_err(&error) {
            Error::Conflict(self.config.lease_name.clone())
        } else {
            Error::KubeError(error)
        }
    }

    fn observe(&self, spec: Option<&LeaseSpec>, now: Instant) -> Observation {
        let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        let next = Observation::update(observed.take(), LeaseRecord::of(spec), now);
        *observed = Some(next.clone());
        next
    }

    fn renew_deadline_exceeded(&self) -> Error {
        Error::LeaderElectionError(format!(
            "failed to renew lease {} within {:?}",
            self.config.lease_name, self.config.renew_deadline
        ))
    }

    /// One election round. `Ok(true)` when we hold the Lease afterwards,
    /// `Ok(false)` when another candidate holds a valid Lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let timestamp = Utc::now();
        let existing = self
            .api
            .get_opt(&self.config.lease_name)
            .await
            .map_err(Error::KubeError)?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.lease_name.clone()),
                    namespace: Some(self.config.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: Some(self.lease_duration_seconds()),
                    acquire_time: Some(MicroTime(timestamp)),
                    renew_time: Some(MicroTime(timestamp)),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            let created = self
                .api
                .create(&Self::post_params(), &lease)
                .await
                .map_err(|e| self.map_write_err(e))?;
            self.observe(created.spec.as_ref(), Instant::now());
            info!("acquired lease {}", self.config.lease_name);
            return Ok(true);
        };

        let now = Instant::now();
        let observed = self.observe(lease.spec.as_ref(), now);
        let decision = decide(&observed, &self.config.identity, now, self.config.lease_duration);
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        match &decision {
            LeaseDecision::Wait { holder } => {
                debug!(
                    holder = %holder,
                    "lease {} is held by another candidate", self.config.lease_name
                );
                return Ok(false);
            }
            LeaseDecision::Renew => {
                spec.renew_time = Some(MicroTime(timestamp));
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
            }
            LeaseDecision::Acquire => {
                spec.holder_identity = Some(self.config.identity.clone());
                spec.acquire_time = Some(MicroTime(timestamp));
                spec.renew_time = Some(MicroTime(timestamp));
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
            }
        }
        let written = self
            .api
            .replace(&self.config.lease_name, &Self::post_params(), &lease)
            .await
            .map_err(|e| self.map_write_err(e))?;
        self.observe(written.spec.as_ref(), Instant::now());
        if decision == LeaseDecision::Acquire {
            info!("acquired lease {}", self.config.lease_name);
        }
        Ok(true)
    }

    /// Blocks until the Lease is acquired. Standbys stay in here.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<()> {
        info!(
            identity = %self.config.identity,
            "waiting for leadership of {}/{}", self.config.namespace, self.config.lease_name
        );
        loop {
            let round =
                tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew());
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
                attempt = round => attempt,
            };
            match attempt {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {}
                Ok(Err(error)) => warn!("failed to acquire lease: {}", error),
                Err(_) => warn!(
                    "acquiring lease {} timed out after {:?}",
                    self.config.lease_name, self.config.renew_deadline
                ),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keeps renewing the Lease. Returns `Ok` on shutdown and an error once
    /// leadership is lost.
    ///
    /// Each renewal is bounded by what is left of the renew deadline, so a stalled
    /// API server ends leadership before the Lease can expire under another holder.
    pub async fn hold(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut last_renew = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.release_on_shutdown().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renew.elapsed());
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.release_on_shutdown().await;
                    return Ok(());
                }
                attempt = tokio::time::timeout(remaining, self.try_acquire_or_renew()) => attempt,
            };
            match attempt {
                Ok(Ok(true)) => last_renew = Instant::now(),
                Ok(Ok(false)) => {
                    return Err(Error::LeaderElectionError(format!(
                        "lease {} taken over by another candidate",
                        self.config.lease_name
                    )));
                }
                Ok(Err(error)) => {
                    warn!("failed to renew lease: {}", error);
                    if last_renew.elapsed() >= self.config.renew_deadline {
                        return Err(self.renew_deadline_exceeded());
                    }
                }
                Err(_) => return Err(self.renew_deadline_exceeded()),
            }
        }
    }

    async fn release_on_shutdown(&self) {
        if tokio::time::timeout(self.config.renew_deadline, self.release())
            .await
            .is_err()
        {
            warn!("timed out releasing lease {}", self.config.lease_name);
        }
    }

    // Clears the holder so a standby can take over without waiting for expiry.
    async fn release(&self) {
        let mut lease = match self.api.get_opt(&self.config.lease_name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(error) => {
                warn!("failed to read lease on release: {}", error);
                return;
            }
        };
        let Some(spec) = lease.spec.as_mut() else {
            return;
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return;
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        if let Err(error) = self
            .api
            .replace(&self.config.lease_name, &Self::post_params(), &lease)
            .await
        {
            warn!("failed to release lease: {}", error);
        } else {
            info!("released lease {}", self.config.lease_name);
        }
    }
}

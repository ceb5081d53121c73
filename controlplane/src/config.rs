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

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::consts::{
    DEFAULT_CREATOR_LABEL, DEFAULT_LEADER_ELECTION_ID, DEFAULT_LEADER_ELECTION_NAMESPACE,
};
use crate::desired_state::RateLimitPolicy;
use crate::leader_election::LeaderElectionConfig;
use crate::{Error, Result};

fn parse_seconds(value: &str) -> std::result::Result<Duration, String> {
    let trimmed = value.strip_suffix('s').unwrap_or(value);
    trimmed
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid duration `{value}`: {e}"))
}

#[derive(Debug, Parser, Clone)]
#[command(name = "controller", about = "Maintains a rate-limiting ClusterFilter per pod creator")]
pub struct Config {
    /// Enable leader election for controller manager.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "ENABLE_LEADER_ELECTION"
    )]
    pub enable_leader_election: bool,

    /// Lease duration for leader election, in seconds.
    #[arg(long, default_value = "15s", value_parser = parse_seconds)]
    pub lease_duration: Duration,

    /// Renew deadline for leader election, in seconds.
    #[arg(long, default_value = "10s", value_parser = parse_seconds)]
    pub renew_deadline: Duration,

    /// Retry period for leader election, in seconds.
    #[arg(long, default_value = "2s", value_parser = parse_seconds)]
    pub retry_period: Duration,

    #[arg(long, default_value = DEFAULT_LEADER_ELECTION_ID)]
    pub leader_election_id: String,

    #[arg(
        long,
        default_value = DEFAULT_LEADER_ELECTION_NAMESPACE,
        env = "LEADER_ELECTION_NAMESPACE"
    )]
    pub leader_election_namespace: String,

    #[arg(long, default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Pod label holding the creator key.
    #[arg(long, default_value = DEFAULT_CREATOR_LABEL)]
    pub creator_label: String,

    /// Number of concurrent reconcile workers.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Interval between garbage-collection sweeps, in seconds.
    #[arg(long, default_value = "60s", value_parser = parse_seconds)]
    pub sweep_interval: Duration,

    /// Upper bound on any single cluster API call, in seconds.
    #[arg(long, default_value = "10s", value_parser = parse_seconds)]
    pub request_timeout: Duration,

    /// Fluent-bit tag prefix; filters match `<prefix>.<creator>.*`.
    #[arg(long, default_value = "creator")]
    pub match_tag_prefix: String,

    /// Throttle rate granted per live pod.
    #[arg(long, default_value_t = 100)]
    pub rate_per_pod: u32,

    /// Upper bound on the throttle rate of a single creator.
    #[arg(long, default_value_t = 10_000)]
    pub max_rate: u32,

    /// Throttle window, in intervals.
    #[arg(long, default_value_t = 5)]
    pub throttle_window: u32,

    #[arg(long, default_value = "1s")]
    pub throttle_interval: String,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub throttle_print_status: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfigError(
                "at least one worker is required".to_string(),
            ));
        }
        if self.creator_label.is_empty() {
            return Err(Error::InvalidConfigError(
                "creator label must not be empty".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() || self.request_timeout.is_zero() {
            return Err(Error::InvalidConfigError(
                "sweep interval and request timeout must be positive".to_string(),
            ));
        }
        self.leader_election().validate()?;
        Ok(())
    }

    pub fn policy(&self) -> Result<RateLimitPolicy> {
        RateLimitPolicy {
            tag_prefix: self.match_tag_prefix.clone(),
            rate_per_pod: self.rate_per_pod,
            max_rate: self.max_rate,
            window: self.throttle_window,
            interval: self.throttle_interval.clone(),
            print_status: self.throttle_print_status,
        }
        .validate()
    }

    pub fn leader_election(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_name: self.leader_election_id.clone(),
            namespace: self.leader_election_namespace.clone(),
            identity: LeaderElectionConfig::default_identity(),
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
        }
    }
}

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

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use crate::consts::{
    CREATOR_MARKER_LABEL, FLUENTBIT_ENABLED_LABEL, LIVE_PODS_ANNOTATION, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE,
};
use crate::crd::{ClusterFilter, ClusterFilterSpec, FilterItem, Throttle};
use crate::creator::CreatorKey;
use crate::{Error, Result};

/// Parameters of the throttle filter derived for every creator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub tag_prefix: String,
    pub rate_per_pod: u32,
    pub max_rate: u32,
    pub window: u32,
    pub interval: String,
    pub print_status: bool,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            tag_prefix: "creator".to_string(),
            rate_per_pod: 100,
            max_rate: 10_000,
            window: 5,
            interval: "1s".to_string(),
            print_status: true,
        }
    }
}

impl RateLimitPolicy {
    pub fn validate(self) -> Result<Self> {
        if self.rate_per_pod == 0 {
            return Err(Error::InvalidConfigError(
                "rate per pod must be positive".to_string(),
            ));
        }
        if self.max_rate < self.rate_per_pod {
            return Err(Error::InvalidConfigError(format!(
                "max rate {} is below the per-pod rate {}",
                self.max_rate, self.rate_per_pod
            )));
        }
        if self.window == 0 {
            return Err(Error::InvalidConfigError(
                "throttle window must be positive".to_string(),
            ));
        }
        if self.interval.trim().is_empty() {
            return Err(Error::InvalidConfigError(
                "throttle interval must not be empty".to_string(),
            ));
        }
        if self.tag_prefix.is_empty() {
            return Err(Error::InvalidConfigError(
                "tag prefix must not be empty".to_string(),
            ));
        }
        Ok(self)
    }

    /// Desired spec for a creator with `live_pods` pods, or `None` when no filter
    /// should exist.
    pub fn desired_spec(&self, key: &CreatorKey, live_pods: usize) -> Option<ClusterFilterSpec> {
        if live_pods == 0 {
            return None;
        }
        let pods = u64::try_from(live_pods).unwrap_or(u64::MAX);
        let rate = u64::from(self.rate_per_pod)
            .saturating_mul(pods)
            .min(u64::from(self.max_rate));

        Some(ClusterFilterSpec {
            match_: Some(format!("{}.{}.*", self.tag_prefix, key)),
            match_regex: None,
            log_level: None,
            filters: vec![FilterItem {
                throttle: Some(Throttle {
                    rate: Some(rate as i64),
                    window: Some(i64::from(self.window)),
                    interval: Some(self.interval.clone()),
                    print_status: Some(self.print_status),
                }),
            }],
        })
    }

    /// Full desired object, including the ownership marker.
    pub fn desired_filter(&self, key: &CreatorKey, live_pods: usize) -> Option<ClusterFilter> {
        let spec = self.desired_spec(key, live_pods)?;
        Some(ClusterFilter {
            metadata: ObjectMeta {
                name: Some(key.filter_name()),
                labels: Some(desired_labels(key)),
                annotations: Some(desired_annotations(live_pods)),
                ..Default::default()
            },
            spec,
        })
    }
}

pub fn desired_labels(key: &CreatorKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CREATOR_MARKER_LABEL.to_string(), key.to_string()),
        (FLUENTBIT_ENABLED_LABEL.to_string(), "true".to_string()),
    ])
}

pub fn desired_annotations(live_pods: usize) -> BTreeMap<String, String> {
    BTreeMap::from([(LIVE_PODS_ANNOTATION.to_string(), live_pods.to_string())])
}

// Returns true if `actual` already carries everything `desired` sets. Labels and
// annotations added by other actors are left alone and do not count as drift.
pub fn is_converged(actual: &ClusterFilter, desired: &ClusterFilter) -> bool {
    fn contains(
        actual: &Option<BTreeMap<String, String>>,
        desired: &Option<BTreeMap<String, String>>,
    ) -> bool {
        let Some(desired) = desired else {
            return true;
        };
        let Some(actual) = actual else {
            return desired.is_empty();
        };
        desired.iter().all(|(k, v)| actual.get(k) == Some(v))
    }

    actual.spec == desired.spec
        && contains(&actual.metadata.labels, &desired.metadata.labels)
        && contains(&actual.metadata.annotations, &desired.metadata.annotations)
}

// Applies the desired fields onto `actual` in place, keeping its resourceVersion
// and any foreign metadata so the replace is conditional.
pub fn merge_desired(actual: &ClusterFilter, desired: &ClusterFilter) -> ClusterFilter {
    let mut merged = actual.clone();
    merged.spec = desired.spec.clone();
    for (target, source) in [
        (&mut merged.metadata.labels, &desired.metadata.labels),
        (&mut merged.metadata.annotations, &desired.metadata.annotations),
    ] {
        if let Some(source) = source {
            target
                .get_or_insert_with(BTreeMap::new)
                .extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CreatorKey {
        CreatorKey::parse(s).unwrap()
    }

    fn throttle(spec: &ClusterFilterSpec) -> &Throttle {
        spec.filters[0].throttle.as_ref().unwrap()
    }

    #[test]
    fn no_filter_without_live_pods() {
        let policy = RateLimitPolicy::default();
        assert!(policy.desired_spec(&key("alpha"), 0).is_none());
        assert!(policy.desired_filter(&key("alpha"), 0).is_none());
    }

    #[test]
    fn rate_scales_with_pods_and_is_capped() {
        let policy = RateLimitPolicy {
            rate_per_pod: 100,
            max_rate: 250,
            ..Default::default()
        };
        let one = policy.desired_spec(&key("alpha"), 1).unwrap();
        assert_eq!(throttle(&one).rate, Some(100));
        let two = policy.desired_spec(&key("alpha"), 2).unwrap();
        assert_eq!(throttle(&two).rate, Some(200));
        let many = policy.desired_spec(&key("alpha"), 1_000_000).unwrap();
        assert_eq!(throttle(&many).rate, Some(250));
    }

    #[test]
    fn output_is_deterministic() {
        let policy = RateLimitPolicy::default();
        let a = policy.desired_filter(&key("alpha"), 3).unwrap();
        let b = policy.desired_filter(&key("alpha"), 3).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
        assert_eq!(a.spec.match_.as_deref(), Some("creator.alpha.*"));
    }

    #[test]
    fn desired_filter_carries_marker() {
        let filter = RateLimitPolicy::default()
            .desired_filter(&key("beta"), 1)
            .unwrap();
        assert_eq!(filter.metadata.name, Some(key("beta").filter_name()));
        assert_eq!(crate::creator::owner_of(&filter), Some(key("beta")));
    }

    #[test]
    fn validate_rejects_inconsistent_policies() {
        assert!(RateLimitPolicy::default().validate().is_ok());
        for policy in [
            RateLimitPolicy {
                rate_per_pod: 0,
                ..Default::default()
            },
            RateLimitPolicy {
                max_rate: 10,
                ..Default::default()
            },
            RateLimitPolicy {
                window: 0,
                ..Default::default()
            },
            RateLimitPolicy {
                interval: " ".to_string(),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                policy.validate(),
                Err(Error::InvalidConfigError(_))
            ));
        }
    }

    #[test]
    fn foreign_metadata_is_not_drift() {
        let policy = RateLimitPolicy::default();
        let desired = policy.desired_filter(&key("alpha"), 2).unwrap();
        let mut actual = desired.clone();
        actual
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("team".to_string(), "infra".to_string());
        actual.metadata.resource_version = Some("7".to_string());
        assert!(is_converged(&actual, &desired));

        let changed = policy.desired_filter(&key("alpha"), 3).unwrap();
        assert!(!is_converged(&actual, &changed));

        let merged = merge_desired(&actual, &changed);
        assert!(is_converged(&merged, &changed));
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(
            merged.metadata.labels.as_ref().unwrap().get("team"),
            Some(&"infra".to_string())
        );
    }
}

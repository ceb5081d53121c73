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

// Pod label identifying the workload owner that a filter is derived for.
pub const DEFAULT_CREATOR_LABEL: &str = "kubebrain.brainpp.cn/creator";

// Ownership marker stamped on every managed ClusterFilter, holding its CreatorKey.
pub const CREATOR_MARKER_LABEL: &str = "ratelimit.kubebrain.brainpp.cn/creator";

// Annotation recording the live pod count the filter was computed from.
pub const LIVE_PODS_ANNOTATION: &str = "ratelimit.kubebrain.brainpp.cn/live-pods";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

// Value of the managed-by label for filters owned by this controller.
pub const MANAGED_BY_VALUE: &str = "rate-limiter-controller";

// Label selected by fluent-operator's ClusterFluentBitConfig filterSelector.
pub const FLUENTBIT_ENABLED_LABEL: &str = "fluentbit.fluent.io/enabled";

// Prefix of every managed ClusterFilter name.
pub const FILTER_NAME_PREFIX: &str = "ratelimit";

// Field manager for writes made by this controller.
pub const FIELD_MANAGER: &str = "rate-limiter-controller";

pub const DEFAULT_LEADER_ELECTION_ID: &str = "rate-limiter-controller-leader-election";

pub const DEFAULT_LEADER_ELECTION_NAMESPACE: &str = "default";

pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

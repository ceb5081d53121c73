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

use std::fmt;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::consts::{CREATOR_MARKER_LABEL, FILTER_NAME_PREFIX, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crd::ClusterFilter;

// Kubernetes label value syntax.
static LABEL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("static regex is valid")
});

const MAX_LABEL_VALUE_LEN: usize = 63;

/// A logical workload owner, taken from a Pod's creator label.
///
/// Always a valid label value, so it can be written back verbatim as the
/// ownership marker on the filters derived from it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CreatorKey(String);

impl CreatorKey {
    /// Returns `None` for empty or malformed label values.
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() || value.len() > MAX_LABEL_VALUE_LEN || !LABEL_VALUE.is_match(value) {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic ClusterFilter name for this key.
    ///
    /// The hash suffix keeps keys that only differ by case or punctuation apart
    /// after they are folded into a DNS-1123 name.
    pub fn filter_name(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|c| match c {
                '_' | '.' => '-',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        let digest = Sha256::digest(self.0.as_bytes());
        let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
        format!("{FILTER_NAME_PREFIX}-{sanitized}-{suffix}")
    }
}

impl fmt::Display for CreatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl PodId {
    pub fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// Index function over the creator label. Yields at most one key and never fails:
// pods with a missing or malformed label are simply not indexed.
pub fn index_pod_by_creator(pod: &Pod, label: &str) -> Vec<CreatorKey> {
    let Some(value) = pod.labels().get(label) else {
        return vec![];
    };
    match CreatorKey::parse(value) {
        Some(key) => vec![key],
        None => {
            debug!(pod = %PodId::of(pod), value, "ignoring pod with malformed creator label");
            vec![]
        }
    }
}

// A pod counts towards its creator until it starts terminating or completes.
pub fn is_live(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

// Reads the ownership marker off a ClusterFilter. Filters without the managed-by
// label or with an unparseable marker are not ours.
pub fn owner_of(filter: &ClusterFilter) -> Option<CreatorKey> {
    let labels = filter.labels();
    if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGED_BY_VALUE) {
        return None;
    }
    labels
        .get(CREATOR_MARKER_LABEL)
        .and_then(|value| CreatorKey::parse(value))
}

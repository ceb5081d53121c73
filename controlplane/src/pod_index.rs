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

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;

use crate::creator::{index_pod_by_creator, is_live, CreatorKey, PodId};

#[derive(Default)]
struct IndexState {
    by_creator: HashMap<CreatorKey, BTreeSet<PodId>>,
    by_pod: HashMap<PodId, CreatorKey>,
    // filter name -> key, for every live key
    by_filter_name: HashMap<String, CreatorKey>,
}

impl IndexState {
    fn insert(&mut self, id: PodId, key: CreatorKey) {
        self.by_filter_name
            .entry(key.filter_name())
            .or_insert_with(|| key.clone());
        self.by_creator.entry(key.clone()).or_default().insert(id.clone());
        self.by_pod.insert(id, key);
    }

    fn remove(&mut self, id: &PodId) -> Option<CreatorKey> {
        let key = self.by_pod.remove(id)?;
        if let Some(pods) = self.by_creator.get_mut(&key) {
            pods.remove(id);
            if pods.is_empty() {
                self.by_creator.remove(&key);
                self.by_filter_name.remove(&key.filter_name());
            }
        }
        Some(key)
    }
}

/// Live pods grouped by creator key, maintained from a pod watch.
///
/// Cloning shares the underlying index.
#[derive(Clone)]
pub struct CreatorIndex {
    label: Arc<str>,
    state: Arc<RwLock<IndexState>>,
    synced: Arc<AtomicBool>,
}

impl CreatorIndex {
    pub fn new(label: &str) -> Self {
        Self {
            label: Arc::from(label),
            state: Arc::default(),
            synced: Arc::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the initial list of the watch has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Applies one watch event and returns every key whose pod set may have changed,
    /// including the previous key of a relabelled pod.
    pub fn apply(&self, event: &watcher::Event<Pod>) -> BTreeSet<CreatorKey> {
        let mut touched = BTreeSet::new();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            watcher::Event::Applied(pod) => {
                let id = PodId::of(pod);
                touched.extend(state.remove(&id));
                if let Some(key) = self.live_key(pod) {
                    touched.insert(key.clone());
                    state.insert(id, key);
                }
            }
            watcher::Event::Deleted(pod) => {
                touched.extend(state.remove(&PodId::of(pod)));
            }
            watcher::Event::Restarted(pods) => {
                touched.extend(state.by_creator.keys().cloned());
                *state = IndexState::default();
                for pod in pods {
                    if let Some(key) = self.live_key(pod) {
                        touched.insert(key.clone());
                        state.insert(PodId::of(pod), key);
                    }
                }
                self.synced.store(true, Ordering::Release);
            }
        }
        touched
    }

    fn live_key(&self, pod: &Pod) -> Option<CreatorKey> {
        if !is_live(pod) {
            return None;
        }
        index_pod_by_creator(pod, &self.label).into_iter().next()
    }

    pub fn list_live_pods(&self, key: &CreatorKey) -> BTreeSet<PodId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_creator.get(key).cloned().unwrap_or_default()
    }

    pub fn live_count(&self, key: &CreatorKey) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_creator.get(key).map_or(0, BTreeSet::len)
    }

    pub fn is_live(&self, key: &CreatorKey) -> bool {
        self.live_count(key) > 0
    }

    pub fn live_keys(&self) -> BTreeSet<CreatorKey> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_creator.keys().cloned().collect()
    }

    // Reverse lookup from a deterministic filter name to a live key.
    pub fn creator_for_filter(&self, name: &str) -> Option<CreatorKey> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_filter_name.get(name).cloned()
    }
}

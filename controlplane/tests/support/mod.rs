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

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use controlplane::consts::{DEFAULT_CREATOR_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use controlplane::{ClusterFilter, CreatorIndex, Error, FilterStore, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::runtime::watcher;
use kube::ResourceExt;

/// In-memory stand-in for the ClusterFilter API with resourceVersion checks.
#[derive(Default)]
pub struct MemoryFilterStore {
    objects: Mutex<BTreeMap<String, ClusterFilter>>,
    next_version: AtomicUsize,
    writes: AtomicUsize,
    // Number of upcoming writes that fail with a conflict.
    conflicts: AtomicUsize,
}

impl MemoryFilterStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_next_writes_with_conflict(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, name: &str) -> Option<ClusterFilter> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    /// Writes an object directly, as another actor would.
    pub fn insert(&self, mut filter: ClusterFilter) -> ClusterFilter {
        filter.metadata.resource_version = Some(self.bump());
        self.objects
            .lock()
            .unwrap()
            .insert(filter.name_any(), filter.clone());
        filter
    }

    pub fn remove(&self, name: &str) {
        self.objects.lock().unwrap().remove(name);
    }

    fn bump(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_conflict(&self, name: &str) -> Result<()> {
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Conflict(name.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FilterStore for MemoryFilterStore {
    async fn get(&self, name: &str) -> Result<Option<ClusterFilter>> {
        Ok(self.object(name))
    }

    async fn create(&self, filter: &ClusterFilter) -> Result<ClusterFilter> {
        let name = filter.name_any();
        self.take_conflict(&name)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&name) {
            return Err(Error::Conflict(name));
        }
        let mut created = filter.clone();
        let version = self.bump();
        created.metadata.uid = Some(format!("uid-{version}"));
        created.metadata.resource_version = Some(version);
        objects.insert(name, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, filter: &ClusterFilter) -> Result<ClusterFilter> {
        let name = filter.name_any();
        self.take_conflict(&name)?;
        let mut objects = self.objects.lock().unwrap();
        let current = objects.get(&name).ok_or_else(|| Error::Conflict(name.clone()))?;
        if current.metadata.resource_version != filter.metadata.resource_version {
            return Err(Error::Conflict(name));
        }
        let mut replaced = filter.clone();
        replaced.metadata.resource_version = Some(self.bump());
        objects.insert(name, replaced.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete(&self, filter: &ClusterFilter) -> Result<()> {
        let name = filter.name_any();
        self.take_conflict(&name)?;
        let mut objects = self.objects.lock().unwrap();
        match objects.get(&name) {
            None => Ok(()),
            Some(current)
                if current.metadata.resource_version != filter.metadata.resource_version =>
            {
                Err(Error::Conflict(name))
            }
            Some(_) => {
                objects.remove(&name);
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn list_managed(&self) -> Result<Vec<ClusterFilter>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|f| {
                f.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
            })
            .cloned()
            .collect())
    }
}

pub fn pod(name: &str, creator: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some([(DEFAULT_CREATOR_LABEL.to_string(), creator.to_string())].into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn synced_index(pods: Vec<Pod>) -> CreatorIndex {
    let index = CreatorIndex::new(DEFAULT_CREATOR_LABEL);
    index.apply(&watcher::Event::Restarted(pods));
    index
}

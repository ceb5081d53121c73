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

use kube::ResourceExt;

use crate::creator::owner_of;
use crate::pod_index::CreatorIndex;
use crate::ratelimit_controller::ReconcileRequest;
use crate::traits::FilterStore;
use crate::{Error, Result};

// Lists every filter bearing our ownership marker and returns a request for each
// one that should no longer exist: its creator has no live pods, or it is not the
// deterministic filter of its creator. Covers filters left behind by missed pod
// deletions, by a crash between the last pod going away and the delete, and
// filters adopted from a previous controller instance.
//
// The requests go through the regular reconcile path, which re-checks liveness
// before deleting anything.
pub async fn stale_filters<S: FilterStore + ?Sized>(
    store: &S,
    index: &CreatorIndex,
) -> Result<Vec<ReconcileRequest>> {
    if !index.is_synced() {
        return Err(Error::IndexNotSynced);
    }
    let filters = store.list_managed().await?;
    Ok(filters
        .iter()
        .filter(|filter| match owner_of(filter) {
            Some(key) => !index.is_live(&key) || key.filter_name() != filter.name_any(),
            None => false,
        })
        .map(ReconcileRequest::for_filter)
        .collect())
}

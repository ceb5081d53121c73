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

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions},
    Client, ResourceExt,
};
use tracing::debug;

use crate::consts::{managed_selector, FIELD_MANAGER};
use crate::crd::ClusterFilter;
use crate::traits::FilterStore;
use crate::utils::{check_if_conflict_err, check_if_not_found_err};
use crate::{Error, Result};

/// [`FilterStore`] backed by the cluster API.
#[derive(Clone)]
pub struct KubeFilterStore {
    api: Api<ClusterFilter>,
}

impl KubeFilterStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

fn write_error(name: &str, error: kube::Error) -> Error {
    if check_if_conflict_err(&error) {
        Error::Conflict(name.to_string())
    } else {
        Error::KubeError(error)
    }
}

#[async_trait]
impl FilterStore for KubeFilterStore {
    async fn get(&self, name: &str) -> Result<Option<ClusterFilter>> {
        self.api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn create(&self, filter: &ClusterFilter) -> Result<ClusterFilter> {
        let name = filter.name_any();
        self.api
            .create(&Self::post_params(), filter)
            .await
            .map_err(|e| write_error(&name, e))
    }

    // A replace carrying metadata.resourceVersion is rejected with 409 if the
    // object changed since it was read.
    async fn replace(&self, filter: &ClusterFilter) -> Result<ClusterFilter> {
        let name = filter.name_any();
        if filter.resource_version().is_none() {
            return Err(Error::InvalidConfigError(format!(
                "refusing unconditional replace of {name}"
            )));
        }
        self.api
            .replace(&name, &Self::post_params(), filter)
            .await
            .map_err(|e| write_error(&name, e))
    }

    async fn delete(&self, filter: &ClusterFilter) -> Result<()> {
        let name = filter.name_any();
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: filter.resource_version(),
                uid: filter.uid(),
            }),
            ..DeleteParams::default()
        };
        match self.api.delete(&name, &params).await {
            Ok(_) => Ok(()),
            Err(error) if check_if_not_found_err(&error) => {
                debug!("ClusterFilter {} already deleted", name);
                Ok(())
            }
            Err(error) => Err(write_error(&name, error)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ClusterFilter>> {
        let filters = self
            .api
            .list(&ListParams::default().labels(&managed_selector()))
            .await
            .map_err(Error::KubeError)?;
        Ok(filters.items)
    }
}

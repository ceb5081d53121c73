use async_trait::async_trait;

use crate::crd::ClusterFilter;
use crate::Result;

/// Read-write access to ClusterFilter objects.
///
/// Writes are conditional: `replace` and `delete` must fail with
/// [`crate::Error::Conflict`] when the stored resourceVersion no longer matches the
/// one on the object that was read, and `create` must fail with it when an object
/// of the same name already exists.
#[async_trait]
pub trait FilterStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ClusterFilter>>;

    async fn create(&self, filter: &ClusterFilter) -> Result<ClusterFilter>;

    async fn replace(&self, filter: &ClusterFilter) -> Result<ClusterFilter>;

    /// Deleting an object that is already gone succeeds.
    async fn delete(&self, filter: &ClusterFilter) -> Result<()>;

    /// Every filter carrying the managed-by label of this controller.
    async fn list_managed(&self) -> Result<Vec<ClusterFilter>>;
}

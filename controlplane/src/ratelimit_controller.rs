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

use std::{
    future::Future,
    ops::Sub,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    clusterfilter_utils::KubeFilterStore,
    consts::managed_selector,
    creator::{owner_of, CreatorKey},
    crd::ClusterFilter,
    desired_state::{is_converged, merge_desired, RateLimitPolicy},
    garbage_collector::stale_filters,
    health::Readiness,
    pod_index::CreatorIndex,
    queue::WorkQueue,
    traits::FilterStore,
    Context, Error, Result,
};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of one unit of work: the name of the ClusterFilter whose creator
/// needs re-evaluation. Pod events are projected onto it through the creator
/// label, so all work for one creator shares a single queue slot.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReconcileRequest {
    pub name: String,
}

impl ReconcileRequest {
    pub fn for_creator(key: &CreatorKey) -> Self {
        Self {
            name: key.filter_name(),
        }
    }

    pub fn for_filter(filter: &ClusterFilter) -> Self {
        Self {
            name: filter.name_any(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
    /// A filter holds the name but not our ownership marker; left untouched.
    Foreign,
}

impl Outcome {
    pub fn is_write(self) -> bool {
        matches!(self, Outcome::Created | Outcome::Updated | Outcome::Deleted)
    }
}

pub struct RateLimitReconciler<S> {
    store: S,
    index: CreatorIndex,
    policy: RateLimitPolicy,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl<S: FilterStore> RateLimitReconciler<S> {
    pub fn new(store: S, index: CreatorIndex, policy: RateLimitPolicy) -> Self {
        Self {
            store,
            index,
            policy,
            shutdown: CancellationToken::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_cancellation(
        mut self,
        shutdown: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        self.shutdown = shutdown;
        self.request_timeout = request_timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn index(&self) -> &CreatorIndex {
        &self.index
    }

    // Every cluster API call races shutdown and the per-call timeout.
    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.request_timeout, fut) => match res {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout(self.request_timeout)),
            },
        }
    }

    /// Converges the filter named by `request` towards the state derived from
    /// the pod index. Safe to run any number of times for the same request.
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<Outcome> {
        let start = Instant::now();
        if !self.index.is_synced() {
            return Err(Error::IndexNotSynced);
        }

        let actual = self.call(self.store.get(&request.name)).await?;
        let owner = actual.as_ref().and_then(owner_of);

        let key = match (self.index.creator_for_filter(&request.name), &owner) {
            (Some(key), _) => key,
            (None, Some(owner)) => owner.clone(),
            (None, None) => {
                if actual.is_some() {
                    warn!(
                        "ClusterFilter {} is not managed by this controller; leaving it alone",
                        request.name
                    );
                    return Ok(Outcome::Foreign);
                }
                debug!("no creator and no ClusterFilter for {}", request.name);
                return Ok(Outcome::Unchanged);
            }
        };

        if actual.is_some() && owner.as_ref() != Some(&key) {
            warn!(
                creator = %key,
                "ClusterFilter {} does not carry the ownership marker for this creator; \
                 leaving it alone",
                request.name
            );
            return Ok(Outcome::Foreign);
        }

        // A managed filter whose marker names a creator it is not the deterministic
        // filter of is a duplicate claim on that creator.
        let desired = if key.filter_name() == request.name {
            self.policy.desired_filter(&key, self.index.live_count(&key))
        } else {
            None
        };

        let outcome = match (actual, desired) {
            (None, Some(desired)) => {
                self.call(self.store.create(&desired)).await?;
                info!(creator = %key, "created ClusterFilter {}", request.name);
                Outcome::Created
            }
            (Some(actual), Some(desired)) => {
                if is_converged(&actual, &desired) {
                    debug!(creator = %key, "ClusterFilter {} is up to date", request.name);
                    Outcome::Unchanged
                } else {
                    info!(
                        creator = %key,
                        "drift detected; updating ClusterFilter {}", request.name
                    );
                    let merged = merge_desired(&actual, &desired);
                    self.call(self.store.replace(&merged)).await?;
                    Outcome::Updated
                }
            }
            (Some(actual), None) => {
                self.call(self.store.delete(&actual)).await?;
                info!(creator = %key, "deleted ClusterFilter {}", request.name);
                Outcome::Deleted
            }
            (None, None) => Outcome::Unchanged,
        };

        let duration = Instant::now().sub(start);
        debug!(
            "finished reconciling {} in {:?} ms",
            request.name,
            duration.as_millis()
        );
        Ok(outcome)
    }

    /// Requests for every managed filter whose creator is no longer live.
    pub async fn sweep(&self) -> Result<Vec<ReconcileRequest>> {
        self.call(stale_filters(&self.store, &self.index)).await
    }
}

/// Drains `queue` until it shuts down, requeueing retryable failures with
/// per-request exponential backoff.
pub async fn process_queue<S: FilterStore>(
    reconciler: Arc<RateLimitReconciler<S>>,
    queue: Arc<WorkQueue<ReconcileRequest>>,
) {
    while let Some(request) = queue.get().await {
        match reconciler.reconcile(&request).await {
            Ok(outcome) => {
                queue.forget(&request);
                debug!(?outcome, "reconciled {}", request.name);
            }
            Err(error) if error.is_retryable() => {
                let delay = queue.add_rate_limited(request.clone());
                warn!(
                    "reconcile of {} failed: {}; retrying in {:?}",
                    request.name, error, delay
                );
            }
            Err(Error::Cancelled) => {
                debug!("reconcile of {} cancelled", request.name);
            }
            Err(error) => {
                error!("reconcile of {} failed and will not be retried: {}", request.name, error);
            }
        }
        queue.done(&request);
    }
}

// Applies pod events to the index before enqueueing the creators they touched,
// so a reconcile always sees the event that triggered it.
async fn watch_pods(
    api: Api<Pod>,
    index: CreatorIndex,
    queue: Arc<WorkQueue<ReconcileRequest>>,
    readiness: Readiness,
) {
    let config = watcher::Config::default().labels(index.label());
    let mut events = watcher(api, config).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                for key in index.apply(&event) {
                    queue.add(ReconcileRequest::for_creator(&key));
                }
                readiness.set_synced(index.is_synced());
            }
            Err(error) => warn!("pod watch failed: {}", error),
        }
    }
}

async fn watch_filters(api: Api<ClusterFilter>, queue: Arc<WorkQueue<ReconcileRequest>>) {
    let config = watcher::Config::default().labels(&managed_selector());
    let mut filters = watcher(api, config)
        .default_backoff()
        .touched_objects()
        .boxed();
    while let Some(filter) = filters.next().await {
        match filter {
            Ok(filter) => queue.add(ReconcileRequest::for_filter(&filter)),
            Err(error) => warn!("ClusterFilter watch failed: {}", error),
        }
    }
}

async fn sweep_periodically<S: FilterStore>(
    reconciler: Arc<RateLimitReconciler<S>>,
    queue: Arc<WorkQueue<ReconcileRequest>>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match reconciler.sweep().await {
            Ok(requests) => {
                if !requests.is_empty() {
                    info!("sweep found {} stale ClusterFilters", requests.len());
                }
                for request in requests {
                    queue.add(request);
                }
            }
            Err(Error::IndexNotSynced) => debug!("skipping sweep until the pod index has synced"),
            Err(Error::Cancelled) => return,
            Err(error) => warn!("sweep failed: {}", error),
        }
    }
}

pub async fn controller(ctx: Context) -> Result<()> {
    let pod_api = Api::<Pod>::all(ctx.client.clone());
    pod_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::IndexRegistrationError)?;

    let filter_api = Api::<ClusterFilter>::all(ctx.client.clone());
    filter_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let index = CreatorIndex::new(&ctx.config.creator_label);
    let queue = Arc::new(WorkQueue::default());
    let reconciler = Arc::new(
        RateLimitReconciler::new(
            KubeFilterStore::new(ctx.client.clone()),
            index.clone(),
            ctx.policy.clone(),
        )
        .with_cancellation(ctx.shutdown.clone(), ctx.config.request_timeout),
    );

    let workers: Vec<_> = (0..ctx.config.workers)
        .map(|_| tokio::spawn(process_queue(reconciler.clone(), queue.clone())))
        .collect();
    info!("started {} reconcile workers", workers.len());

    tokio::select! {
        _ = ctx.shutdown.cancelled() => info!("shutting down rate limit controller"),
        _ = watch_pods(pod_api, index, queue.clone(), ctx.readiness.clone()) => {
            warn!("pod watch ended")
        }
        _ = watch_filters(filter_api, queue.clone()) => warn!("ClusterFilter watch ended"),
        _ = sweep_periodically(reconciler.clone(), queue.clone(), ctx.config.sweep_interval) => {}
    }

    queue.shutdown();
    for worker in futures::future::join_all(workers).await {
        if let Err(error) = worker {
            warn!("reconcile worker panicked: {}", error);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    // Fails every read with an error that must not be retried.
    struct MisconfiguredStore;

    #[async_trait]
    impl FilterStore for MisconfiguredStore {
        async fn get(&self, name: &str) -> Result<Option<ClusterFilter>> {
            Err(Error::InvalidConfigError(format!("cannot read {name}")))
        }

        async fn create(&self, filter: &ClusterFilter) -> Result<ClusterFilter> {
            Ok(filter.clone())
        }

        async fn replace(&self, filter: &ClusterFilter) -> Result<ClusterFilter> {
            Ok(filter.clone())
        }

        async fn delete(&self, _filter: &ClusterFilter) -> Result<()> {
            Ok(())
        }

        async fn list_managed(&self) -> Result<Vec<ClusterFilter>> {
            Ok(vec![])
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn unretryable_failures_are_logged_as_errors_and_dropped() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let index = CreatorIndex::new(crate::consts::DEFAULT_CREATOR_LABEL);
        index.apply(&watcher::Event::Restarted(vec![]));
        let reconciler = Arc::new(RateLimitReconciler::new(
            MisconfiguredStore,
            index,
            RateLimitPolicy::default(),
        ));
        let queue = Arc::new(WorkQueue::new(Duration::from_millis(1), Duration::from_millis(1)));
        let request = ReconcileRequest {
            name: "ratelimit-alpha-0000".to_string(),
        };
        queue.add(request.clone());

        tokio::join!(process_queue(reconciler, queue.clone()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(queue.is_empty());
            queue.shutdown();
        });

        let logs = logs.contents();
        assert!(logs.contains("ERROR"), "{logs}");
        assert!(logs.contains("will not be retried"), "{logs}");
        assert!(!logs.contains("retrying in"), "{logs}");
    }

    #[test]
    fn pod_and_filter_requests_share_an_identity() {
        let key = CreatorKey::parse("alpha").unwrap();
        let filter = ClusterFilter::new(&key.filter_name(), Default::default());
        assert_eq!(
            ReconcileRequest::for_creator(&key),
            ReconcileRequest::for_filter(&filter)
        );
    }

    #[test]
    fn only_mutations_count_as_writes() {
        assert!(Outcome::Created.is_write());
        assert!(Outcome::Deleted.is_write());
        assert!(!Outcome::Unchanged.is_write());
        assert!(!Outcome::Foreign.is_write());
    }
}

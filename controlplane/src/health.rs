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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::{Error, Result};

/// Readiness is gated on holding leadership and on the pod index having
/// completed its initial list.
#[derive(Clone, Default)]
pub struct Readiness {
    leader: Arc<AtomicBool>,
    synced: Arc<AtomicBool>,
}

impl Readiness {
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.leader.load(Ordering::Acquire) && self.synced.load(Ordering::Acquire)
    }
}

pub fn routes(
    readiness: Readiness,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let healthz = warp::path("healthz")
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", StatusCode::OK));
    let readyz = warp::path("readyz")
        .and(warp::path::end())
        .map(move || {
            if readiness.is_ready() {
                warp::reply::with_status("ok", StatusCode::OK)
            } else {
                warp::reply::with_status("not ready", StatusCode::SERVICE_UNAVAILABLE)
            }
        });
    warp::get().and(healthz.or(readyz).unify())
}

pub async fn serve(
    addr: SocketAddr,
    readiness: Readiness,
    shutdown: CancellationToken,
) -> Result<()> {
    let (bound, server) = warp::serve(routes(readiness))
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
        .map_err(|e| {
            Error::InvalidConfigError(format!("unable to bind health probes on {addr}: {e}"))
        })?;
    info!("serving health probes on {}", bound);
    server.await;
    Ok(())
}

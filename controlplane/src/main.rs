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

use std::sync::Arc;

use clap::Parser;
use controlplane::*;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run(config).await {
        error!("rate limit controller failed: {error:?}");
        std::process::exit(1);
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(error) => {
                warn!("unable to listen for SIGTERM: {error}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let policy = config.policy()?;

    let client = Client::try_default().await?;
    let shutdown = CancellationToken::new();
    let readiness = Readiness::default();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    let health = tokio::spawn(health::serve(
        config.health_probe_bind_address,
        readiness.clone(),
        shutdown.clone(),
    ));

    let elector = if config.enable_leader_election {
        let elector = LeaderElector::new(client.clone(), config.leader_election());
        match elector.acquire(&shutdown).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Ok(()),
            Err(error) => return Err(error.into()),
        }
        Some(elector)
    } else {
        info!("leader election disabled, running as leader");
        None
    };
    readiness.set_leader(true);

    let ctx = Context {
        client,
        config: Arc::new(config),
        policy,
        readiness,
        shutdown: shutdown.clone(),
    };

    let hold = async {
        match &elector {
            Some(elector) => elector.hold(&shutdown).await,
            None => {
                shutdown.cancelled().await;
                Ok(())
            }
        }
    };

    let controller = async {
        let result = ratelimit_controller(ctx).await;
        shutdown.cancel();
        result
    };

    let (controller_result, hold_result) = tokio::join!(controller, async {
        let result = hold.await;
        if let Err(error) = &result {
            error!("{error}");
        }
        shutdown.cancel();
        result
    });

    if let Ok(Err(error)) = health.await {
        warn!("health probe server failed: {error}");
    }
    controller_result?;
    hold_result?;
    info!("rate limit controller stopped");
    Ok(())
}

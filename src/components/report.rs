/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{ObjectRef, Store};

use crate::{
    metrics,
    providers::k8s::{self, agones::GameServer, CacheSync},
    signal::ShutdownRx,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("game server `{name}` has no pod in namespace `{namespace}`")]
    MissingPod { namespace: String, name: String },
}

/// What to do when a game server has no pod with the same name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MissingPodPolicy {
    /// Stop reporting and exit with an error.
    #[default]
    Abort,
    /// Log a warning and leave the game server out of the report.
    Skip,
}

/// The correlated status of one game server and its pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameServerReport {
    pub name: String,
    pub state: String,
    pub external_ip: String,
    pub internal_ip: String,
}

impl GameServerReport {
    fn new(gameserver: &GameServer, pod: &Pod) -> Self {
        Self {
            name: gameserver.metadata.name.clone().unwrap_or_default(),
            state: gameserver
                .state()
                .map(ToString::to_string)
                .unwrap_or_default(),
            external_ip: gameserver.address().to_owned(),
            internal_ip: pod
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.clone())
                .unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for GameServerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Name: {}, Status: {}, External IP: {}, Internal IP: {}",
            self.name, self.state, self.external_ip, self.internal_ip
        )
    }
}

/// Periodically correlates every cached game server with its pod and logs
/// the result.
pub struct Reporter {
    gameservers: Store<GameServer>,
    pods: Store<Pod>,
    namespace: String,
    interval: Duration,
    missing_pod_policy: MissingPodPolicy,
    ready: Arc<AtomicBool>,
}

impl Reporter {
    pub fn new(gameservers: Store<GameServer>, pods: Store<Pod>, namespace: String) -> Self {
        Self {
            gameservers,
            pods,
            namespace,
            interval: DEFAULT_INTERVAL,
            missing_pod_policy: MissingPodPolicy::default(),
            ready: Arc::default(),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn missing_pod_policy(mut self, policy: MissingPodPolicy) -> Self {
        self.missing_pod_policy = policy;
        self
    }

    /// Set to `true` once both caches have synced.
    pub fn ready(mut self, ready: Arc<AtomicBool>) -> Self {
        self.ready = ready;
        self
    }

    /// The pod backing `gameserver`, looked up by name in the pod namespace.
    pub fn lookup_pod(&self, gameserver: &GameServer) -> Option<Arc<Pod>> {
        let name = gameserver.metadata.name.as_deref()?;
        self.pods
            .get(&ObjectRef::new(name).within(&self.namespace))
    }

    /// Reports on every cached game server, in name order, returning what was
    /// logged.
    pub fn report_once(&self) -> Result<Vec<GameServerReport>, Error> {
        let mut gameservers = self.gameservers.state();
        gameservers.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut reports = Vec::with_capacity(gameservers.len());
        for gameserver in gameservers {
            let Some(pod) = self.lookup_pod(&gameserver) else {
                metrics::missing_pods_total().inc();
                let name = gameserver.metadata.name.clone().unwrap_or_default();
                match self.missing_pod_policy {
                    MissingPodPolicy::Abort => {
                        return Err(Error::MissingPod {
                            namespace: self.namespace.clone(),
                            name,
                        })
                    }
                    MissingPodPolicy::Skip => {
                        tracing::warn!(
                            gameserver = %name,
                            namespace = %self.namespace,
                            "no pod found for game server, skipping"
                        );
                        continue;
                    }
                }
            };

            let report = GameServerReport::new(&gameserver, &pod);
            tracing::info!(
                name = %report.name,
                state = %report.state,
                external_ip = %report.external_ip,
                internal_ip = %report.internal_ip,
                node = gameserver.node_name(),
                "{report}"
            );
            reports.push(report);
        }

        metrics::reports_total().inc();
        metrics::report_gameservers(reports.len());
        Ok(reports)
    }

    /// Waits for both caches to sync, then reports every interval until
    /// shutdown is requested or a report fails.
    pub async fn run(&self, mut shutdown_rx: ShutdownRx) -> crate::Result<()> {
        let synced = k8s::wait_for_cache_sync(
            &mut shutdown_rx,
            [
                CacheSync::new(k8s::POD, &self.pods),
                CacheSync::new(k8s::GAMESERVER, &self.gameservers),
            ],
        )
        .await?;

        if !synced {
            return Ok(());
        }

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(interval_secs = self.interval.as_secs_f64(), "starting reports");

        loop {
            self.report_once()?;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("stopping reports");
                    return Ok(());
                }
            }
        }
    }
}

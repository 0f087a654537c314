/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

pub mod agones;
pub mod informer;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::WrapErr;
use futures::{future::BoxFuture, FutureExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{
    reflector::{store::WriterDropped, Store},
    watcher,
};

use self::{agones::GameServer, informer::Informer};
use crate::{metrics, signal::ShutdownRx};

pub const POD: &str = "Pod";
pub const GAMESERVER: &str = "GameServer";

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// `$HOME/.kube/config`, if a home directory can be found.
pub fn default_kubeconfig() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".kube").join("config"))
}

/// Creates a client from `kubeconfig`. When no path is given the default
/// kubeconfig is used if it exists, otherwise the in-cluster configuration
/// is inferred.
pub async fn client(kubeconfig: Option<&Path>) -> crate::Result<kube::Client> {
    let default_path = default_kubeconfig().filter(|path| path.exists());
    let path = kubeconfig.or(default_path.as_deref());

    let config = tokio::time::timeout(CLIENT_TIMEOUT, async {
        match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading kubeconfig");
                let kubeconfig = kube::config::Kubeconfig::read_from(path)
                    .wrap_err_with(|| format!("couldn't read kubeconfig {}", path.display()))?;
                kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &kube::config::KubeConfigOptions::default(),
                )
                .await
                .wrap_err("couldn't build client config from kubeconfig")
            }
            None => {
                tracing::debug!("no kubeconfig found, inferring in-cluster config");
                kube::Config::infer()
                    .await
                    .wrap_err("couldn't infer cluster config")
            }
        }
    })
    .await
    .wrap_err("timed out loading cluster config")??;

    kube::Client::try_from(config).wrap_err("couldn't create kubernetes client")
}

/// Watches pods in `namespace`.
pub fn pod_informer(
    client: kube::Client,
    namespace: &str,
    resync_period: Duration,
) -> Informer<Pod> {
    Informer::new(
        POD,
        kube::Api::namespaced(client, namespace),
        watcher::Config::default(),
        resync_period,
    )
}

/// Watches game servers in every namespace.
pub fn gameserver_informer(client: kube::Client, resync_period: Duration) -> Informer<GameServer> {
    let mut config = watcher::Config::default();
    // Retreive unbounded results.
    config.page_size = None;

    Informer::new(GAMESERVER, kube::Api::all(client), config, resync_period)
}

/// A request handle standing in for the API server in tests.
#[cfg(test)]
pub(crate) type ApiServerHandle =
    tower_test::mock::Handle<http::Request<kube::client::Body>, http::Response<kube::client::Body>>;

/// A client whose requests are answered through the returned handle.
#[cfg(test)]
pub(crate) fn mock_client() -> (kube::Client, ApiServerHandle) {
    let (service, handle) = tower_test::mock::pair();
    (kube::Client::new(service, "default"), handle)
}

/// A cache that the sync barrier waits on.
pub struct CacheSync<'a> {
    kind: &'static str,
    ready: BoxFuture<'a, Result<(), WriterDropped>>,
}

impl<'a> CacheSync<'a> {
    pub fn new<K>(kind: &'static str, store: &'a Store<K>) -> Self
    where
        K: kube::Resource + Clone + Send + Sync + 'static,
        K::DynamicType: Eq + std::hash::Hash + Clone + Send + Sync,
    {
        Self {
            kind,
            ready: store.wait_until_ready().boxed(),
        }
    }
}

/// Blocks until every cache has completed its initial list, returning
/// `true`, or until shutdown is requested, returning `false`.
pub async fn wait_for_cache_sync(
    shutdown_rx: &mut ShutdownRx,
    caches: impl IntoIterator<Item = CacheSync<'_>>,
) -> crate::Result<bool> {
    let synced = futures::future::try_join_all(caches.into_iter().map(|cache| async move {
        cache
            .ready
            .await
            .wrap_err_with(|| format!("{} informer stopped before its cache synced", cache.kind))?;
        metrics::k8s::cache_synced(cache.kind, true);
        tracing::info!(kind = cache.kind, "cache synced");
        Ok::<_, eyre::Error>(())
    }));

    tokio::select! {
        result = synced => result.map(|_| true),
        _ = shutdown_rx.changed() => {
            tracing::info!("shutdown requested before caches synced");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use kube::runtime::{reflector::store::Writer, watcher::Event};

    use super::*;

    #[tokio::test]
    async fn barrier_waits_for_every_cache() {
        let (_shutdown_tx, mut shutdown_rx) = crate::signal::channel();
        let mut pods = Writer::<Pod>::default();
        let mut gameservers = Writer::<GameServer>::default();
        let (pod_store, gs_store) = (pods.as_reader(), gameservers.as_reader());

        pods.apply_watcher_event(&Event::InitDone);

        let barrier = wait_for_cache_sync(
            &mut shutdown_rx,
            [
                CacheSync::new(POD, &pod_store),
                CacheSync::new(GAMESERVER, &gs_store),
            ],
        );
        tokio::pin!(barrier);

        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut barrier)
                .await
                .is_err(),
            "barrier passed with only one cache synced"
        );

        gameservers.apply_watcher_event(&Event::InitDone);
        assert!(barrier.await.unwrap());
    }

    #[tokio::test]
    async fn barrier_returns_on_shutdown() {
        let (shutdown_tx, mut shutdown_rx) = crate::signal::channel();
        let pods = Writer::<Pod>::default();
        let pod_store = pods.as_reader();

        shutdown_tx.send(()).unwrap();
        let synced = wait_for_cache_sync(&mut shutdown_rx, [CacheSync::new(POD, &pod_store)])
            .await
            .unwrap();
        assert!(!synced);
    }

    #[tokio::test]
    async fn barrier_fails_when_writer_dropped() {
        let (_shutdown_tx, mut shutdown_rx) = crate::signal::channel();
        let pods = Writer::<Pod>::default();
        let pod_store = pods.as_reader();
        drop(pods);

        let result =
            wait_for_cache_sync(&mut shutdown_rx, [CacheSync::new(POD, &pod_store)]).await;
        assert!(result.is_err());
    }

    #[test]
    fn default_kubeconfig_under_home() {
        if let Some(path) = default_kubeconfig() {
            assert!(path.ends_with(".kube/config"));
        }
    }

    #[tokio::test]
    async fn missing_explicit_kubeconfig_is_fatal() {
        let result = client(Some(Path::new("/nonexistent/agones-informer/kubeconfig"))).await;
        assert!(result.is_err());
    }
}

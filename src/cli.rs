/*
 * Copyright 2022 Google LLC
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
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use crate::{
    components::{
        admin,
        report::{MissingPodPolicy, Reporter},
    },
    providers::k8s::{
        self,
        informer::{EventLogger, InformerHandle},
    },
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The Command-Line Interface for the informer.
#[derive(Clone, Debug, clap::Parser)]
#[command(version, about)]
#[non_exhaustive]
pub struct Cli {
    /// Path to the kubeconfig file. Defaults to `$HOME/.kube/config`, falling
    /// back to the in-cluster configuration when that doesn't exist.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
    /// The namespace that game server pods are looked up in.
    #[arg(
        long,
        env = "AGONES_INFORMER_NAMESPACE",
        default_value_t = From::from("default")
    )]
    pub namespace: String,
    /// How often every cached object is redelivered to the event handlers.
    #[arg(
        long,
        env = "AGONES_INFORMER_RESYNC_PERIOD_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub resync_period_secs: u64,
    /// How long to wait between reports.
    #[arg(
        long,
        env = "AGONES_INFORMER_REPORT_INTERVAL_SECS",
        default_value_t = 25,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub report_interval_secs: u64,
    /// What to do when a game server has no pod with the same name.
    #[arg(
        long,
        env = "AGONES_INFORMER_ON_MISSING_POD",
        value_enum,
        default_value_t = MissingPodPolicy::Abort
    )]
    pub on_missing_pod: MissingPodPolicy,
    /// Whether to spawn the admin server or not.
    #[arg(env = "AGONES_INFORMER_NO_ADMIN", long)]
    pub no_admin: bool,
    /// The address to bind for the admin server.
    #[arg(long, env = "AGONES_INFORMER_ADMIN_ADDRESS")]
    pub admin_address: Option<std::net::SocketAddr>,
    /// Whether the informer will report any results to stdout/stderr.
    #[arg(short, long, env = "AGONES_INFORMER_QUIET")]
    pub quiet: bool,
}

impl Cli {
    /// Drives the application lifecycle using the command line arguments.
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = &*version, "Starting agones-informer");

        let (shutdown_tx, shutdown_rx) = crate::signal::channel();
        crate::signal::spawn_handler(shutdown_tx.clone())?;

        let ready = Arc::new(AtomicBool::new(false));
        let _admin_task = if self.no_admin {
            None
        } else {
            Some(admin::server(ready.clone(), shutdown_tx, self.admin_address).await?)
        };

        let client = k8s::client(self.kubeconfig.as_deref()).await?;
        let resync_period = Duration::from_secs(self.resync_period_secs);

        let mut pods = k8s::pod_informer(client.clone(), &self.namespace, resync_period);
        pods.add_handler(EventLogger::new(k8s::POD));

        let mut gameservers = k8s::gameserver_informer(client, resync_period);
        gameservers.add_handler(EventLogger::new(k8s::GAMESERVER));

        let reporter = Reporter::new(gameservers.store(), pods.store(), self.namespace)
            .interval(Duration::from_secs(self.report_interval_secs))
            .missing_pod_policy(self.on_missing_pod)
            .ready(ready);

        let mut pods = pods.run();
        let mut gameservers = gameservers.run();

        run_until_stopped(reporter.run(shutdown_rx), &mut pods, &mut gameservers).await
    }
}

/// Runs `reporter` until it returns, failing as soon as either informer
/// stops. A stopped informer takes precedence so that a crash which also
/// triggers shutdown still exits with an error.
async fn run_until_stopped(
    reporter: impl std::future::Future<Output = crate::Result<()>>,
    pods: &mut InformerHandle,
    gameservers: &mut InformerHandle,
) -> crate::Result<()> {
    tokio::select! {
        biased;
        result = pods.join() => result,
        result = gameservers.join() => result,
        result = reporter => result,
    }
}

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

//! The subset of the Agones `GameServer` resource that the informer reads.
//!
//! Only the name, state and address are consulted. Everything else in the
//! resource is ignored so that schema changes in Agones don't break the
//! watch.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::Resource;
use serde::Deserialize;

#[derive(Clone, Debug)]
pub struct GameServer {
    pub metadata: ObjectMeta,
    pub status: Option<GameServerStatus>,
}

impl GameServer {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn with_status(mut self, status: GameServerStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// The current state, or `None` if Agones hasn't written a status yet.
    pub fn state(&self) -> Option<&GameServerState> {
        self.status.as_ref().map(|status| &status.state)
    }

    /// The externally reachable address, empty until one has been assigned.
    pub fn address(&self) -> &str {
        self.status
            .as_ref()
            .map(|status| status.address.as_str())
            .unwrap_or_default()
    }

    pub fn node_name(&self) -> &str {
        self.status
            .as_ref()
            .map(|status| status.node_name.as_str())
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct Inner {
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<GameServerStatus>,
}

impl<'de> serde::Deserialize<'de> for GameServer {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let value = serde_json::Value::deserialize(de)?;

        serde_json::from_value::<Inner>(value.clone())
            .map_err(|error| {
                tracing::trace!(%error, %value, "gameserver failed");
                Error::custom(error)
            })
            .map(|Inner { metadata, status }| Self { metadata, status })
    }
}

impl Resource for GameServer {
    type DynamicType = ();
    type Scope = kube::core::NamespaceResourceScope;

    fn group(_: &()) -> std::borrow::Cow<'_, str> {
        "agones.dev".into()
    }

    fn kind(_: &()) -> std::borrow::Cow<'_, str> {
        "GameServer".into()
    }

    fn version(_: &()) -> std::borrow::Cow<'_, str> {
        "v1".into()
    }

    fn api_version(_: &()) -> std::borrow::Cow<'_, str> {
        "agones.dev/v1".into()
    }

    fn plural(_: &()) -> std::borrow::Cow<'_, str> {
        "gameservers".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// The status for a [`GameServer`] resource.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// The current state of a [`GameServer`].
    #[serde(default)]
    pub state: GameServerState,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, strum_macros::Display)]
pub enum GameServerState {
    /// A dynamically allocating [`GameServer`] is being created, an open port needs
    /// to be allocated
    PortAllocation,
    /// The Pod for the [`GameServer`] is being created.
    Creating,
    /// The Pods for the [`GameServer`] are being created but are not yet Scheduled
    Starting,
    /// We have determined that the Pod has been scheduled in the cluster --
    /// basically, we have a `NodeName`
    Scheduled,
    /// The [`GameServer`] has declared that it is ready
    RequestReady,
    /// The [`GameServer`] is ready to take connections from game clients.
    Ready,
    /// The [`GameServer`] has shutdown and everything needs to be deleted from the cluster
    Shutdown,
    /// Something has gone wrong with the [`GameServer`] and it cannot be resolved
    Error,
    /// The [`GameServer`] has failed its health checks
    Unhealthy,
    /// The [`GameServer`] is reserved and therefore can be allocated but not removed
    Reserved,
    /// The [`GameServer`] has been allocated to a session
    Allocated,
    /// A state this version doesn't know about, or no state at all.
    #[default]
    #[serde(other)]
    #[strum(serialize = "")]
    Unknown,
}

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

//! A cache of one Kubernetes resource kind that delivers add, update and
//! delete notifications to registered handlers.
//!
//! The list+watch protocol is driven by [`kube::runtime::watcher`] and the
//! cache itself is a [`Store`]; this module only turns the watcher's events
//! into per-object notifications and periodically resyncs them.

use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use kube::{
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;

use crate::metrics;

/// A change to a single cached object.
#[derive(Debug)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Notification<K> {
    pub fn event(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
        }
    }

    fn dispatch(&self, handler: &dyn EventHandler<K>) {
        match self {
            Self::Added(obj) => handler.on_add(obj),
            Self::Updated { old, new } => handler.on_update(old, new),
            Self::Deleted(obj) => handler.on_delete(obj),
        }
    }
}

/// Receives notifications from an [`Informer`]. Every method defaults to
/// doing nothing.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}
    fn on_update(&self, _old: &K, _new: &K) {}
    fn on_delete(&self, _obj: &K) {}
}

/// Writes one log line for each notification, naming the kind and event.
#[derive(Clone, Debug)]
pub struct EventLogger {
    kind: &'static str,
}

impl EventLogger {
    pub fn new(kind: &'static str) -> Self {
        Self { kind }
    }
}

impl<K: Resource> EventHandler<K> for EventLogger {
    fn on_add(&self, obj: &K) {
        tracing::info!(
            kind = self.kind,
            event = "added",
            name = %obj.name_any(),
            namespace = obj.namespace().as_deref(),
            "{} Added",
            self.kind
        );
    }

    fn on_update(&self, _old: &K, new: &K) {
        tracing::info!(
            kind = self.kind,
            event = "updated",
            name = %new.name_any(),
            namespace = new.namespace().as_deref(),
            "{} Updated",
            self.kind
        );
    }

    fn on_delete(&self, obj: &K) {
        tracing::info!(
            kind = self.kind,
            event = "deleted",
            name = %obj.name_any(),
            namespace = obj.namespace().as_deref(),
            "{} Deleted",
            self.kind
        );
    }
}

/// Applies watcher events to a [`Store`], working out which notifications
/// each event produces.
pub struct Dispatcher<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    writer: Writer<K>,
    store: Store<K>,
}

impl<K> Default for Dispatcher<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self { writer, store }
    }
}

impl<K> Dispatcher<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    pub fn apply(&mut self, event: &Event<K>) -> Vec<Notification<K>> {
        match event {
            Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let old = self.store.get(&key);
                self.writer.apply_watcher_event(event);
                let new = self.store.get(&key).unwrap_or_else(|| Arc::new(obj.clone()));

                vec![match old {
                    Some(old) => Notification::Updated { old, new },
                    None => Notification::Added(new),
                }]
            }
            Event::Delete(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(event);
                vec![Notification::Deleted(
                    old.unwrap_or_else(|| Arc::new(obj.clone())),
                )]
            }
            // The relisted objects are buffered by the writer and only replace
            // the cache contents once the list is complete.
            Event::Init | Event::InitApply(_) => {
                self.writer.apply_watcher_event(event);
                Vec::new()
            }
            Event::InitDone => {
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(&*obj), obj))
                    .collect();

                self.writer.apply_watcher_event(event);

                let mut notifications: Vec<_> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|new| match previous.remove(&ObjectRef::from_obj(&*new)) {
                        Some(old) => Notification::Updated { old, new },
                        None => Notification::Added(new),
                    })
                    .collect();

                notifications.extend(previous.into_values().map(Notification::Deleted));
                notifications
            }
        }
    }

    /// An update notification for every cached object, with the cached
    /// object as both the old and the new value.
    pub fn resync(&self) -> Vec<Notification<K>> {
        self.store
            .state()
            .into_iter()
            .map(|obj| Notification::Updated {
                old: obj.clone(),
                new: obj,
            })
            .collect()
    }
}

fn track_event<K>(kind: &'static str, event: &Event<K>) {
    let ty = match event {
        Event::Apply(_) => "apply",
        Event::Init => "init",
        Event::InitApply(_) => "init-apply",
        Event::InitDone => "init-done",
        Event::Delete(_) => "delete",
    };

    metrics::k8s::events_total(kind, ty).inc();
}

/// Watches one resource kind, keeps a local cache of it, and delivers
/// notifications to its handlers.
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    kind: &'static str,
    api: kube::Api<K>,
    config: watcher::Config,
    resync_period: Duration,
    dispatcher: Dispatcher<K>,
    handlers: Vec<Box<dyn EventHandler<K>>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    /// `resync_period` must be non-zero.
    pub fn new(
        kind: &'static str,
        api: kube::Api<K>,
        config: watcher::Config,
        resync_period: Duration,
    ) -> Self {
        Self {
            kind,
            api,
            config,
            resync_period,
            dispatcher: Dispatcher::default(),
            handlers: Vec::new(),
        }
    }

    /// Registers a handler. Handlers only see notifications produced after
    /// [`Informer::run`] is called.
    pub fn add_handler(&mut self, handler: impl EventHandler<K> + 'static) -> &mut Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// A read handle over the cache. Wait on [`Store::wait_until_ready`]
    /// before reading from it.
    pub fn store(&self) -> Store<K> {
        self.dispatcher.store()
    }

    /// Starts watching in a background task.
    pub fn run(self) -> InformerHandle {
        let stream =
            kube::runtime::watcher(self.api.clone(), self.config.clone()).default_backoff();
        self.run_with(stream)
    }

    /// Drives the informer from `events` instead of the API server's watch.
    pub(crate) fn run_with<S>(self, events: S) -> InformerHandle
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static,
    {
        InformerHandle {
            task: tokio::spawn(self.watch(events)),
        }
    }

    fn deliver(&self, notifications: Vec<Notification<K>>) {
        for notification in notifications {
            metrics::k8s::notifications_total(self.kind, notification.event()).inc();
            for handler in &self.handlers {
                notification.dispatch(&**handler);
            }
        }
    }

    async fn watch<S>(mut self, stream: S) -> crate::Result<()>
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>>,
    {
        tokio::pin!(stream);

        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync_period,
            self.resync_period,
        );

        tracing::debug!(kind = self.kind, "starting watch");
        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        track_event(self.kind, &event);
                        let notifications = self.dispatcher.apply(&event);
                        self.deliver(notifications);
                    }
                    Some(Err(error)) => {
                        metrics::k8s::errors_total(self.kind, &error).inc();
                        tracing::warn!(kind = self.kind, %error, "watch error, retrying");
                    }
                    None => break Err(eyre::eyre!("{} watch stream terminated", self.kind)),
                },
                _ = resync.tick() => {
                    let notifications = self.dispatcher.resync();
                    tracing::trace!(kind = self.kind, objects = notifications.len(), "resync");
                    self.deliver(notifications);
                }
            }
        }
    }
}

/// The background task of a running [`Informer`]. Dropping the handle stops
/// the informer.
pub struct InformerHandle {
    task: tokio::task::JoinHandle<crate::Result<()>>,
}

impl InformerHandle {
    /// Resolves when the informer stops, which only happens on error.
    pub async fn join(&mut self) -> crate::Result<()> {
        (&mut self.task).await?
    }
}

impl Drop for InformerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::channel::mpsc;
    use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::ObjectMeta};
    use kube::Api;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;

    fn pod(name: &str, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some(version.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn object(notification: &Notification<Pod>) -> &Pod {
        match notification {
            Notification::Added(obj)
            | Notification::Deleted(obj)
            | Notification::Updated { new: obj, .. } => obj,
        }
    }

    fn summarise(notifications: &[Notification<Pod>]) -> Vec<(&'static str, String)> {
        let mut summary: Vec<_> = notifications
            .iter()
            .map(|n| (n.event(), object(n).name_any()))
            .collect();
        summary.sort();
        summary
    }

    fn initial_list(dispatcher: &mut Dispatcher<Pod>, pods: &[Pod]) -> Vec<Notification<Pod>> {
        let mut notifications = dispatcher.apply(&Event::Init);
        for pod in pods {
            notifications.extend(dispatcher.apply(&Event::InitApply(pod.clone())));
        }
        notifications.extend(dispatcher.apply(&Event::InitDone));
        notifications
    }

    #[test]
    fn apply_adds_then_updates() {
        let mut dispatcher = Dispatcher::<Pod>::default();

        let added = dispatcher.apply(&Event::Apply(pod("a", "1")));
        assert_eq!(vec![("added", "a".to_string())], summarise(&added));

        let updated = dispatcher.apply(&Event::Apply(pod("a", "2")));
        match &updated[..] {
            [Notification::Updated { old, new }] => {
                assert_eq!(Some("1"), old.metadata.resource_version.as_deref());
                assert_eq!(Some("2"), new.metadata.resource_version.as_deref());
            }
            other => panic!("expected a single update, got {other:?}"),
        }

        assert_eq!(1, dispatcher.store().state().len());
    }

    #[test]
    fn delete_uses_cached_object() {
        let mut dispatcher = Dispatcher::<Pod>::default();
        dispatcher.apply(&Event::Apply(pod("a", "1")));

        let deleted = dispatcher.apply(&Event::Delete(pod("a", "2")));
        match &deleted[..] {
            [Notification::Deleted(obj)] => {
                assert_eq!(Some("1"), obj.metadata.resource_version.as_deref());
            }
            other => panic!("expected a single delete, got {other:?}"),
        }

        assert!(dispatcher.store().state().is_empty());
    }

    #[test]
    fn delete_of_unknown_object() {
        let mut dispatcher = Dispatcher::<Pod>::default();
        let deleted = dispatcher.apply(&Event::Delete(pod("ghost", "1")));
        assert_eq!(vec![("deleted", "ghost".to_string())], summarise(&deleted));
    }

    #[test]
    fn initial_list_is_only_visible_once_done() {
        let mut dispatcher = Dispatcher::<Pod>::default();
        let store = dispatcher.store();

        assert!(dispatcher.apply(&Event::Init).is_empty());
        assert!(dispatcher.apply(&Event::InitApply(pod("a", "1"))).is_empty());
        assert!(store.state().is_empty());

        let notifications = dispatcher.apply(&Event::InitDone);
        assert_eq!(vec![("added", "a".to_string())], summarise(&notifications));
        assert_eq!(1, store.state().len());
    }

    #[test]
    fn relist_diffs_against_cache() {
        let mut dispatcher = Dispatcher::<Pod>::default();
        initial_list(&mut dispatcher, &[pod("a", "1"), pod("c", "1")]);

        let notifications = initial_list(&mut dispatcher, &[pod("a", "2"), pod("b", "1")]);
        assert_eq!(
            vec![
                ("added", "b".to_string()),
                ("deleted", "c".to_string()),
                ("updated", "a".to_string()),
            ],
            summarise(&notifications)
        );

        let mut names: Vec<_> = dispatcher
            .store()
            .state()
            .iter()
            .filter_map(|pod| pod.metadata.name.clone())
            .collect();
        names.sort();
        assert_eq!(vec!["a", "b"], names);
    }

    #[test]
    fn resync_updates_every_cached_object() {
        let mut dispatcher = Dispatcher::<Pod>::default();
        assert!(dispatcher.resync().is_empty());

        initial_list(&mut dispatcher, &[pod("a", "1"), pod("b", "1")]);
        let notifications = dispatcher.resync();
        assert_eq!(
            vec![("updated", "a".to_string()), ("updated", "b".to_string())],
            summarise(&notifications)
        );

        for notification in &notifications {
            let Notification::Updated { old, new } = notification else {
                unreachable!()
            };
            assert!(Arc::ptr_eq(old, new));
        }
    }

    #[tokio::test]
    async fn store_becomes_ready_after_initial_list() {
        let mut dispatcher = Dispatcher::<Pod>::default();
        let store = dispatcher.store();

        dispatcher.apply(&Event::Init);
        let pending =
            tokio::time::timeout(Duration::from_millis(10), store.wait_until_ready()).await;
        assert!(pending.is_err(), "store must not be ready before InitDone");

        dispatcher.apply(&Event::InitDone);
        tokio::time::timeout(Duration::from_secs(1), store.wait_until_ready())
            .await
            .expect("store should be ready")
            .unwrap();
    }

    #[derive(Default)]
    struct Counter {
        added: AtomicUsize,
        updated: AtomicUsize,
        deleted: AtomicUsize,
    }

    impl Counter {
        /// (added, updated, deleted)
        fn counts(&self) -> (usize, usize, usize) {
            (
                self.added.load(Ordering::SeqCst),
                self.updated.load(Ordering::SeqCst),
                self.deleted.load(Ordering::SeqCst),
            )
        }
    }

    impl EventHandler<Pod> for Arc<Counter> {
        fn on_add(&self, _: &Pod) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn on_update(&self, _: &Pod, _: &Pod) {
            self.updated.fetch_add(1, Ordering::SeqCst);
        }

        fn on_delete(&self, _: &Pod) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn each_notification_dispatched_once() {
        let counter = Arc::new(Counter::default());
        let mut dispatcher = Dispatcher::<Pod>::default();

        let mut notifications = initial_list(&mut dispatcher, &[pod("a", "1"), pod("b", "1")]);
        notifications.extend(dispatcher.apply(&Event::Apply(pod("a", "2"))));
        notifications.extend(dispatcher.apply(&Event::Delete(pod("b", "2"))));

        for notification in &notifications {
            notification.dispatch(&counter);
        }

        assert_eq!(2, counter.added.load(Ordering::SeqCst));
        assert_eq!(1, counter.updated.load(Ordering::SeqCst));
        assert_eq!(1, counter.deleted.load(Ordering::SeqCst));
    }

    #[traced_test]
    #[test]
    fn logger_names_kind_and_event() {
        let logger = EventLogger::new("Pod");
        let mut dispatcher = Dispatcher::<Pod>::default();

        for event in [
            Event::Apply(pod("a", "1")),
            Event::Apply(pod("a", "2")),
            Event::Delete(pod("a", "3")),
        ] {
            for notification in dispatcher.apply(&event) {
                notification.dispatch(&logger);
            }
        }

        assert!(logs_contain("Pod Added"));
        assert!(logs_contain("Pod Updated"));
        assert!(logs_contain("Pod Deleted"));
        assert!(logs_contain("name=a"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("Pod Added")).count() {
                1 => Ok(()),
                n => Err(format!("expected one add line, found {n}")),
            }
        });
    }

    type EventTx = mpsc::UnboundedSender<Result<Event<Pod>, watcher::Error>>;

    /// An informer fed from a channel rather than the API server.
    fn channel_informer(
        kind: &'static str,
        resync_period: Duration,
    ) -> (InformerHandle, Arc<Counter>, EventTx) {
        let (client, _apiserver) = crate::providers::k8s::mock_client();
        let counter = Arc::new(Counter::default());
        let mut informer = Informer::new(
            kind,
            Api::<Pod>::namespaced(client, "default"),
            watcher::Config::default(),
            resync_period,
        );
        informer.add_handler(counter.clone());

        let (events, rx) = mpsc::unbounded();
        (informer.run_with(rx), counter, events)
    }

    fn body(bytes: Vec<u8>) -> http::Response<kube::client::Body> {
        http::Response::builder()
            .body(kube::client::Body::from(bytes))
            .unwrap()
    }

    #[tokio::test]
    async fn informer_follows_list_then_watch() {
        let (client, mut apiserver) = crate::providers::k8s::mock_client();
        let counter = Arc::new(Counter::default());
        let mut informer = Informer::new(
            "Pod",
            Api::<Pod>::namespaced(client, "default"),
            watcher::Config::default(),
            Duration::from_secs(3600),
        );
        informer.add_handler(counter.clone());
        let store = informer.store();
        let _handle = informer.run();

        let (request, send) = apiserver.next_request().await.expect("list request");
        assert_eq!(http::Method::GET, request.method());
        assert!(!request.uri().to_string().contains("watch=true"));
        let list = serde_json::json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": { "resourceVersion": "1" },
            "items": [pod("a", "1"), pod("b", "1")],
        });
        send.send_response(body(serde_json::to_vec(&list).unwrap()));

        let (request, send) = apiserver.next_request().await.expect("watch request");
        assert!(request.uri().to_string().contains("watch=true"));
        let events: String = [
            ("ADDED", pod("c", "2")),
            ("MODIFIED", pod("a", "3")),
            ("DELETED", pod("b", "4")),
        ]
        .into_iter()
        .map(|(ty, pod)| format!("{}\n", serde_json::json!({ "type": ty, "object": pod })))
        .collect();
        send.send_response(body(events.into_bytes()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.deleted.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("watch events were not delivered");

        // Nothing is delivered twice.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!((3, 1, 1), counter.counts());

        let mut names: Vec<_> = store.state().iter().map(|pod| pod.name_any()).collect();
        names.sort();
        assert_eq!(vec!["a", "c"], names);
    }

    #[tokio::test(start_paused = true)]
    async fn informer_resyncs_every_period() {
        let (_handle, counter, events) = channel_informer("ResyncPod", Duration::from_secs(30));
        for event in [
            Event::Init,
            Event::InitApply(pod("a", "1")),
            Event::InitApply(pod("b", "1")),
            Event::InitDone,
        ] {
            events.unbounded_send(Ok(event)).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!((2, 0, 0), counter.counts());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!((2, 2, 0), counter.counts());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!((2, 4, 0), counter.counts());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_errors_are_counted_and_skipped() {
        let (handle, counter, events) = channel_informer("FlakyPod", Duration::from_secs(3600));
        events
            .unbounded_send(Err(watcher::Error::NoResourceVersion))
            .unwrap();
        events.unbounded_send(Ok(Event::Apply(pod("a", "1")))).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            1,
            metrics::k8s::errors_total("FlakyPod", &watcher::Error::NoResourceVersion).get()
        );
        assert_eq!((1, 0, 0), counter.counts());
        assert!(!handle.task.is_finished());
    }

    #[tokio::test]
    async fn ended_watch_stops_the_informer() {
        let (mut handle, _counter, events) =
            channel_informer("EndedPod", Duration::from_secs(3600));
        drop(events);

        let error = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("informer should stop")
            .unwrap_err();
        assert!(
            error.to_string().contains("watch stream terminated"),
            "{error}"
        );
    }
}

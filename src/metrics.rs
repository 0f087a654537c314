/*
 * Copyright 2020 Google LLC All Rights Reserved.
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

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub const NAMESPACE: &str = "agones_informer";

pub(crate) const KIND_LABEL: &str = "kind";
pub(crate) const EVENT_LABEL: &str = "event";

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);

/// Returns the [`Registry`] containing every metric this crate registers.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
}

/// Total number of full reports produced by the report loop.
pub fn reports_total() -> IntCounter {
    static METRIC: Lazy<IntCounter> = Lazy::new(|| {
        prometheus::register_int_counter_with_registry! {
            opts("reports_total", "", "Total number of completed game server reports"),
            registry(),
        }
        .unwrap()
    });

    METRIC.clone()
}

/// Number of game servers included in the most recent report.
pub fn report_gameservers(count: usize) {
    static METRIC: Lazy<IntGauge> = Lazy::new(|| {
        prometheus::register_int_gauge_with_registry! {
            opts("report_gameservers", "", "Number of game servers in the most recent report"),
            registry(),
        }
        .unwrap()
    });

    METRIC.set(count as _);
}

/// Total number of game servers whose backing pod could not be found.
pub fn missing_pods_total() -> IntCounter {
    static METRIC: Lazy<IntCounter> = Lazy::new(|| {
        prometheus::register_int_counter_with_registry! {
            opts(
                "missing_pods_total",
                "",
                "Total number of game servers that had no pod with the same name",
            ),
            registry(),
        }
        .unwrap()
    });

    METRIC.clone()
}

pub mod k8s {
    use super::*;

    /// Raw watch events received from the API server, by kind and event type.
    pub fn events_total(kind: &str, event: &str) -> IntCounter {
        static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
            prometheus::register_int_counter_vec_with_registry! {
                opts("events_total", "k8s", "Total number of watch events received"),
                &[KIND_LABEL, EVENT_LABEL],
                registry(),
            }
            .unwrap()
        });

        METRIC.with_label_values(&[kind, event])
    }

    /// Notifications delivered to event handlers, by kind and event type.
    pub fn notifications_total(kind: &str, event: &str) -> IntCounter {
        static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
            prometheus::register_int_counter_vec_with_registry! {
                opts(
                    "notifications_total",
                    "k8s",
                    "Total number of add, update and delete notifications delivered to handlers",
                ),
                &[KIND_LABEL, EVENT_LABEL],
                registry(),
            }
            .unwrap()
        });

        METRIC.with_label_values(&[kind, event])
    }

    pub fn errors_total(kind: &str, reason: &impl std::fmt::Display) -> IntCounter {
        static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
            prometheus::register_int_counter_vec_with_registry! {
                opts("errors_total", "k8s", "Total number of errors from the watch streams"),
                &[KIND_LABEL, "reason"],
                registry(),
            }
            .unwrap()
        });

        METRIC.with_label_values(&[kind, &reason.to_string()])
    }

    /// Whether the cache for `kind` has completed its initial sync (either 1 or 0).
    pub fn cache_synced(kind: &str, synced: bool) {
        static METRIC: Lazy<prometheus::IntGaugeVec> = Lazy::new(|| {
            prometheus::register_int_gauge_vec_with_registry! {
                opts("cache_synced", "k8s", "Whether a cache has completed its initial sync"),
                &[KIND_LABEL],
                registry(),
            }
            .unwrap()
        });

        METRIC.with_label_values(&[kind]).set(synced as _);
    }
}

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

mod health;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};
type Body = Full<Bytes>;

pub use health::Health;

pub const PORT: u16 = 8000;

/// Binds the admin endpoint to `address` (or `[::]:8000`) and serves it in a
/// background task.
pub async fn server(
    ready: Arc<AtomicBool>,
    shutdown_tx: crate::signal::ShutdownTx,
    address: Option<std::net::SocketAddr>,
) -> crate::Result<tokio::task::JoinHandle<crate::Result<()>>> {
    let address = address.unwrap_or_else(|| (std::net::Ipv6Addr::UNSPECIFIED, PORT).into());
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!(address = %address, "Starting admin endpoint");

    Ok(tokio::spawn(serve(listener, ready, Health::new(shutdown_tx))))
}

/// Serves admin requests on `listener` until an accept fails.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ready: Arc<AtomicBool>,
    health: Health,
) -> crate::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let stream = hyper_util::rt::TokioIo::new(stream);

        let health = health.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            let svc = hyper::service::service_fn(move |req| {
                let health = health.clone();
                let ready = ready.clone();

                async move {
                    Ok::<_, std::convert::Infallible>(handle_request(req, &ready, &health))
                }
            });

            if let Err(error) = hyper::server::conn::http1::Builder::new()
                .serve_connection(stream, svc)
                .await
            {
                tracing::warn!(%error, "failed to respond to admin request");
            }
        });
    }
}

fn handle_request<B>(request: Request<B>, ready: &AtomicBool, health: &Health) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => collect_metrics(),
        (&Method::GET, "/live" | "/livez") => health.check_liveness(),
        (&Method::GET, "/ready" | "/readyz") => check_readiness(ready),
        (_, _) => {
            let mut response = Response::new(Body::new(Bytes::new()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

fn check_readiness(check: &AtomicBool) -> Response<Body> {
    if check.load(Ordering::SeqCst) {
        return Response::new("ok".into());
    }

    let mut response = Response::new(Bytes::from_static(b"NOT READY").into());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::new(Bytes::new()));
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body =
        prometheus::Encoder::encode(&encoder, &crate::metrics::registry().gather(), &mut buffer)
            .map_err(|error| tracing::warn!(%error, "Failed to encode metrics"))
            .and_then(|_| {
                String::from_utf8(buffer)
                    .map(Bytes::from)
                    .map_err(|error| tracing::warn!(%error, "Failed to convert metrics to utf8"))
            });

    match body {
        Ok(body) => {
            *response.body_mut() = Body::new(body);
        }
        Err(_) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    response
}

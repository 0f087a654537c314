/*
 * Copyright 2020 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

use std::panic;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};

use agones_informer::components::admin::{self, Health};

// The panic hook is process wide, so this binary only holds a single test.
#[tokio::test]
async fn health_server() {
    let (shutdown_tx, shutdown_rx) = agones_informer::signal::channel();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(admin::serve(
        listener,
        Default::default(),
        Health::new(shutdown_tx),
    ));

    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let uri: hyper::Uri = format!("http://{address}/live").parse().unwrap();

    let resp = client.get(uri.clone()).await.unwrap();
    assert!(resp.status().is_success());
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&b"ok"[..], &body[..]);

    let _ = panic::catch_unwind(|| {
        panic!("oh no!");
    });

    let resp = client.get(uri).await.unwrap();
    assert!(resp.status().is_server_error(), "Should be unhealthy");
    assert!(shutdown_rx.has_changed().unwrap());
}

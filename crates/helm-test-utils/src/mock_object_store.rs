//! Mock object store.
//!
//! Accepts presigned-style PUT/GET on arbitrary keys and retains bodies
//! with their content types so tests can assert on exactly what was
//! uploaded, in what order.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// One stored object version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// One PUT as it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    pub key: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Store {
    objects: Mutex<HashMap<String, StoredObject>>,
    /// Every PUT in arrival order.
    puts: Mutex<Vec<PutRecord>>,
}

pub struct MockObjectStore {
    local_addr: SocketAddr,
    store: Arc<Store>,
}

impl MockObjectStore {
    pub async fn start() -> Self {
        let store = Arc::new(Store::default());
        let router = Router::new()
            .route("/{*key}", get(get_object).put(put_object))
            .with_state(Arc::clone(&store));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock object store");
        let local_addr = listener.local_addr().expect("local_addr after bind");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        MockObjectStore { local_addr, store }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A "presigned" PUT/GET URL for a key.
    pub fn put_url(&self, key: &str) -> String {
        format!("http://{}/{}?sig=test", self.local_addr, key)
    }

    pub fn get_url(&self, key: &str) -> String {
        self.put_url(key)
    }

    /// Current object under a key, if any PUT landed.
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.store.objects.lock().expect("objects lock").get(key).cloned()
    }

    /// Seed an object for GET-only scenarios (defrost sources).
    pub fn preload(&self, key: &str, content_type: &str, body: Vec<u8>) {
        self.store.objects.lock().expect("objects lock").insert(
            key.to_owned(),
            StoredObject {
                content_type: content_type.to_owned(),
                body,
            },
        );
    }

    /// PUT history in arrival order.
    pub fn put_log(&self) -> Vec<PutRecord> {
        self.store.puts.lock().expect("puts lock").clone()
    }
}

async fn put_object(
    Path(key): Path<String>,
    State(store): State<Arc<Store>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();
    store.puts.lock().expect("puts lock").push(PutRecord {
        key: key.clone(),
        content_type: content_type.clone(),
        body: body.to_vec(),
    });
    store.objects.lock().expect("objects lock").insert(
        key,
        StoredObject {
            content_type,
            body: body.to_vec(),
        },
    );
    StatusCode::OK
}

async fn get_object(
    Path(key): Path<String>,
    State(store): State<Arc<Store>>,
) -> Result<([(&'static str, String); 1], Vec<u8>), StatusCode> {
    let objects = store.objects.lock().expect("objects lock");
    match objects.get(&key) {
        Some(object) => Ok((
            [("content-type", object.content_type.clone())],
            object.body.clone(),
        )),
        None => Err(StatusCode::NOT_FOUND),
    }
}

//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use swcache_net::{Fetch, NetError, Request, Response};

/// Fetcher answering from a fixed route table and recording every call.
#[derive(Debug, Default)]
pub struct StubFetcher {
    routes: HashMap<String, (u16, String)>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, url: &str, status: u16, body: &str) -> Self {
        self.routes.insert(url.to_string(), (status, body.to_string()));
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetch for StubFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.lock().unwrap().push(request.url.to_string());

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        match self.routes.get(request.url.as_str()) {
            Some((status, body)) => {
                let status = StatusCode::from_u16(*status).unwrap();
                Ok(Response::new(request.url.clone(), status).with_body(body.clone()))
            }
            None => Err(NetError::RequestFailed(format!("no route for {}", request.url))),
        }
    }
}

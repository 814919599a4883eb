//! Scripted transport shared by the unit tests.

use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::{Transport, TransportError};

/// Answers from a path → response table; unknown paths answer 404.
/// `set_offline(true)` makes every request fail with a network error.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, Result<Json, TransportError>>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, path: &str, response: Result<Json, TransportError>) -> Self {
        self.set(path, response);
        self
    }

    pub fn set(&self, path: &str, response: Result<Json, TransportError>) {
        self.responses.lock().insert(path.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn answer(&self, path: &str) -> Result<Json, TransportError> {
        self.calls.lock().push(path.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(network_error(path));
        }
        self.responses
            .lock()
            .get(path)
            .cloned()
            .unwrap_or_else(|| Err(TransportError::Status {
                url: path.to_string(),
                status: 404,
            }))
    }
}

impl Transport for FakeTransport {
    fn get_json(&self, path: &str) -> Result<Json, TransportError> {
        self.answer(path)
    }

    fn fire_and_forget(&self, path: &str) -> Result<(), TransportError> {
        self.answer(path).map(|_| ())
    }
}

pub fn network_error(path: &str) -> TransportError {
    TransportError::Network {
        url: path.to_string(),
        message: "connection refused".to_string(),
    }
}

/// Batch response captured from a Trio unit.
pub fn batch_fixture() -> Json {
    let json = std::fs::read_to_string("tests/data/trio-all.json").expect("fixture present");
    serde_json::from_str(&json).expect("parse batch fixture")
}

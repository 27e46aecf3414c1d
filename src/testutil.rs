//! In-memory transport for exercising the session core without a hub.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ChatError, Result};
use crate::transport::{ConnectionState, SessionKind, Transport};

/// Records every invocation and fails the ones it is told to.
pub struct RecordingTransport {
    kind: SessionKind,
    connection_id: String,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    failing: Mutex<HashSet<String>>,
    held: Mutex<HashSet<String>>,
    start_failures_left: AtomicUsize,
    start_attempts: AtomicUsize,
    state: AtomicU8,
}

impl RecordingTransport {
    pub fn new(kind: SessionKind, connection_id: &str) -> Self {
        Self {
            kind,
            connection_id: connection_id.to_string(),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            held: Mutex::new(HashSet::new()),
            start_failures_left: AtomicUsize::new(0),
            start_attempts: AtomicUsize::new(0),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
        }
    }

    /// Fail the next `count` start attempts.
    pub fn fail_starts(self, count: usize) -> Self {
        self.start_failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_method(&self, method: &str) {
        self.failing.lock().unwrap().insert(method.to_string());
    }

    pub fn heal_method(&self, method: &str) {
        self.failing.lock().unwrap().remove(method);
    }

    /// Record calls to `method` but never complete them
    pub fn hold_method(&self, method: &str) {
        self.held.lock().unwrap().insert(method.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        self.calls()
            .into_iter()
            .filter(|(name, _)| name == method)
            .map(|(_, args)| args)
            .collect()
    }

    pub fn start_attempts(&self) -> usize {
        self.start_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start(&self) -> Result<String> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.start_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.start_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ChatError::ConnectionFailure {
                session: self.kind,
                reason: "connection refused".into(),
            });
        }
        self.state
            .store(ConnectionState::Connected.as_u8(), Ordering::SeqCst);
        Ok(self.connection_id.clone())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), args));
        let held = self.held.lock().unwrap().contains(method);
        if held {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(method) {
            return Err(ChatError::invocation(method, "hub rejected the call"));
        }
        Ok(Value::Null)
    }

    async fn stop(&self) {
        self.state
            .store(ConnectionState::Disconnected.as_u8(), Ordering::SeqCst);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

//! Remote gateway abstraction.
//!
//! The engine talks to the backend only through [`RemoteGateway`]. The
//! production binding is [`crate::http::HttpGateway`]; tests use
//! [`mock::MockGateway`].

use async_trait::async_trait;
use fieldsync_types::{Action, EntityKind, OfflineId, OperationId, RemoteRecord, ServerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors reported by a gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Connection failed or was reset.
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The server rejected the credentials (401/403).
    #[error("authentication required: {0}")]
    Unauthorized(String),

    /// Any other non-success status.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The server answered with a body we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The gateway does not implement the call.
    #[error("not supported: {0}")]
    Unsupported(String),
}

impl GatewayError {
    /// Maps an HTTP status and body to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => GatewayError::Unauthorized(message),
            _ => GatewayError::Status { status, message },
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, GatewayError::Unauthorized(_))
    }

    /// A 4xx rejection that will not succeed on resend. 408 and 429 are
    /// transient and excluded.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status()
            .is_some_and(|s| (400..500).contains(&s) && s != 408 && s != 429)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Whether resending the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !self.is_auth() && !self.is_client_error() && !matches!(self, GatewayError::Unsupported(_))
    }
}

/// One queued mutation sent through [`RemoteGateway::sync_batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub op_id: OperationId,
    pub action: Action,
    pub entity_kind: EntityKind,
    /// Lets the server resolve records whose CREATE is in the same batch.
    pub offline_id: OfflineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    pub payload: Value,
}

/// Server verdict on one batched operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BatchOutcome {
    Applied {
        #[serde(default)]
        server_id: Option<ServerId>,
    },
    Rejected {
        status: u16,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub op_id: OperationId,
    pub outcome: BatchOutcome,
}

/// Backend API used by the sync engine.
///
/// `create` must be idempotent on `offline_id`: a second call with the same
/// offline id returns the record created by the first.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn create(
        &self,
        kind: EntityKind,
        offline_id: OfflineId,
        payload: &Value,
    ) -> Result<RemoteRecord, GatewayError>;

    async fn update(
        &self,
        kind: EntityKind,
        server_id: &ServerId,
        payload: &Value,
    ) -> Result<RemoteRecord, GatewayError>;

    async fn delete(&self, kind: EntityKind, server_id: &ServerId) -> Result<(), GatewayError>;

    /// Every server record of a kind.
    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, GatewayError>;

    /// Applies several operations in one round trip, in order.
    async fn sync_batch(
        &self,
        _operations: &[BatchOperation],
    ) -> Result<Vec<BatchResult>, GatewayError> {
        Err(GatewayError::Unsupported("sync_batch".to_string()))
    }
}

/// In-memory gateway for tests.
pub mod mock {
    use super::*;
    use fieldsync_types::Timestamp;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    /// A call observed by the mock, in arrival order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum GatewayCall {
        Create { kind: EntityKind, offline_id: OfflineId },
        Update { kind: EntityKind, server_id: ServerId },
        Delete { kind: EntityKind, server_id: ServerId },
        FetchAll { kind: EntityKind },
        Batch { operations: usize },
    }

    impl GatewayCall {
        /// True for calls that change server state.
        pub fn is_mutation(&self) -> bool {
            !matches!(self, GatewayCall::FetchAll { .. })
        }
    }

    type Matcher = Box<dyn Fn(&GatewayCall) -> bool + Send + Sync>;
    type OpMatcher = Box<dyn Fn(&BatchOperation) -> bool + Send + Sync>;

    struct FailureRule {
        matches: Matcher,
        error: GatewayError,
        remaining: Option<u32>,
    }

    #[derive(Default)]
    struct MockState {
        collections: HashMap<EntityKind, Vec<RemoteRecord>>,
        calls: Vec<GatewayCall>,
        rules: Vec<FailureRule>,
        batch_scripts: Vec<(OpMatcher, BatchOutcome)>,
        next_id: u64,
        latency: Option<Duration>,
        batch_supported: bool,
    }

    impl MockState {
        fn apply_create(&mut self, kind: EntityKind, offline_id: OfflineId, payload: &Value) -> RemoteRecord {
            let collection = self.collections.entry(kind).or_default();
            if let Some(existing) = collection.iter().find(|r| r.offline_id == Some(offline_id)) {
                return existing.clone();
            }
            self.next_id += 1;
            let record = RemoteRecord {
                server_id: ServerId::new(format!("srv-{}", self.next_id)),
                offline_id: Some(offline_id),
                payload: payload.clone(),
                updated_at: Some(Timestamp::now()),
            };
            collection.push(record.clone());
            record
        }

        fn apply_update(
            &mut self,
            kind: EntityKind,
            server_id: &ServerId,
            payload: &Value,
        ) -> Result<RemoteRecord, GatewayError> {
            let record = self
                .collections
                .entry(kind)
                .or_default()
                .iter_mut()
                .find(|r| &r.server_id == server_id)
                .ok_or_else(|| GatewayError::from_status(404, format!("{kind} {server_id} not found")))?;
            record.payload = payload.clone();
            record.updated_at = Some(Timestamp::now());
            Ok(record.clone())
        }

        fn apply_delete(&mut self, kind: EntityKind, server_id: &ServerId) -> Result<(), GatewayError> {
            let collection = self.collections.entry(kind).or_default();
            let before = collection.len();
            collection.retain(|r| &r.server_id != server_id);
            if collection.len() == before {
                return Err(GatewayError::from_status(404, format!("{kind} {server_id} not found")));
            }
            Ok(())
        }

        fn resolve(&self, op: &BatchOperation) -> Option<ServerId> {
            op.server_id.clone().or_else(|| {
                self.collections
                    .get(&op.entity_kind)?
                    .iter()
                    .find(|r| r.offline_id == Some(op.offline_id))
                    .map(|r| r.server_id.clone())
            })
        }

        fn apply_batch_op(&mut self, op: &BatchOperation) -> BatchOutcome {
            let result = match op.action {
                Action::Create => Ok(Some(
                    self.apply_create(op.entity_kind, op.offline_id, &op.payload).server_id,
                )),
                Action::Update | Action::Delete => match self.resolve(op) {
                    None => Err(GatewayError::from_status(404, "unknown record")),
                    Some(server_id) if op.action == Action::Update => self
                        .apply_update(op.entity_kind, &server_id, &op.payload)
                        .map(|r| Some(r.server_id)),
                    Some(server_id) => self.apply_delete(op.entity_kind, &server_id).map(|()| None),
                },
            };
            match result {
                Ok(server_id) => BatchOutcome::Applied { server_id },
                Err(e) => BatchOutcome::Rejected {
                    status: e.status().unwrap_or(500),
                    message: e.to_string(),
                },
            }
        }
    }

    /// A scripted backend that keeps records in memory.
    ///
    /// Creates are deduplicated by offline id. Failures are injected with
    /// [`MockGateway::fail_when`] and [`MockGateway::fail_times`].
    #[derive(Clone, Default)]
    pub struct MockGateway {
        state: Arc<Mutex<MockState>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Places a record on the server side.
        pub fn seed(&self, kind: EntityKind, record: RemoteRecord) {
            self.state().collections.entry(kind).or_default().push(record);
        }

        /// Server-side records of a kind.
        pub fn records(&self, kind: EntityKind) -> Vec<RemoteRecord> {
            self.state().collections.get(&kind).cloned().unwrap_or_default()
        }

        pub fn calls(&self) -> Vec<GatewayCall> {
            self.state().calls.clone()
        }

        pub fn mutation_calls(&self) -> Vec<GatewayCall> {
            self.state().calls.iter().filter(|c| c.is_mutation()).cloned().collect()
        }

        pub fn clear_calls(&self) {
            self.state().calls.clear();
        }

        /// Fails every matching call until cleared.
        pub fn fail_when<F>(&self, matches: F, error: GatewayError)
        where
            F: Fn(&GatewayCall) -> bool + Send + Sync + 'static,
        {
            self.state().rules.push(FailureRule {
                matches: Box::new(matches),
                error,
                remaining: None,
            });
        }

        /// Fails the next `times` matching calls.
        pub fn fail_times<F>(&self, matches: F, error: GatewayError, times: u32)
        where
            F: Fn(&GatewayCall) -> bool + Send + Sync + 'static,
        {
            self.state().rules.push(FailureRule {
                matches: Box::new(matches),
                error,
                remaining: Some(times),
            });
        }

        pub fn clear_failures(&self) {
            let mut state = self.state();
            state.rules.clear();
            state.batch_scripts.clear();
        }

        /// Answers matching batch operations with `outcome` without applying
        /// them, until cleared.
        pub fn script_batch_outcome<F>(&self, matches: F, outcome: BatchOutcome)
        where
            F: Fn(&BatchOperation) -> bool + Send + Sync + 'static,
        {
            self.state().batch_scripts.push((Box::new(matches), outcome));
        }

        /// Delays every call, so tests can observe a cycle in flight.
        pub fn set_latency(&self, latency: Duration) {
            self.state().latency = Some(latency);
        }

        /// Enables [`RemoteGateway::sync_batch`].
        pub fn enable_batch(&self) {
            self.state().batch_supported = true;
        }

        async fn begin(&self, call: GatewayCall) -> Result<(), GatewayError> {
            let (latency, injected) = {
                let mut state = self.state();
                let injected = state
                    .rules
                    .iter_mut()
                    .find(|rule| rule.remaining != Some(0) && (rule.matches)(&call))
                    .map(|rule| {
                        if let Some(remaining) = rule.remaining.as_mut() {
                            *remaining -= 1;
                        }
                        rule.error.clone()
                    });
                state.calls.push(call);
                (state.latency, injected)
            };
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            injected.map_or(Ok(()), Err)
        }
    }

    #[async_trait]
    impl RemoteGateway for MockGateway {
        async fn create(
            &self,
            kind: EntityKind,
            offline_id: OfflineId,
            payload: &Value,
        ) -> Result<RemoteRecord, GatewayError> {
            self.begin(GatewayCall::Create { kind, offline_id }).await?;
            Ok(self.state().apply_create(kind, offline_id, payload))
        }

        async fn update(
            &self,
            kind: EntityKind,
            server_id: &ServerId,
            payload: &Value,
        ) -> Result<RemoteRecord, GatewayError> {
            self.begin(GatewayCall::Update {
                kind,
                server_id: server_id.clone(),
            })
            .await?;
            self.state().apply_update(kind, server_id, payload)
        }

        async fn delete(&self, kind: EntityKind, server_id: &ServerId) -> Result<(), GatewayError> {
            self.begin(GatewayCall::Delete {
                kind,
                server_id: server_id.clone(),
            })
            .await?;
            self.state().apply_delete(kind, server_id)
        }

        async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, GatewayError> {
            self.begin(GatewayCall::FetchAll { kind }).await?;
            Ok(self.records(kind))
        }

        async fn sync_batch(
            &self,
            operations: &[BatchOperation],
        ) -> Result<Vec<BatchResult>, GatewayError> {
            if !self.state().batch_supported {
                return Err(GatewayError::Unsupported("sync_batch".to_string()));
            }
            self.begin(GatewayCall::Batch {
                operations: operations.len(),
            })
            .await?;
            let mut state = self.state();
            Ok(operations
                .iter()
                .map(|op| {
                    let scripted = state
                        .batch_scripts
                        .iter()
                        .find(|(matches, _)| matches(op))
                        .map(|(_, outcome)| outcome.clone());
                    BatchResult {
                        op_id: op.op_id,
                        outcome: scripted.unwrap_or_else(|| state.apply_batch_op(op)),
                    }
                })
                .collect())
        }
    }
}

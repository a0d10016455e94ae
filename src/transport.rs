//! The network transport collaborator: posts a query and returns the `data`
//! field. The core never performs I/O itself; it calls through this trait.

use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::{HashMap, VecDeque};

use crate::error::TransportError;

/// One outgoing GraphQL request: printed query text plus variables.
#[derive(Debug, Clone)]
pub struct PostedQuery {
    pub body: String,
    pub variables: Json,
}

/// Posts a [`PostedQuery`] to the remote endpoint and returns its `data`
/// payload. A production implementation lives entirely outside this crate
/// (HTTP client, auth, retries); this trait is the sole seam.
#[async_trait]
pub trait PostQuery: Send + Sync {
    async fn post(&self, query: PostedQuery) -> Result<Json, TransportError>;
}

/// A reference in-memory transport for tests and the demo binary. Responses
/// are pre-registered by the top-level alias they should answer, as a FIFO
/// queue: `post` pops the next queued value for every top-level alias
/// present in the query text, which lets a single queued-up `Mirror::update`
/// call (which loops internally to convergence) walk through successive
/// pages of the same alias.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: std::sync::Mutex<HashMap<String, VecDeque<Json>>>,
    fail_next: std::sync::Mutex<Option<String>>,
    fail_at_call: std::sync::Mutex<Option<(usize, String)>>,
    call_count: std::sync::Mutex<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the JSON value to return for the given top-level alias the
    /// next time it appears in a query. Call it more than once for the same
    /// alias to model successive pages within one `update` call.
    pub fn set_response(&self, alias: impl Into<String>, data: Json) {
        self.responses
            .lock()
            .unwrap()
            .entry(alias.into())
            .or_default()
            .push_back(data);
    }

    /// Makes the next `post` call fail with `message`, instead of answering.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock().unwrap() = Some(message.into());
    }

    /// Makes the `call_index`-th call to `post` (1-based) fail with
    /// `message`, instead of answering, regardless of which aliases it
    /// carries. Useful to stop a `Mirror::update` call's internal
    /// loop-to-convergence partway through, e.g. to leave a just-discovered
    /// dependency deliberately unfetched for a test.
    pub fn fail_at_call(&self, call_index: usize, message: impl Into<String>) {
        *self.fail_at_call.lock().unwrap() = Some((call_index, message.into()));
    }
}

#[async_trait]
impl PostQuery for MockTransport {
    async fn post(&self, query: PostedQuery) -> Result<Json, TransportError> {
        let call_index = {
            let mut count = self.call_count.lock().unwrap();
            *count += 1;
            *count
        };

        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(TransportError::new(message));
        }
        {
            let mut fail_at_call = self.fail_at_call.lock().unwrap();
            if matches!(&*fail_at_call, Some((index, _)) if *index == call_index) {
                let (_, message) = fail_at_call.take().unwrap();
                return Err(TransportError::new(message));
            }
        }

        let mut data = serde_json::Map::new();
        let mut responses = self.responses.lock().unwrap();
        for alias in responses.keys().cloned().collect::<Vec<_>>() {
            if query.body.contains(&format!("{alias}:")) {
                if let Some(queue) = responses.get_mut(&alias) {
                    let is_empty = {
                        if let Some(value) = queue.pop_front() {
                            data.insert(alias.clone(), value);
                        }
                        queue.is_empty()
                    };
                    if is_empty {
                        responses.remove(&alias);
                    }
                }
            }
        }
        Ok(Json::Object(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn answers_registered_aliases_and_consumes_them() {
        let transport = MockTransport::new();
        transport.set_response("owndata_0", json!({"__typename": "Issue"}));

        let data = transport
            .post(PostedQuery {
                body: "query X { owndata_0: nodes(ids: [\"i1\"]) { id } }".to_string(),
                variables: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(data["owndata_0"]["__typename"], "Issue");

        let data = transport
            .post(PostedQuery {
                body: "query X { owndata_0: nodes(ids: [\"i1\"]) { id } }".to_string(),
                variables: json!({}),
            })
            .await
            .unwrap();
        assert!(data.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queues_successive_responses_for_the_same_alias() {
        let transport = MockTransport::new();
        transport.set_response("node_0", json!({"page": 1}));
        transport.set_response("node_0", json!({"page": 2}));

        let query = || PostedQuery {
            body: "query X { node_0: node(id: \"i1\") { id } }".to_string(),
            variables: json!({}),
        };

        let first = transport.post(query()).await.unwrap();
        assert_eq!(first["node_0"]["page"], 1);
        let second = transport.post(query()).await.unwrap();
        assert_eq!(second["node_0"]["page"], 2);
        let third = transport.post(query()).await.unwrap();
        assert!(third.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_at_call_only_fails_the_matching_call() {
        let transport = MockTransport::new();
        transport.set_response("a", json!(1));
        transport.set_response("a", json!(2));
        transport.fail_at_call(2, "second call blows up");

        let query = || PostedQuery {
            body: "query X { a: thing }".to_string(),
            variables: json!({}),
        };

        let first = transport.post(query()).await.unwrap();
        assert_eq!(first["a"], 1);
        let err = transport.post(query()).await.unwrap_err();
        assert_eq!(err.0, "second call blows up");
        let third = transport.post(query()).await.unwrap();
        assert_eq!(third["a"], 2);
    }

    #[tokio::test]
    async fn fail_next_propagates() {
        let transport = MockTransport::new();
        transport.fail_next("boom");
        let err = transport
            .post(PostedQuery {
                body: "query X { a }".to_string(),
                variables: json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.0, "boom");
    }
}

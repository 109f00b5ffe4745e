//! Message dispatch — the adapter trait the executor invokes at message
//! nodes. Transport, retries, and provider selection live behind the
//! adapter; the executor only sees typed outcomes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::Channel;

/// Typed dispatch failures. Retries, if any, are the adapter's concern.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchError {
    #[error("provider misconfigured: {0}")]
    ProviderMisconfigured(String),

    #[error("provider transient failure: {0}")]
    ProviderTransient(String),

    #[error("recipient invalid: {0}")]
    RecipientInvalid(String),

    /// The adapter declined the send because of the recipient's
    /// subscription state. Not a failure: the instance advances.
    #[error("skipped due to subscription state")]
    SkippedSubscriptionState,
}

/// A resolved send request for one message node traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub user_id: String,
    pub journey_id: Uuid,
    pub node_id: String,
    pub channel: Channel,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    /// Trait snapshot, present when the node requests property sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub provider_message_id: String,
}

pub trait MessageDispatcher: Send + Sync {
    fn send(&self, request: &MessageRequest) -> Result<DispatchReceipt, DispatchError>;
}

/// In-memory dispatcher that records requests and injects configured
/// failures, for tests.
#[derive(Default)]
pub struct CaptureDispatcher {
    sent: Mutex<Vec<MessageRequest>>,
    failure: Mutex<Option<DispatchError>>,
}

impl CaptureDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All sends that succeeded, until all sends fail via `set_failure`.
    pub fn sent(&self) -> Vec<MessageRequest> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Fail every subsequent send with the given error until cleared.
    pub fn set_failure(&self, error: Option<DispatchError>) {
        *self.failure.lock() = error;
    }
}

impl MessageDispatcher for CaptureDispatcher {
    fn send(&self, request: &MessageRequest) -> Result<DispatchReceipt, DispatchError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        self.sent.lock().push(request.clone());
        Ok(DispatchReceipt {
            provider_message_id: format!("msg-{}", Uuid::new_v4()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MessageRequest {
        MessageRequest {
            user_id: "u1".into(),
            journey_id: Uuid::new_v4(),
            node_id: "m1".into(),
            channel: Channel::Email,
            template_id: "tmpl-1".into(),
            provider_override: None,
            properties: None,
        }
    }

    #[test]
    fn test_capture_records_sends() {
        let dispatcher = CaptureDispatcher::new();
        dispatcher.send(&request()).unwrap();
        dispatcher.send(&request()).unwrap();
        assert_eq!(dispatcher.count(), 2);
        assert_eq!(dispatcher.sent()[0].template_id, "tmpl-1");
    }

    #[test]
    fn test_injected_failure() {
        let dispatcher = CaptureDispatcher::new();
        dispatcher.set_failure(Some(DispatchError::ProviderTransient("down".into())));
        let err = dispatcher.send(&request()).unwrap_err();
        assert!(matches!(err, DispatchError::ProviderTransient(_)));
        assert_eq!(dispatcher.count(), 0);

        dispatcher.set_failure(None);
        dispatcher.send(&request()).unwrap();
        assert_eq!(dispatcher.count(), 1);
    }
}

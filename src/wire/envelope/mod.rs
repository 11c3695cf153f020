use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ACTION_CONNECT: &str = "CONN";
pub const ACTION_SEND: &str = "SEND";
pub const ACTION_RECEIVE: &str = "RECEIVE";
pub const ACTION_PUT: &str = "PUT";
pub const ACTION_GET: &str = "GET";
pub const ACTION_DISCONNECT: &str = "DISC";
pub const ACTION_HELLO: &str = "HELLO";

// Reserved failure message meaning "the caller cancelled", never produced by a backend.
pub const ABORT_MESSAGE: &str = "abort";

pub type Metadata = Map<String, Value>;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(transparent)]
pub struct AsyncMessageContext(Map<String, Value>);

impl AsyncMessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.get_str("url")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    // Accepts both numbers and numeric strings, since contexts are often templated text.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AsyncMessageRequest {
    pub action: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default)]
    pub context: AsyncMessageContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl AsyncMessageRequest {
    pub fn new(action: impl Into<String>, context: AsyncMessageContext) -> Self {
        Self {
            action: action.into(),
            request_id: String::new(),
            worker: None,
            context,
            payload: None,
        }
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AsyncMessageResponse {
    pub success: bool,
    pub worker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub response_time: u64,
    #[serde(default)]
    pub response_length: Option<u64>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl AsyncMessageResponse {
    pub fn success(worker: impl Into<String>) -> Self {
        Self {
            success: true,
            worker: worker.into(),
            request_id: None,
            message: None,
            response_time: 0,
            response_length: None,
            payload: None,
            metadata: None,
        }
    }

    pub fn failure(worker: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::success(worker)
        }
    }

    pub fn aborted(worker: impl Into<String>) -> Self {
        Self::failure(worker, ABORT_MESSAGE)
    }

    pub fn for_request(mut self, request_id: &str) -> Self {
        if !request_id.is_empty() {
            self.request_id = Some(request_id.to_owned());
        }
        self
    }

    pub fn with_response_time(mut self, response_time: u64) -> Self {
        self.response_time = response_time;
        self
    }

    pub fn is_abort(&self) -> bool {
        !self.success && self.message.as_deref() == Some(ABORT_MESSAGE)
    }
}

pub fn scheme_of(url: &str) -> &str {
    url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{scheme_of, AsyncMessageContext, AsyncMessageRequest, AsyncMessageResponse};

    #[test]
    fn first_request_of_a_session_has_no_worker() {
        let request: AsyncMessageRequest = serde_json::from_value(json!({
            "action": "CONN",
            "request_id": "r-1",
            "context": {"url": "mq://host"}
        }))
        .expect("request should parse");

        assert_eq!(request.worker, None);
        assert_eq!(request.payload, None);
        assert_eq!(request.context.url(), Some("mq://host"));

        let rendered = serde_json::to_value(&request).expect("request should serialize");
        assert!(rendered.get("worker").is_none());
    }

    #[test]
    fn response_serializes_nullable_fields_as_null() {
        let response = AsyncMessageResponse::failure("w-1", "boom").with_response_time(12);
        let rendered = serde_json::to_value(&response).expect("response should serialize");

        assert_eq!(
            rendered,
            json!({
                "success": false,
                "worker": "w-1",
                "message": "boom",
                "response_time": 12,
                "response_length": null,
                "payload": null,
                "metadata": null
            })
        );
    }

    #[test]
    fn context_reads_numbers_from_strings() {
        let context = AsyncMessageContext::new()
            .with("message_wait", "2.5")
            .with("heartbeat_interval", 300)
            .with("empty", "");

        assert_eq!(context.get_f64("message_wait"), Some(2.5));
        assert_eq!(context.get_f64("heartbeat_interval"), Some(300.0));
        assert_eq!(context.get_str("empty"), None);
    }

    #[test]
    fn scheme_is_text_before_separator() {
        assert_eq!(scheme_of("mq://host:1414/?QueueManager=QM1"), "mq");
        assert_eq!(scheme_of("sb://ns.servicebus.windows.net/"), "sb");
        assert_eq!(scheme_of("no-separator"), "");
    }

    #[test]
    fn only_failed_abort_is_abort() {
        assert!(AsyncMessageResponse::aborted("w").is_abort());

        let mut succeeded = AsyncMessageResponse::success("w");
        succeeded.message = Some("abort".to_owned());
        assert!(!succeeded.is_abort());
    }
}

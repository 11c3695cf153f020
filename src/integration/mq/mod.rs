use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Map, Value};

use super::driver::{BackendConnection, BackendDriver, BackendTarget, DriverError};
use super::{
    ensure_no_payload, message_wait, payload_bytes, ActionHandler, ActionOutcome, HandlerTable,
    IntegrationError, IntegrationHandler,
};
use crate::wire::codec::MAX_FRAME_SIZE_BYTES;
use crate::wire::envelope::{
    AsyncMessageRequest, ACTION_CONNECT, ACTION_DISCONNECT, ACTION_GET, ACTION_PUT, ACTION_RECEIVE,
    ACTION_SEND,
};

pub mod rfh2;

use rfh2::{is_rfh2, Rfh2Encoder, Rfh2Message, GZIP_ENCODING};

pub const SCHEMES: [&str; 2] = ["mq", "mqs"];
pub const DEFAULT_PORT: u16 = 1414;

const HEADER_TYPE_RFH2: &str = "rfh2";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueManagerUrl {
    pub secure: bool,
    pub username: Option<String>,
    pub host: String,
    pub port: u16,
    pub queue_manager: String,
    pub channel: String,
}

impl QueueManagerUrl {
    pub fn parse(url: &str) -> Result<Self, IntegrationError> {
        let invalid = |reason: &str| IntegrationError::InvalidUrl {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let secure = match scheme {
            "mq" => false,
            "mqs" => true,
            _ => return Err(invalid("scheme must be mq or mqs")),
        };

        let (authority, tail) = rest.split_once('/').unwrap_or((rest, ""));
        let (username, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user.to_owned()), host_port),
            Some((_, host_port)) => (None, host_port),
            None => (None, authority),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
                (host, port)
            }
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("no host"));
        }

        let query = tail.split_once('?').map(|(_, query)| query).unwrap_or("");
        let mut queue_manager = None;
        let mut channel = None;
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            match pair.split_once('=') {
                Some(("QueueManager", value)) if !value.is_empty() => {
                    queue_manager = Some(value.to_owned())
                }
                Some(("Channel", value)) if !value.is_empty() => channel = Some(value.to_owned()),
                _ => {}
            }
        }

        Ok(Self {
            secure,
            username,
            host: host.to_owned(),
            port,
            queue_manager: queue_manager
                .ok_or_else(|| invalid("QueueManager must be in the query string"))?,
            channel: channel.ok_or_else(|| invalid("Channel must be in the query string"))?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderType {
    Rfh2,
}

fn header_type(request: &AsyncMessageRequest) -> Result<Option<HeaderType>, IntegrationError> {
    match request.context.get_str("header_type") {
        None => Ok(None),
        Some(raw) if raw.eq_ignore_ascii_case(HEADER_TYPE_RFH2) => Ok(Some(HeaderType::Rfh2)),
        Some(other) => Err(IntegrationError::InvalidContext {
            key: "header_type",
            reason: format!("{other} is not implemented"),
        }),
    }
}

fn queue_name(request: &AsyncMessageRequest) -> Result<String, IntegrationError> {
    let endpoint = request
        .context
        .get_str("endpoint")
        .ok_or(IntegrationError::MissingContext { key: "endpoint" })?;

    match endpoint.split_once(':') {
        Some((kind, name)) if kind.trim() == "queue" && !name.trim().is_empty() => {
            Ok(name.trim().to_owned())
        }
        _ => Err(IntegrationError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            reason: "expected queue:<name>".to_owned(),
        }),
    }
}

fn handlers() -> &'static HandlerTable<QueueManagerHandler> {
    static HANDLERS: OnceLock<HandlerTable<QueueManagerHandler>> = OnceLock::new();
    HANDLERS.get_or_init(|| {
        let mut table = HandlerTable::new();
        table.register(ACTION_CONNECT, QueueManagerHandler::connect);
        table.register(ACTION_PUT, QueueManagerHandler::put);
        table.register(ACTION_SEND, QueueManagerHandler::put);
        table.register(ACTION_GET, QueueManagerHandler::get);
        table.register(ACTION_RECEIVE, QueueManagerHandler::get);
        table.register(ACTION_DISCONNECT, QueueManagerHandler::disconnect);
        table
    })
}

// One queue manager connection, owned by exactly one worker.
pub struct QueueManagerHandler {
    worker: String,
    driver: Arc<dyn BackendDriver>,
    connection: Option<Box<dyn BackendConnection>>,
    message_wait: Duration,
    max_payload_bytes: usize,
    usable: bool,
}

impl QueueManagerHandler {
    pub fn new(worker: &str, driver: Arc<dyn BackendDriver>) -> Self {
        Self {
            worker: worker.to_owned(),
            driver,
            connection: None,
            message_wait: Duration::ZERO,
            max_payload_bytes: MAX_FRAME_SIZE_BYTES,
            usable: true,
        }
    }

    // Received bodies larger than this (after gunzip) are refused.
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn connect(
        &mut self,
        request: &AsyncMessageRequest,
    ) -> Result<ActionOutcome, IntegrationError> {
        if self.connection.is_some() {
            return Ok(ActionOutcome::message("re-used connection"));
        }

        let url = request
            .context
            .url()
            .ok_or(IntegrationError::MissingContext { key: "url" })?;
        let parsed = QueueManagerUrl::parse(url)?;
        header_type(request)?;
        let wait = message_wait(request, Duration::ZERO)?;

        let mut target = BackendTarget::new(parsed.queue_manager.clone())
            .with_property("host", parsed.host.clone())
            .with_property("port", parsed.port.to_string())
            .with_property("channel", parsed.channel.clone());
        let username = request
            .context
            .get_str("username")
            .map(str::to_owned)
            .or(parsed.username.clone());
        if let Some(username) = username {
            target = target.with_property("username", username);
        }
        if let Some(password) = request.context.get_str("password") {
            target = target.with_property("password", password);
        }

        if parsed.secure {
            let key_file = request
                .context
                .get_str("key_file")
                .ok_or(IntegrationError::MissingContext { key: "key_file" })?;
            target = target.with_property("key_file", key_file);
            for key in ["cert_label", "ssl_cipher"] {
                if let Some(value) = request.context.get_str(key) {
                    target = target.with_property(key, value);
                }
            }
        }

        let connection = self.driver.connect(&target).map_err(|error| self.track(error))?;
        self.connection = Some(connection);
        self.message_wait = wait;

        Ok(ActionOutcome::message("connected"))
    }

    fn put(&mut self, request: &AsyncMessageRequest) -> Result<ActionOutcome, IntegrationError> {
        self.ensure_connected()?;
        let payload = payload_bytes(request)?;
        let queue = queue_name(request)?;

        let body = match header_type(request)? {
            Some(HeaderType::Rfh2) => {
                Rfh2Encoder::new(&payload, &queue, GZIP_ENCODING, None)?.encode()
            }
            None => payload,
        };
        let response_length = body.len() as u64;

        let result = match self.connection.as_mut() {
            Some(connection) => connection.put(&queue, body),
            None => return Err(IntegrationError::NotConnected),
        };
        let message_id = result.map_err(|error| self.track(error))?;

        Ok(ActionOutcome {
            payload: request.payload.clone(),
            metadata: Some(message_metadata(&message_id, &queue)),
            response_length: Some(response_length),
            ..ActionOutcome::default()
        })
    }

    fn get(&mut self, request: &AsyncMessageRequest) -> Result<ActionOutcome, IntegrationError> {
        self.ensure_connected()?;
        ensure_no_payload(request)?;
        header_type(request)?;
        let queue = queue_name(request)?;
        let wait = message_wait(request, self.message_wait)?;

        let result = match self.connection.as_mut() {
            Some(connection) => connection.get(&queue, wait),
            None => return Err(IntegrationError::NotConnected),
        };
        let message = result
            .map_err(|error| self.track(error))?
            .ok_or_else(|| IntegrationError::NoMessage {
                endpoint: format!("queue:{queue}"),
            })?;

        let response_length = message.body.len() as u64;
        let payload = if is_rfh2(&message.body) {
            Rfh2Message::decode(&message.body)?.payload(self.max_payload_bytes)?
        } else {
            message.body
        };

        Ok(ActionOutcome {
            payload: Some(Value::String(String::from_utf8_lossy(&payload).into_owned())),
            metadata: Some(message_metadata(&message.id, &queue)),
            response_length: Some(response_length),
            ..ActionOutcome::default()
        })
    }

    fn disconnect(
        &mut self,
        _request: &AsyncMessageRequest,
    ) -> Result<ActionOutcome, IntegrationError> {
        let mut connection = self.connection.take().ok_or(IntegrationError::NotConnected)?;
        connection.close().map_err(|error| self.track(error))?;
        Ok(ActionOutcome::message("disconnected"))
    }

    fn ensure_connected(&self) -> Result<(), IntegrationError> {
        if self.connection.is_none() {
            return Err(IntegrationError::NotConnected);
        }
        Ok(())
    }

    fn track(&mut self, error: DriverError) -> IntegrationError {
        if error.is_fatal() {
            self.usable = false;
        }
        IntegrationError::Driver(error)
    }
}

fn message_metadata(message_id: &str, queue: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("message_id".to_owned(), Value::String(message_id.to_owned()));
    metadata.insert("queue".to_owned(), Value::String(queue.to_owned()));
    metadata
}

impl IntegrationHandler for QueueManagerHandler {
    fn worker(&self) -> &str {
        &self.worker
    }

    fn get_handler(&self, action: &str) -> Option<ActionHandler<Self>> {
        handlers().get(action)
    }

    fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close();
        }
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{rfh2, QueueManagerHandler, QueueManagerUrl};
    use crate::integration::driver::MemoryBackend;
    use crate::integration::{handle, IntegrationHandler};
    use crate::wire::envelope::{AsyncMessageContext, AsyncMessageRequest};

    const URL: &str = "mq://mq.example.com:1415/?QueueManager=QM1&Channel=SYS.CONN";

    fn handler(backend: &MemoryBackend) -> QueueManagerHandler {
        QueueManagerHandler::new("w-mq", Arc::new(backend.clone()))
    }

    fn request(action: &str, context: AsyncMessageContext) -> AsyncMessageRequest {
        AsyncMessageRequest::new(action, context.with("url", URL)).with_worker("w-mq")
    }

    fn connected(backend: &MemoryBackend) -> QueueManagerHandler {
        let mut handler = handler(backend);
        let response = handle(&mut handler, &request("CONN", AsyncMessageContext::new()));
        assert!(response.success, "{:?}", response.message);
        handler
    }

    #[test]
    fn parses_queue_manager_urls() {
        let url = "mqs://alice@mq.example.com/?QueueManager=QM1&Channel=CH";
        let parsed = QueueManagerUrl::parse(url)
            .expect("url should parse");

        assert!(parsed.secure);
        assert_eq!(parsed.username.as_deref(), Some("alice"));
        assert_eq!(parsed.host, "mq.example.com");
        assert_eq!(parsed.port, 1414);
        assert_eq!(parsed.queue_manager, "QM1");
        assert_eq!(parsed.channel, "CH");

        let missing = QueueManagerUrl::parse("mq://mq.example.com:1414/?Channel=CH")
            .expect_err("queue manager is required");
        assert!(missing.to_string().contains("QueueManager"));
    }

    #[test]
    fn second_connect_reuses_connection() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);

        let response = handle(&mut handler, &request("CONN", AsyncMessageContext::new()));

        assert!(response.success);
        assert_eq!(response.message.as_deref(), Some("re-used connection"));
        assert_eq!(backend.connections_opened(), 1);
    }

    #[test]
    fn actions_before_connect_fail() {
        let backend = MemoryBackend::new();
        let mut handler = handler(&backend);

        for action in ["PUT", "GET", "DISC"] {
            let response = handle(
                &mut handler,
                &request(action, AsyncMessageContext::new().with("endpoint", "queue:IN")),
            );
            assert!(!response.success);
            assert_eq!(response.message.as_deref(), Some("not connected"));
        }
    }

    #[test]
    fn put_then_get_round_trips_plain_payloads() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);
        let context = AsyncMessageContext::new().with("endpoint", "queue:ORDERS");

        let put = handle(&mut handler, &request("PUT", context.clone()).with_payload("hello"));
        assert!(put.success, "{:?}", put.message);
        assert_eq!(put.response_length, Some(5));
        assert_eq!(backend.depth("QM1", "ORDERS"), 1);

        let get = handle(&mut handler, &request("GET", context));
        assert!(get.success, "{:?}", get.message);
        assert_eq!(get.payload, Some(json!("hello")));
        let metadata = get.metadata.expect("metadata should be set");
        assert_eq!(metadata.get("queue"), Some(&json!("ORDERS")));
        assert!(metadata.get("message_id").is_some());
    }

    #[test]
    fn rfh2_put_is_framed_and_get_unframes_it() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);
        let context = AsyncMessageContext::new()
            .with("endpoint", "queue:ORDERS")
            .with("header_type", "rfh2");

        let put = handle(&mut handler, &request("SEND", context.clone()).with_payload("<doc/>"));
        assert!(put.success, "{:?}", put.message);

        let stored = backend.take("QM1", "ORDERS").expect("message should be stored");
        assert!(rfh2::is_rfh2(&stored.body));
        assert_eq!(put.response_length, Some(stored.body.len() as u64));
        backend.enqueue("QM1", "ORDERS", stored.body);

        let plain_context = AsyncMessageContext::new().with("endpoint", "queue:ORDERS");
        let get = handle(&mut handler, &request("RECEIVE", plain_context));
        assert!(get.success, "{:?}", get.message);
        assert_eq!(get.payload, Some(json!("<doc/>")));
    }

    #[test]
    fn oversized_gzip_body_is_refused_without_breaking_the_connection() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend).with_max_payload_bytes(100);
        let framed = rfh2::Rfh2Encoder::new(&[b'a'; 1_000], "ORDERS", "gzip", None)
            .expect("gzip encoder should build")
            .encode();
        backend.enqueue("QM1", "ORDERS", framed);

        let context = AsyncMessageContext::new().with("endpoint", "queue:ORDERS");
        let get = handle(&mut handler, &request("GET", context));

        assert!(!get.success);
        assert_eq!(
            get.message.as_deref(),
            Some("gunzipped RFH2 body exceeds 100 bytes")
        );
        assert!(handler.is_usable());
    }

    #[test]
    fn empty_queue_reports_endpoint() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);

        let response = handle(
            &mut handler,
            &request("GET", AsyncMessageContext::new().with("endpoint", "queue:EMPTY")),
        );

        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("no message on queue:EMPTY"));
    }

    #[test]
    fn payload_rules_are_enforced() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);
        let context = AsyncMessageContext::new().with("endpoint", "queue:IN");

        let put = handle(&mut handler, &request("PUT", context.clone()));
        assert_eq!(put.message.as_deref(), Some("no payload"));

        let get = handle(&mut handler, &request("GET", context).with_payload("x"));
        assert_eq!(get.message.as_deref(), Some("payload not allowed"));
    }

    #[test]
    fn unknown_header_type_is_rejected() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);

        let response = handle(
            &mut handler,
            &request(
                "PUT",
                AsyncMessageContext::new()
                    .with("endpoint", "queue:IN")
                    .with("header_type", "mqmd"),
            )
            .with_payload("x"),
        );

        assert!(!response.success);
        assert_eq!(
            response.message.as_deref(),
            Some("invalid header_type: mqmd is not implemented")
        );
    }

    #[test]
    fn secure_scheme_requires_key_file() {
        let backend = MemoryBackend::new();
        let mut handler = handler(&backend);
        let request = AsyncMessageRequest::new(
            "CONN",
            AsyncMessageContext::new()
                .with("url", "mqs://mq.example.com/?QueueManager=QM1&Channel=CH"),
        );

        let response = handle(&mut handler, &request);

        assert!(!response.success);
        assert_eq!(
            response.message.as_deref(),
            Some("no key_file found in request context")
        );
        assert_eq!(backend.connections_opened(), 0);
    }

    #[test]
    fn broken_connection_makes_handler_unusable() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);
        backend.sever();

        let response = handle(
            &mut handler,
            &request("PUT", AsyncMessageContext::new().with("endpoint", "queue:IN"))
                .with_payload("x"),
        );

        assert!(!response.success);
        assert!(!handler.is_usable());
    }

    #[test]
    fn disconnect_then_connect_opens_a_new_connection() {
        let backend = MemoryBackend::new();
        let mut handler = connected(&backend);

        let disc = handle(&mut handler, &request("DISC", AsyncMessageContext::new()));
        assert_eq!(disc.message.as_deref(), Some("disconnected"));
        assert!(!handler.is_connected());

        let conn = handle(&mut handler, &request("CONN", AsyncMessageContext::new()));
        assert_eq!(conn.message.as_deref(), Some("connected"));
        assert_eq!(backend.connections_opened(), 2);
    }
}

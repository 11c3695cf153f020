use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Map, Value};

use super::driver::{BackendConnection, BackendDriver, BackendTarget, DriverError};
use super::{
    ensure_no_payload, message_wait, payload_bytes, ActionHandler, ActionOutcome, HandlerTable,
    IntegrationError, IntegrationHandler,
};
use crate::wire::envelope::{
    AsyncMessageRequest, ACTION_CONNECT, ACTION_DISCONNECT, ACTION_HELLO, ACTION_RECEIVE,
    ACTION_SEND,
};

pub const SCHEMES: [&str; 1] = ["sb"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceBusUrl {
    pub namespace: String,
    pub key_name: String,
    pub key: String,
}

impl ServiceBusUrl {
    pub fn parse(url: &str) -> Result<Self, IntegrationError> {
        let invalid = |reason: &str| IntegrationError::InvalidUrl {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };

        let rest = url
            .strip_prefix("sb://")
            .ok_or_else(|| invalid("scheme must be sb"))?;
        let mut parts = rest.split(';');
        let namespace = parts.next().unwrap_or("").trim_end_matches('/');
        if namespace.is_empty() {
            return Err(invalid("no namespace"));
        }

        let mut key_name = None;
        let mut key = None;
        for part in parts.filter(|part| !part.is_empty()) {
            match part.split_once('=') {
                Some(("SharedAccessKeyName", value)) if !value.is_empty() => key_name = Some(value),
                Some(("SharedAccessKey", value)) if !value.is_empty() => key = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            namespace: namespace.to_owned(),
            key_name: key_name
                .ok_or_else(|| invalid("SharedAccessKeyName must be in the url"))?
                .to_owned(),
            key: key
                .ok_or_else(|| invalid("SharedAccessKey must be in the url"))?
                .to_owned(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Queue(String),
    Topic { topic: String, subscription: Option<String> },
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, IntegrationError> {
        let invalid = |reason: &str| IntegrationError::InvalidEndpoint {
            endpoint: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let mut queue = None;
        let mut topic = None;
        let mut subscription = None;
        for part in raw.split(',') {
            let (kind, name) = part
                .split_once(':')
                .ok_or_else(|| invalid("expected <kind>:<name>"))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid("empty name"));
            }
            match kind.trim() {
                "queue" => queue = Some(name.to_owned()),
                "topic" => topic = Some(name.to_owned()),
                "subscription" => subscription = Some(name.to_owned()),
                other => return Err(invalid(&format!("unknown kind {other}"))),
            }
        }

        match (queue, topic) {
            (Some(queue), None) if subscription.is_none() => Ok(Self::Queue(queue)),
            (None, Some(topic)) => Ok(Self::Topic { topic, subscription }),
            _ => Err(invalid("expected queue:<name> or topic:<name>, subscription:<name>")),
        }
    }

    fn destination(&self, link: LinkKind) -> Result<String, IntegrationError> {
        match (self, link) {
            (Self::Queue(queue), _) => Ok(queue.clone()),
            (Self::Topic { topic, .. }, LinkKind::Sender) => Ok(topic.clone()),
            (Self::Topic { topic, subscription: Some(subscription) }, LinkKind::Receiver) => {
                Ok(format!("{topic}/subscriptions/{subscription}"))
            }
            (Self::Topic { .. }, LinkKind::Receiver) => Err(IntegrationError::InvalidEndpoint {
                endpoint: self.to_string(),
                reason: "receiving from a topic needs a subscription".to_owned(),
            }),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(queue) => write!(f, "queue:{queue}"),
            Self::Topic {
                topic,
                subscription: Some(subscription),
            } => write!(f, "topic:{topic}, subscription:{subscription}"),
            Self::Topic { topic, .. } => write!(f, "topic:{topic}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum LinkKind {
    Sender,
    Receiver,
}

impl LinkKind {
    fn from_request(request: &AsyncMessageRequest) -> Result<Self, IntegrationError> {
        match request.context.get_str("connection") {
            Some("sender") => Ok(Self::Sender),
            Some("receiver") => Ok(Self::Receiver),
            Some(other) => Err(IntegrationError::InvalidContext {
                key: "connection",
                reason: format!("{other} is neither sender nor receiver"),
            }),
            None => Err(IntegrationError::MissingContext { key: "connection" }),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
        }
    }
}

fn endpoint(request: &AsyncMessageRequest) -> Result<Endpoint, IntegrationError> {
    let raw = request
        .context
        .get_str("endpoint")
        .ok_or(IntegrationError::MissingContext { key: "endpoint" })?;
    Endpoint::parse(raw)
}

fn handlers() -> &'static HandlerTable<ServiceBusHandler> {
    static HANDLERS: OnceLock<HandlerTable<ServiceBusHandler>> = OnceLock::new();
    HANDLERS.get_or_init(|| {
        let mut table = HandlerTable::new();
        table.register(ACTION_HELLO, ServiceBusHandler::hello);
        table.register(ACTION_CONNECT, ServiceBusHandler::connect);
        table.register(ACTION_DISCONNECT, ServiceBusHandler::disconnect);
        table.register(ACTION_SEND, ServiceBusHandler::send);
        table.register(ACTION_RECEIVE, ServiceBusHandler::receive);
        table
    })
}

struct Link {
    destination: String,
    message_wait: Duration,
}

// Namespace connection shared by every sender/receiver link the owning worker opened.
pub struct ServiceBusHandler {
    worker: String,
    driver: Arc<dyn BackendDriver>,
    namespace: Option<String>,
    connection: Option<Box<dyn BackendConnection>>,
    links: HashMap<(LinkKind, Endpoint), Link>,
    usable: bool,
}

impl ServiceBusHandler {
    pub fn new(worker: &str, driver: Arc<dyn BackendDriver>) -> Self {
        Self {
            worker: worker.to_owned(),
            driver,
            namespace: None,
            connection: None,
            links: HashMap::new(),
            usable: true,
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    fn hello(&mut self, _request: &AsyncMessageRequest) -> Result<ActionOutcome, IntegrationError> {
        Ok(ActionOutcome::message("ready"))
    }

    fn connect(
        &mut self,
        request: &AsyncMessageRequest,
    ) -> Result<ActionOutcome, IntegrationError> {
        let url = request
            .context
            .url()
            .ok_or(IntegrationError::MissingContext { key: "url" })?;
        let parsed = ServiceBusUrl::parse(url)?;
        let endpoint = endpoint(request)?;
        let kind = LinkKind::from_request(request)?;
        let destination = endpoint.destination(kind)?;
        let wait = message_wait(request, Duration::ZERO)?;

        if let Some(namespace) = &self.namespace {
            if *namespace != parsed.namespace {
                return Err(IntegrationError::InvalidUrl {
                    url: url.to_owned(),
                    reason: format!("already connected to {namespace}"),
                });
            }
        }
        let key = (kind, endpoint);
        if self.links.contains_key(&key) {
            return Ok(ActionOutcome::message(format!("re-used {} link", kind.as_str())));
        }

        if self.connection.is_none() {
            let target = BackendTarget::new(parsed.namespace.clone())
                .with_property("key_name", parsed.key_name)
                .with_property("key", parsed.key);
            let connection = self.driver.connect(&target).map_err(|error| self.track(error))?;
            self.connection = Some(connection);
            self.namespace = Some(parsed.namespace);
        }

        if kind == LinkKind::Receiver {
            let result = match self.connection.as_mut() {
                Some(connection) => connection.declare(&destination),
                None => return Err(IntegrationError::NotConnected),
            };
            result.map_err(|error| self.track(error))?;
        }

        let message = format!("connected {} to {}", kind.as_str(), key.1);
        self.links.insert(
            key,
            Link {
                destination,
                message_wait: wait,
            },
        );
        Ok(ActionOutcome::message(message))
    }

    fn disconnect(
        &mut self,
        request: &AsyncMessageRequest,
    ) -> Result<ActionOutcome, IntegrationError> {
        let endpoint = endpoint(request)?;
        let kind = LinkKind::from_request(request)?;
        if self.links.remove(&(kind, endpoint.clone())).is_none() {
            return Err(IntegrationError::LinkNotConnected {
                link: kind.as_str(),
                endpoint: endpoint.to_string(),
            });
        }

        if self.links.is_empty() {
            self.namespace = None;
            if let Some(mut connection) = self.connection.take() {
                connection.close().map_err(|error| self.track(error))?;
            }
        }

        Ok(ActionOutcome::message(format!(
            "disconnected {} from {endpoint}",
            kind.as_str()
        )))
    }

    fn send(&mut self, request: &AsyncMessageRequest) -> Result<ActionOutcome, IntegrationError> {
        let endpoint = endpoint(request)?;
        let destination = self.link(LinkKind::Sender, &endpoint)?.destination.clone();
        let body = payload_bytes(request)?;
        let response_length = body.len() as u64;

        let result = match self.connection.as_mut() {
            Some(connection) => connection.put(&destination, body),
            None => return Err(IntegrationError::NotConnected),
        };
        let message_id = result.map_err(|error| self.track(error))?;

        Ok(ActionOutcome {
            payload: request.payload.clone(),
            metadata: Some(message_metadata(&message_id, &endpoint)),
            response_length: Some(response_length),
            ..ActionOutcome::default()
        })
    }

    fn receive(
        &mut self,
        request: &AsyncMessageRequest,
    ) -> Result<ActionOutcome, IntegrationError> {
        ensure_no_payload(request)?;
        let endpoint = endpoint(request)?;
        let link = self.link(LinkKind::Receiver, &endpoint)?;
        let destination = link.destination.clone();
        let wait = message_wait(request, link.message_wait)?;

        let result = match self.connection.as_mut() {
            Some(connection) => connection.get(&destination, wait),
            None => return Err(IntegrationError::NotConnected),
        };
        let message = result
            .map_err(|error| self.track(error))?
            .ok_or_else(|| IntegrationError::NoMessage {
                endpoint: endpoint.to_string(),
            })?;

        Ok(ActionOutcome {
            response_length: Some(message.body.len() as u64),
            payload: Some(Value::String(String::from_utf8_lossy(&message.body).into_owned())),
            metadata: Some(message_metadata(&message.id, &endpoint)),
            ..ActionOutcome::default()
        })
    }

    fn link(&self, kind: LinkKind, endpoint: &Endpoint) -> Result<&Link, IntegrationError> {
        self.links
            .get(&(kind, endpoint.clone()))
            .ok_or_else(|| IntegrationError::LinkNotConnected {
                link: kind.as_str(),
                endpoint: endpoint.to_string(),
            })
    }

    fn track(&mut self, error: DriverError) -> IntegrationError {
        if error.is_fatal() {
            self.usable = false;
        }
        IntegrationError::Driver(error)
    }
}

fn message_metadata(message_id: &str, endpoint: &Endpoint) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("message_id".to_owned(), Value::String(message_id.to_owned()));
    metadata.insert("endpoint".to_owned(), Value::String(endpoint.to_string()));
    metadata
}

impl IntegrationHandler for ServiceBusHandler {
    fn worker(&self) -> &str {
        &self.worker
    }

    fn get_handler(&self, action: &str) -> Option<ActionHandler<Self>> {
        handlers().get(action)
    }

    fn close(&mut self) {
        self.links.clear();
        self.namespace = None;
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close();
        }
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::wire::codec::MAX_FRAME_SIZE_BYTES;
use crate::wire::envelope::{AsyncMessageRequest, AsyncMessageResponse, Metadata};

pub mod driver;
pub mod mq;
pub mod sb;

use driver::{BackendDrivers, DriverError};
use mq::rfh2::FramingError;
use mq::QueueManagerHandler;
use sb::ServiceBusHandler;

pub type ActionHandler<H> =
    fn(&mut H, &AsyncMessageRequest) -> Result<ActionOutcome, IntegrationError>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionOutcome {
    pub message: Option<String>,
    pub payload: Option<Value>,
    pub metadata: Option<Metadata>,
    pub response_length: Option<u64>,
}

impl ActionOutcome {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub enum IntegrationError {
    NoImplementation { action: String },
    MissingContext { key: &'static str },
    InvalidContext { key: &'static str, reason: String },
    InvalidUrl { url: String, reason: String },
    InvalidEndpoint { endpoint: String, reason: String },
    NotConnected,
    LinkNotConnected { link: &'static str, endpoint: String },
    PayloadRequired,
    PayloadNotAllowed,
    NoMessage { endpoint: String },
    Driver(DriverError),
    Framing(FramingError),
}

impl IntegrationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Driver(error) if error.is_fatal())
    }
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoImplementation { action } => write!(f, "no implementation for {action}"),
            Self::MissingContext { key } => write!(f, "no {key} found in request context"),
            Self::InvalidContext { key, reason } => write!(f, "invalid {key}: {reason}"),
            Self::InvalidUrl { url, reason } => write!(f, "invalid url {url}: {reason}"),
            Self::InvalidEndpoint { endpoint, reason } => {
                write!(f, "invalid endpoint {endpoint}: {reason}")
            }
            Self::NotConnected => write!(f, "not connected"),
            Self::LinkNotConnected { link, endpoint } => {
                write!(f, "no {link} connected to {endpoint}")
            }
            Self::PayloadRequired => write!(f, "no payload"),
            Self::PayloadNotAllowed => write!(f, "payload not allowed"),
            Self::NoMessage { endpoint } => write!(f, "no message on {endpoint}"),
            Self::Driver(source) => write!(f, "{source}"),
            Self::Framing(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for IntegrationError {}

impl From<DriverError> for IntegrationError {
    fn from(value: DriverError) -> Self {
        Self::Driver(value)
    }
}

impl From<FramingError> for IntegrationError {
    fn from(value: FramingError) -> Self {
        Self::Framing(value)
    }
}

// Action name -> handler. Built once per family; the first registration of a name wins.
pub struct HandlerTable<H> {
    handlers: HashMap<&'static str, ActionHandler<H>>,
}

impl<H> Default for HandlerTable<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<H> HandlerTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns false (and keeps the existing handler) when `action` is already taken.
    pub fn register(&mut self, action: &'static str, handler: ActionHandler<H>) -> bool {
        if self.handlers.contains_key(action) {
            return false;
        }
        self.handlers.insert(action, handler);
        true
    }

    pub fn get(&self, action: &str) -> Option<ActionHandler<H>> {
        self.handlers.get(action).copied()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<&'static str> = self.handlers.keys().copied().collect();
        actions.sort_unstable();
        actions
    }
}

pub trait IntegrationHandler: Send + Sized + 'static {
    fn worker(&self) -> &str;

    fn get_handler(&self, action: &str) -> Option<ActionHandler<Self>>;

    // Releases the backend connection; called once when the owning worker stops.
    fn close(&mut self);

    fn is_usable(&self) -> bool {
        true
    }
}

pub fn handle<H: IntegrationHandler>(
    handler: &mut H,
    request: &AsyncMessageRequest,
) -> AsyncMessageResponse {
    let started_at = Instant::now();
    let action = request.action.as_str();

    let response = match handler.get_handler(action) {
        None => {
            let missing = IntegrationError::NoImplementation {
                action: action.to_owned(),
            };
            AsyncMessageResponse::failure(
                handler.worker(),
                format!("{action}: AsyncMessageError=\"{missing}\""),
            )
        }
        Some(action_handler) => match action_handler(handler, request) {
            Ok(outcome) => AsyncMessageResponse {
                message: outcome.message,
                payload: outcome.payload,
                metadata: outcome.metadata,
                response_length: outcome.response_length,
                ..AsyncMessageResponse::success(handler.worker())
            },
            Err(error) => AsyncMessageResponse::failure(handler.worker(), error.to_string()),
        },
    };

    response
        .for_request(&request.request_id)
        .with_response_time(elapsed_ms(started_at))
}

pub fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// Object-safe face of an integration handler, as owned by a worker.
pub trait Integration: Send {
    fn handle(&mut self, request: &AsyncMessageRequest) -> AsyncMessageResponse;
    fn close(&mut self);
    fn is_usable(&self) -> bool;
}

impl<H: IntegrationHandler> Integration for H {
    fn handle(&mut self, request: &AsyncMessageRequest) -> AsyncMessageResponse {
        handle(self, request)
    }

    fn close(&mut self) {
        IntegrationHandler::close(self);
    }

    fn is_usable(&self) -> bool {
        IntegrationHandler::is_usable(self)
    }
}

pub type IntegrationFactory = Arc<dyn Fn(&str) -> Box<dyn Integration> + Send + Sync>;

// URL scheme -> handler family constructor.
#[derive(Default)]
pub struct IntegrationRegistry {
    factories: HashMap<String, IntegrationFactory>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drivers(drivers: &BackendDrivers) -> Self {
        Self::with_payload_limit(drivers, MAX_FRAME_SIZE_BYTES)
    }

    // Like `with_drivers`, refusing received bodies that expand past `max_payload_bytes`.
    pub fn with_payload_limit(drivers: &BackendDrivers, max_payload_bytes: usize) -> Self {
        let mut registry = Self::new();

        for scheme in mq::SCHEMES {
            let driver = Arc::clone(&drivers.queue_manager);
            registry.register(
                scheme,
                Arc::new(move |worker: &str| {
                    let handler = QueueManagerHandler::new(worker, Arc::clone(&driver))
                        .with_max_payload_bytes(max_payload_bytes);
                    Box::new(handler) as Box<dyn Integration>
                }),
            );
        }
        for scheme in sb::SCHEMES {
            let driver = Arc::clone(&drivers.service_bus);
            registry.register(
                scheme,
                Arc::new(move |worker: &str| {
                    let handler = ServiceBusHandler::new(worker, Arc::clone(&driver));
                    Box::new(handler) as Box<dyn Integration>
                }),
            );
        }

        registry
    }

    pub fn register(&mut self, scheme: &str, factory: IntegrationFactory) -> bool {
        if self.factories.contains_key(scheme) {
            return false;
        }
        self.factories.insert(scheme.to_owned(), factory);
        true
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    pub fn create(&self, scheme: &str, worker: &str) -> Option<Box<dyn Integration>> {
        self.factories.get(scheme).map(|factory| factory(worker))
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl fmt::Debug for IntegrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

// Message wait in seconds from the request context, falling back to `default`.
pub(crate) fn message_wait(
    request: &AsyncMessageRequest,
    default: Duration,
) -> Result<Duration, IntegrationError> {
    let invalid = |reason: String| IntegrationError::InvalidContext {
        key: "message_wait",
        reason,
    };

    match request.context.get("message_wait") {
        None | Some(Value::Null) => Ok(default),
        Some(_) => {
            let seconds = request
                .context
                .get_f64("message_wait")
                .ok_or_else(|| invalid("must be a non-negative number of seconds".to_owned()))?;
            Duration::try_from_secs_f64(seconds).map_err(|_| {
                invalid(format!("{seconds} is not a non-negative number of seconds in range"))
            })
        }
    }
}

// Payload bytes as sent: strings verbatim, any other JSON value in its compact form.
pub(crate) fn payload_bytes(request: &AsyncMessageRequest) -> Result<Vec<u8>, IntegrationError> {
    match &request.payload {
        None | Some(Value::Null) => Err(IntegrationError::PayloadRequired),
        Some(Value::String(text)) => Ok(text.as_bytes().to_vec()),
        Some(other) => Ok(other.to_string().into_bytes()),
    }
}

pub(crate) fn ensure_no_payload(request: &AsyncMessageRequest) -> Result<(), IntegrationError> {
    match &request.payload {
        None | Some(Value::Null) => Ok(()),
        Some(_) => Err(IntegrationError::PayloadNotAllowed),
    }
}

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use serde_json::json;
use uuid::Uuid;

use crate::config::{AppConfig, BrokerConfig};
use crate::integration::driver::BackendDrivers;
use crate::integration::IntegrationRegistry;
use crate::logging::{LogLevel, Logger};
use crate::server::{is_read_timeout, PersistentConnection, ServerError, TcpServer};
use crate::shutdown::ShutdownSignal;
use crate::wire::codec::{CodecError, FrameBuffer, WireCodec};
use crate::wire::envelope::{AsyncMessageRequest, AsyncMessageResponse};
use crate::worker::{BackendEvent, Worker, WorkerHandle, WorkerJob};

const LOG_CONTEXT: &str = "broker";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug)]
pub enum BrokerError {
    Server(ServerError),
    LocalAddr(io::Error),
    Spawn(io::Error),
    Panicked,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(source) => write!(f, "{source}"),
            Self::LocalAddr(source) => {
                write!(f, "failed to read client endpoint address: {source}")
            }
            Self::Spawn(source) => write!(f, "failed to spawn broker thread: {source}"),
            Self::Panicked => write!(f, "broker thread panicked"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<ServerError> for BrokerError {
    fn from(value: ServerError) -> Self {
        Self::Server(value)
    }
}

#[derive(Debug)]
enum FrontendEvent {
    Frame { client_id: u64, payload: Vec<u8> },
    Malformed { client_id: u64, reason: String },
    Disconnected { client_id: u64 },
}

pub struct Broker {
    server: Arc<TcpServer>,
    local_addr: SocketAddr,
    codec: WireCodec,
    config: BrokerConfig,
    registry: Arc<IntegrationRegistry>,
    logger: Logger,
    shutdown: ShutdownSignal,
}

impl Broker {
    pub fn bind(
        app_config: &AppConfig,
        drivers: &BackendDrivers,
        logger: Logger,
        shutdown: ShutdownSignal,
    ) -> Result<Self, BrokerError> {
        let server = TcpServer::from_app_config(app_config)?;
        let local_addr = server.local_addr().map_err(BrokerError::LocalAddr)?;
        let registry = IntegrationRegistry::with_payload_limit(
            drivers,
            app_config.wire.max_frame_size_bytes,
        );

        Ok(Self {
            server: Arc::new(server),
            local_addr,
            codec: WireCodec::from_app_config(app_config),
            config: app_config.broker,
            registry: Arc::new(registry),
            logger,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn start(self) -> Result<BrokerHandle, BrokerError> {
        let local_addr = self.local_addr;
        let thread = thread::Builder::new()
            .name("broker".to_owned())
            .spawn(move || self.run())
            .map_err(BrokerError::Spawn)?;

        Ok(BrokerHandle { local_addr, thread })
    }

    pub fn run(self) -> Result<(), BrokerError> {
        let (frontend_tx, frontend_rx) = crossbeam_channel::unbounded();
        let (backend_tx, backend_rx) = crossbeam_channel::unbounded();
        let io_stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let server = Arc::clone(&self.server);
            let frontend = frontend_tx.clone();
            let stop = Arc::clone(&io_stop);
            let codec = self.codec;
            let logger = self.logger.clone();
            thread::Builder::new()
                .name("broker-acceptor".to_owned())
                .spawn(move || accept_loop(server, codec, frontend, stop, logger))
                .map_err(BrokerError::Spawn)?
        };

        self.logger.log(
            LogLevel::Info,
            LOG_CONTEXT,
            "Broker listening",
            Some(json!({
                "address": self.local_addr.to_string(),
                "poll_interval_ms": self.config.poll_interval_ms
            })),
        );

        let mut router = Router {
            broker: &self,
            backend_tx,
            sessions: HashMap::new(),
            retired: Vec::new(),
            pending: HashMap::new(),
            draining: false,
        };
        router.event_loop(&frontend_rx, &backend_rx);

        io_stop.store(true, Ordering::SeqCst);
        router.stop_workers(&backend_rx);
        self.server.shutdown_all_connections();
        drop(frontend_tx);
        if acceptor.join().is_err() {
            self.logger.error(LOG_CONTEXT, "Acceptor thread panicked");
        }

        self.logger.info(LOG_CONTEXT, "Broker stopped");
        Ok(())
    }

    fn reply(&self, client_id: u64, response: &AsyncMessageResponse) {
        let Some(connection) = self.server.connection(client_id) else {
            self.logger.log(
                LogLevel::Debug,
                LOG_CONTEXT,
                "Dropping response for closed client",
                Some(json!({"client_id": client_id, "worker": response.worker})),
            );
            return;
        };

        let frame = match self.codec.encode_frame(response) {
            Ok(frame) => frame,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    LOG_CONTEXT,
                    "Response could not be encoded, answering with failure",
                    Some(json!({"client_id": client_id, "error": error.to_string()})),
                );
                let reason = match &error {
                    CodecError::PayloadTooLarge { .. } => format!("response too large: {error}"),
                    _ => format!("failed to encode response: {error}"),
                };
                let mut failed = AsyncMessageResponse::failure(response.worker.as_str(), reason);
                failed.request_id = response.request_id.clone();
                failed.response_time = response.response_time;
                match self.codec.encode_frame(&failed) {
                    Ok(frame) => frame,
                    Err(error) => {
                        self.drop_client(client_id, error.to_string());
                        return;
                    }
                }
            }
        };

        if let Err(error) = connection.write_frame(&frame) {
            self.drop_client(client_id, error.to_string());
        }
    }

    fn drop_client(&self, client_id: u64, error: String) {
        self.logger.log(
            LogLevel::Warn,
            LOG_CONTEXT,
            "Failed to write response",
            Some(json!({"client_id": client_id, "error": error})),
        );
        self.server.drop_connection(client_id);
    }
}

// Session table and drain bookkeeping; touched only from the broker thread.
struct Router<'a> {
    broker: &'a Broker,
    backend_tx: Sender<BackendEvent>,
    sessions: HashMap<String, WorkerHandle>,
    retired: Vec<(String, JoinHandle<()>)>,
    // Jobs handed to each worker and not yet answered, oldest first.
    pending: HashMap<String, VecDeque<PendingJob>>,
    draining: bool,
}

struct PendingJob {
    client_id: u64,
    request_id: String,
}

impl Router<'_> {
    fn in_flight(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    fn event_loop(&mut self, frontend: &Receiver<FrontendEvent>, backend: &Receiver<BackendEvent>) {
        let poll_interval = Duration::from_millis(self.broker.config.poll_interval_ms);
        let mut drain_deadline: Option<Instant> = None;

        loop {
            select! {
                recv(frontend) -> event => {
                    if let Ok(event) = event {
                        self.on_frontend(event);
                    }
                }
                recv(backend) -> event => {
                    if let Ok(event) = event {
                        self.on_backend(event);
                    }
                }
                default(poll_interval) => {}
            }

            if drain_deadline.is_none() && self.broker.shutdown.is_triggered() {
                self.draining = true;
                let drain_timeout = Duration::from_millis(self.broker.config.drain_timeout_ms);
                drain_deadline = Some(Instant::now() + drain_timeout);
                self.broker.logger.log(
                    LogLevel::Info,
                    LOG_CONTEXT,
                    "Shutdown requested, draining in-flight requests",
                    Some(json!({"in_flight": self.in_flight(), "sessions": self.sessions.len()})),
                );
            }

            if let Some(deadline) = drain_deadline {
                if self.in_flight() == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    self.broker.logger.log(
                        LogLevel::Warn,
                        LOG_CONTEXT,
                        "Drain timeout reached, abandoning in-flight requests",
                        Some(json!({"in_flight": self.in_flight()})),
                    );
                    break;
                }
            }

            self.reap_retired(backend);
        }
    }

    fn on_frontend(&mut self, event: FrontendEvent) {
        match event {
            FrontendEvent::Frame { client_id, payload } => {
                match self.broker.codec.decode_payload::<AsyncMessageRequest>(&payload) {
                    Ok(request) => self.route(client_id, request),
                    Err(error) => self.broker.reply(
                        client_id,
                        &AsyncMessageResponse::failure("", format!("invalid request: {error}")),
                    ),
                }
            }
            FrontendEvent::Malformed { client_id, reason } => {
                self.broker.reply(
                    client_id,
                    &AsyncMessageResponse::failure("", format!("invalid request: {reason}")),
                );
                self.broker.server.drop_connection(client_id);
            }
            FrontendEvent::Disconnected { client_id } => {
                self.broker.logger.log(
                    LogLevel::Debug,
                    LOG_CONTEXT,
                    "Client disconnected",
                    Some(json!({"client_id": client_id})),
                );
                self.broker.server.drop_connection(client_id);
            }
        }
    }

    fn route(&mut self, client_id: u64, mut request: AsyncMessageRequest) {
        let Some(identity) = request.worker.clone() else {
            if self.draining {
                let refused = AsyncMessageResponse::failure("", "daemon is shutting down")
                    .for_request(&request.request_id);
                self.broker.reply(client_id, &refused);
                return;
            }

            let identity = Uuid::new_v4().to_string();
            let worker = Worker::new(
                identity.clone(),
                Arc::clone(&self.broker.registry),
                self.broker.logger.clone(),
            );
            match worker.spawn(self.backend_tx.clone()) {
                Ok(handle) => {
                    self.broker.logger.log(
                        LogLevel::Debug,
                        LOG_CONTEXT,
                        "Spawned worker for new session",
                        Some(json!({"worker": identity, "client_id": client_id})),
                    );
                    self.sessions.insert(identity.clone(), handle);
                }
                Err(error) => {
                    let reason = format!("failed to spawn worker: {error}");
                    let failed =
                        AsyncMessageResponse::failure("", reason).for_request(&request.request_id);
                    self.broker.reply(client_id, &failed);
                    return;
                }
            }

            request.worker = Some(identity.clone());
            self.dispatch(&identity, WorkerJob { client_id, request });
            return;
        };

        self.dispatch(&identity, WorkerJob { client_id, request });
    }

    fn dispatch(&mut self, identity: &str, job: WorkerJob) {
        let pending = PendingJob {
            client_id: job.client_id,
            request_id: job.request.request_id.clone(),
        };
        let undelivered = match self.sessions.get(identity) {
            Some(handle) => match handle.dispatch(job) {
                Ok(()) => {
                    self.pending
                        .entry(identity.to_owned())
                        .or_default()
                        .push_back(pending);
                    return;
                }
                Err(job) => job,
            },
            None => job,
        };

        self.retire(identity);
        let unavailable = AsyncMessageResponse::failure(
            identity,
            format!("worker {identity} is no longer available"),
        )
        .for_request(&undelivered.request.request_id);
        self.broker.reply(undelivered.client_id, &unavailable);
    }

    fn on_backend(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Reply {
                worker,
                client_id,
                response,
            } => {
                if let Some(queue) = self.pending.get_mut(&worker) {
                    queue.pop_front();
                    if queue.is_empty() {
                        self.pending.remove(&worker);
                    }
                }
                self.broker.reply(client_id, &response);
            }
            BackendEvent::Stopped { worker } => {
                self.broker.logger.log(
                    LogLevel::Info,
                    LOG_CONTEXT,
                    "Worker stopped, session removed",
                    Some(json!({"worker": worker})),
                );
                self.retire(&worker);
            }
        }
    }

    fn retire(&mut self, identity: &str) {
        if let Some(handle) = self.sessions.remove(identity) {
            self.retired.push((identity.to_owned(), handle.retire()));
        }
    }

    fn reap_retired(&mut self, backend: &Receiver<BackendEvent>) {
        let exited: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in exited {
            self.retire(&identity);
        }

        let (finished, running): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|(_, thread)| thread.is_finished());
        self.retired = running;
        if finished.is_empty() {
            return;
        }

        // Replies sent before those threads exited are already queued.
        while let Ok(event) = backend.try_recv() {
            self.on_backend(event);
        }
        for (identity, thread) in finished {
            if thread.join().is_err() {
                self.broker.logger.log(
                    LogLevel::Error,
                    LOG_CONTEXT,
                    "Worker thread panicked",
                    Some(json!({"worker": identity})),
                );
            }
            self.abandon(&identity);
        }
    }

    // Answers every job a dead worker will never reply to.
    fn abandon(&mut self, identity: &str) {
        let Some(unanswered) = self.pending.remove(identity) else {
            return;
        };
        for job in unanswered {
            let failed = AsyncMessageResponse::failure(
                identity,
                format!("worker {identity} stopped before answering"),
            )
            .for_request(&job.request_id);
            self.broker.reply(job.client_id, &failed);
        }
    }

    fn stop_workers(&mut self, backend: &Receiver<BackendEvent>) {
        let count = self.sessions.len();
        let identities: Vec<String> = self.sessions.keys().cloned().collect();
        for identity in identities {
            self.retire(&identity);
        }

        let retired: Vec<_> = self.retired.drain(..).collect();
        for (identity, thread) in retired {
            if thread.join().is_err() {
                self.broker.logger.log(
                    LogLevel::Error,
                    LOG_CONTEXT,
                    "Worker thread panicked",
                    Some(json!({"worker": identity})),
                );
            }
        }
        while let Ok(event) = backend.try_recv() {
            self.on_backend(event);
        }
        let abandoned: Vec<String> = self.pending.keys().cloned().collect();
        for identity in abandoned {
            self.abandon(&identity);
        }

        self.broker.logger.log(
            LogLevel::Debug,
            LOG_CONTEXT,
            "Workers stopped",
            Some(json!({"sessions": count})),
        );
    }
}

fn accept_loop(
    server: Arc<TcpServer>,
    codec: WireCodec,
    frontend: Sender<FrontendEvent>,
    stop: Arc<AtomicBool>,
    logger: Logger,
) {
    let mut readers: Vec<JoinHandle<()>> = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        match server.try_accept_persistent() {
            Ok(Some(connection)) => {
                logger.log(
                    LogLevel::Debug,
                    LOG_CONTEXT,
                    "Accepted client connection",
                    Some(json!({
                        "client_id": connection.id(),
                        "peer_addr": connection.peer_addr().to_string()
                    })),
                );

                let frontend = frontend.clone();
                let stop = Arc::clone(&stop);
                let spawned = thread::Builder::new()
                    .name(format!("client-{}", connection.id()))
                    .spawn({
                        let connection = Arc::clone(&connection);
                        move || read_loop(connection, codec, frontend, stop)
                    });
                match spawned {
                    Ok(reader) => readers.push(reader),
                    Err(error) => {
                        logger.log(
                            LogLevel::Error,
                            LOG_CONTEXT,
                            "Failed to spawn client reader",
                            Some(json!({"client_id": connection.id(), "error": error.to_string()})),
                        );
                        server.drop_connection(connection.id());
                    }
                }
            }
            Ok(None) => thread::sleep(ACCEPT_BACKOFF),
            Err(error) => {
                logger.log(
                    LogLevel::Warn,
                    LOG_CONTEXT,
                    "Accept failed",
                    Some(json!({"error": error.to_string()})),
                );
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
        readers.retain(|reader| !reader.is_finished());
    }

    for reader in readers {
        let _ = reader.join();
    }
}

fn read_loop(
    connection: Arc<PersistentConnection>,
    codec: WireCodec,
    frontend: Sender<FrontendEvent>,
    stop: Arc<AtomicBool>,
) {
    let client_id = connection.id();
    let mut frames = FrameBuffer::new();
    let mut chunk = [0_u8; READ_CHUNK_BYTES];

    'reading: while !stop.load(Ordering::SeqCst) {
        match connection.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                frames.push(&chunk[..read]);
                loop {
                    match frames.next_payload(&codec) {
                        Ok(Some(payload)) => {
                            if frontend.send(FrontendEvent::Frame { client_id, payload }).is_err() {
                                break 'reading;
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            let _ = frontend.send(FrontendEvent::Malformed {
                                client_id,
                                reason: error.to_string(),
                            });
                            break 'reading;
                        }
                    }
                }
            }
            Err(error) if is_read_timeout(&error) => continue,
            Err(_) => break,
        }
    }

    let _ = frontend.send(FrontendEvent::Disconnected { client_id });
}

pub struct BrokerHandle {
    local_addr: SocketAddr,
    thread: JoinHandle<Result<(), BrokerError>>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<(), BrokerError> {
        self.thread.join().map_err(|_| BrokerError::Panicked)?
    }
}

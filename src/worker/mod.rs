use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde_json::json;

use crate::integration::{elapsed_ms, Integration, IntegrationRegistry};
use crate::logging::{LogLevel, Logger};
use crate::wire::envelope::{scheme_of, AsyncMessageRequest, AsyncMessageResponse};

const LOG_CONTEXT: &str = "worker";

#[derive(Debug)]
pub struct WorkerJob {
    pub client_id: u64,
    pub request: AsyncMessageRequest,
}

#[derive(Debug)]
pub enum BackendEvent {
    Reply {
        worker: String,
        client_id: u64,
        response: AsyncMessageResponse,
    },
    Stopped {
        worker: String,
    },
}

// Broker-side end of a worker: its job channel and thread.
pub struct WorkerHandle {
    identity: String,
    jobs: Sender<WorkerJob>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    // Hands the job back when the worker has already gone away.
    pub fn dispatch(&self, job: WorkerJob) -> Result<(), WorkerJob> {
        match self.jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(job)) | Err(TrySendError::Full(job)) => Err(job),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    // Closes the job channel; the worker finishes what is queued and exits.
    pub fn retire(self) -> JoinHandle<()> {
        drop(self.jobs);
        self.thread
    }
}

pub struct Worker {
    identity: String,
    registry: Arc<IntegrationRegistry>,
    integration: Option<Box<dyn Integration>>,
    logger: Logger,
}

impl Worker {
    pub fn new(
        identity: impl Into<String>,
        registry: Arc<IntegrationRegistry>,
        logger: Logger,
    ) -> Self {
        Self {
            identity: identity.into(),
            registry,
            integration: None,
            logger,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn has_integration(&self) -> bool {
        self.integration.is_some()
    }

    pub fn is_usable(&self) -> bool {
        self.integration
            .as_ref()
            .map_or(true, |integration| integration.is_usable())
    }

    pub fn handle(&mut self, request: &AsyncMessageRequest) -> AsyncMessageResponse {
        let started_at = Instant::now();
        let received = request.worker.as_deref().unwrap_or("");

        if received != self.identity {
            return self.reject(
                request,
                format!("got {received}, expected {}", self.identity),
                started_at,
            );
        }

        let Some(url) = request.context.url() else {
            let missing = "no url found in request context".to_owned();
            return self.reject(request, missing, started_at);
        };
        let scheme = scheme_of(url);
        if !self.registry.supports(scheme) {
            return self.reject(
                request,
                format!("integration for {scheme}:// is not implemented"),
                started_at,
            );
        }

        if self.integration.is_none() {
            self.integration = self.registry.create(scheme, &self.identity);
            self.logger.log(
                LogLevel::Debug,
                LOG_CONTEXT,
                "Integration created",
                Some(json!({"worker": self.identity, "scheme": scheme})),
            );
        }

        match self.integration.as_mut() {
            Some(integration) => integration.handle(request),
            None => self.reject(
                request,
                format!("integration for {scheme}:// is not implemented"),
                started_at,
            ),
        }
    }

    pub fn close(&mut self) {
        if let Some(mut integration) = self.integration.take() {
            integration.close();
        }
    }

    pub fn spawn(self, backend: Sender<BackendEvent>) -> io::Result<WorkerHandle> {
        let identity = self.identity.clone();
        let (jobs, inbox) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name(format!("worker-{identity}"))
            .spawn(move || run(self, inbox, backend))?;

        Ok(WorkerHandle {
            identity,
            jobs,
            thread,
        })
    }

    fn reject(
        &self,
        request: &AsyncMessageRequest,
        message: String,
        started_at: Instant,
    ) -> AsyncMessageResponse {
        AsyncMessageResponse::failure(self.identity.as_str(), message)
            .for_request(&request.request_id)
            .with_response_time(elapsed_ms(started_at))
    }
}

fn run(mut worker: Worker, inbox: Receiver<WorkerJob>, backend: Sender<BackendEvent>) {
    worker.logger.log(
        LogLevel::Debug,
        LOG_CONTEXT,
        "Worker started",
        Some(json!({"worker": worker.identity})),
    );

    while let Ok(job) = inbox.recv() {
        worker.logger.log(
            LogLevel::Verbose,
            LOG_CONTEXT,
            "Handling request",
            Some(json!({
                "worker": worker.identity,
                "action": job.request.action,
                "request_id": job.request.request_id
            })),
        );

        let response = worker.handle(&job.request);
        let sent = backend.send(BackendEvent::Reply {
            worker: worker.identity.clone(),
            client_id: job.client_id,
            response,
        });
        if sent.is_err() {
            break;
        }

        if !worker.is_usable() {
            worker.logger.log(
                LogLevel::Warn,
                LOG_CONTEXT,
                "Backend connection is no longer usable, stopping worker",
                Some(json!({"worker": worker.identity})),
            );
            let _ = backend.send(BackendEvent::Stopped {
                worker: worker.identity.clone(),
            });

            // Answer whatever is still queued until the broker drops its end.
            while let Ok(job) = inbox.recv() {
                let response = AsyncMessageResponse::failure(
                    worker.identity.as_str(),
                    format!("worker {} has stopped", worker.identity),
                )
                .for_request(&job.request.request_id);
                if backend
                    .send(BackendEvent::Reply {
                        worker: worker.identity.clone(),
                        client_id: job.client_id,
                        response,
                    })
                    .is_err()
                {
                    break;
                }
            }
            break;
        }
    }

    worker.close();
    worker.logger.log(
        LogLevel::Debug,
        LOG_CONTEXT,
        "Worker stopped",
        Some(json!({"worker": worker.identity})),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{BackendEvent, Worker, WorkerJob};
    use crate::integration::driver::{BackendDrivers, MemoryBackend};
    use crate::integration::IntegrationRegistry;
    use crate::logging::tests::memory_logger;
    use crate::logging::{LogLevel, Logger};
    use crate::wire::envelope::{AsyncMessageContext, AsyncMessageRequest, AsyncMessageResponse};

    const URL: &str = "mq://localhost/?QueueManager=QM1&Channel=CH";

    fn worker(backend: &MemoryBackend) -> Worker {
        let registry = IntegrationRegistry::with_drivers(&BackendDrivers::memory(backend.clone()));
        Worker::new("w-1", Arc::new(registry), Logger::silent())
    }

    fn request(action: &str, url: &str) -> AsyncMessageRequest {
        AsyncMessageRequest::new(
            action,
            AsyncMessageContext::new()
                .with("url", url)
                .with("endpoint", "queue:IN"),
        )
        .with_worker("w-1")
    }

    fn reply(event: BackendEvent) -> AsyncMessageResponse {
        match event {
            BackendEvent::Reply { response, .. } => response,
            BackendEvent::Stopped { worker } => panic!("unexpected stop of {worker}"),
        }
    }

    #[test]
    fn rejects_request_for_another_identity_without_backend_call() {
        let backend = MemoryBackend::new();
        let mut worker = worker(&backend);

        let response = worker.handle(&request("CONN", URL).with_worker("w-2"));

        assert!(!response.success);
        assert_eq!(response.worker, "w-1");
        assert_eq!(response.message.as_deref(), Some("got w-2, expected w-1"));
        assert!(!worker.has_integration());
        assert_eq!(backend.connections_opened(), 0);
    }

    #[test]
    fn missing_worker_field_renders_empty() {
        let backend = MemoryBackend::new();
        let mut worker = worker(&backend);
        let mut unpinned = request("CONN", URL);
        unpinned.worker = None;

        let response = worker.handle(&unpinned);

        assert_eq!(response.message.as_deref(), Some("got , expected w-1"));
    }

    #[test]
    fn unknown_scheme_is_not_implemented() {
        let backend = MemoryBackend::new();
        let mut worker = worker(&backend);

        let response = worker.handle(&request("CONN", "amqp://broker/"));

        assert!(!response.success);
        assert_eq!(
            response.message.as_deref(),
            Some("integration for amqp:// is not implemented")
        );
        assert!(!worker.has_integration());
    }

    #[test]
    fn missing_url_is_reported() {
        let backend = MemoryBackend::new();
        let mut worker = worker(&backend);
        let request =
            AsyncMessageRequest::new("CONN", AsyncMessageContext::new()).with_worker("w-1");

        let response = worker.handle(&request);

        assert_eq!(
            response.message.as_deref(),
            Some("no url found in request context")
        );
    }

    #[test]
    fn integration_is_created_once_and_reused() {
        let backend = MemoryBackend::new();
        let mut worker = worker(&backend);

        let first = worker.handle(&request("CONN", URL));
        let second = worker.handle(&request("CONN", URL));

        assert_eq!(first.message.as_deref(), Some("connected"));
        assert_eq!(second.message.as_deref(), Some("re-used connection"));
        assert_eq!(backend.connections_opened(), 1);
    }

    #[test]
    fn logs_lazy_integration_creation() {
        let backend = MemoryBackend::new();
        let registry = IntegrationRegistry::with_drivers(&BackendDrivers::memory(backend));
        let (logger, sink) = memory_logger(LogLevel::Debug);
        let mut worker = Worker::new("w-1", Arc::new(registry), logger);

        worker.handle(&request("CONN", URL));
        worker.handle(&request("CONN", URL));

        let created: Vec<String> = sink
            .snapshot()
            .into_iter()
            .filter(|line| line.contains("[worker] Integration created"))
            .collect();
        assert_eq!(created.len(), 1);
        assert!(created[0].contains(r#""scheme":"mq""#));
    }

    #[test]
    fn spawned_worker_answers_in_order_and_stops_on_broken_backend() {
        let backend = MemoryBackend::new();
        let (events_tx, events) = crossbeam_channel::unbounded();
        let handle = worker(&backend).spawn(events_tx).expect("worker should spawn");
        let timeout = Duration::from_secs(5);

        handle
            .dispatch(WorkerJob {
                client_id: 7,
                request: request("CONN", URL),
            })
            .expect("dispatch CONN");
        let connected = reply(events.recv_timeout(timeout).expect("CONN reply"));
        assert!(connected.success);
        assert_eq!(connected.worker, "w-1");

        backend.sever();
        for _ in 0..2 {
            handle
                .dispatch(WorkerJob {
                    client_id: 7,
                    request: request("PUT", URL).with_payload("x"),
                })
                .expect("dispatch PUT");
        }

        let broken = reply(events.recv_timeout(timeout).expect("PUT reply"));
        assert!(!broken.success);
        assert_eq!(broken.message.as_deref(), Some("connection to QM1 is broken"));

        match events.recv_timeout(timeout).expect("stop event") {
            BackendEvent::Stopped { worker } => assert_eq!(worker, "w-1"),
            BackendEvent::Reply { response, .. } => panic!("unexpected reply {response:?}"),
        }

        let queued = reply(events.recv_timeout(timeout).expect("queued reply"));
        assert_eq!(queued.message.as_deref(), Some("worker w-1 has stopped"));

        handle
            .retire()
            .join()
            .expect("worker thread should finish");
    }
}

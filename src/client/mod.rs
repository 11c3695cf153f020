// A client pins itself to the worker named in its first response. Cancelling the
// token while waiting ends the call with a local "abort" response.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::wire::codec::{CodecError, FrameBuffer, WireCodec};
use crate::wire::envelope::{AsyncMessageRequest, AsyncMessageResponse};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug)]
pub enum ClientError {
    Connect { address: String, source: io::Error },
    Transport(io::Error),
    Codec(CodecError),
    // The backend (or the daemon on its behalf) rejected the request.
    AsyncMessage { message: String },
    // The caller cancelled while waiting; the scenario should stop, not fail.
    StopScenario,
    NoResponse,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { address, source } => {
                write!(f, "failed to connect to async-messaged at {address}: {source}")
            }
            Self::Transport(source) => write!(f, "transport error: {source}"),
            Self::Codec(source) => write!(f, "{source}"),
            Self::AsyncMessage { message } => write!(f, "{message}"),
            Self::StopScenario => write!(f, "scenario stopped"),
            Self::NoResponse => write!(f, "no response from async-messaged"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<CodecError> for ClientError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

pub fn classify_response(
    response: AsyncMessageResponse,
) -> Result<AsyncMessageResponse, ClientError> {
    if response.success {
        return Ok(response);
    }
    if response.is_abort() {
        return Err(ClientError::StopScenario);
    }
    Err(ClientError::AsyncMessage {
        message: response.message.unwrap_or_default(),
    })
}

pub struct AsyncMessageClient {
    stream: TcpStream,
    codec: WireCodec,
    frames: FrameBuffer,
    worker: Option<String>,
    retry_interval: Duration,
}

impl AsyncMessageClient {
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ClientError::Connect {
                address: address.to_owned(),
                source,
            })?;
        stream.set_nodelay(true).map_err(ClientError::Transport)?;

        Ok(Self {
            stream,
            codec: WireCodec::default(),
            frames: FrameBuffer::new(),
            worker: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        })
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    pub async fn request(
        &mut self,
        mut request: AsyncMessageRequest,
        cancel: &CancellationToken,
    ) -> Result<AsyncMessageResponse, ClientError> {
        request.request_id = Uuid::new_v4().to_string();
        if request.worker.is_none() {
            request.worker = self.worker.clone();
        }

        let frame = self.codec.encode_frame(&request)?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(ClientError::Transport)?;

        let response = self.await_response(&request.request_id, cancel).await?;
        if self.worker.is_none() && !response.worker.is_empty() && !response.is_abort() {
            self.worker = Some(response.worker.clone());
        }

        classify_response(response)
    }

    async fn await_response(
        &mut self,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AsyncMessageResponse, ClientError> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];

        loop {
            while let Some(payload) = self.frames.next_payload(&self.codec)? {
                let response: AsyncMessageResponse = self.codec.decode_payload(&payload)?;
                // Late answer to a request this client already gave up on.
                if response
                    .request_id
                    .as_deref()
                    .is_some_and(|id| id != request_id)
                {
                    continue;
                }
                return Ok(response);
            }

            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Err(ClientError::NoResponse),
                Ok(read) => self.frames.push(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let worker = self.worker.clone().unwrap_or_default();
                            return Ok(AsyncMessageResponse::aborted(worker));
                        }
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
                Err(error) => return Err(ClientError::Transport(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    use super::{classify_response, AsyncMessageClient, ClientError};
    use crate::broker::Broker;
    use crate::config::AppConfig;
    use crate::integration::driver::{BackendDrivers, MemoryBackend};
    use crate::logging::Logger;
    use crate::shutdown::ShutdownSignal;
    use crate::wire::codec::WireCodec;
    use crate::wire::envelope::{AsyncMessageContext, AsyncMessageRequest, AsyncMessageResponse};

    const URL: &str = "mq://localhost/?QueueManager=QM1&Channel=CH";

    fn mq_request(action: &str) -> AsyncMessageRequest {
        AsyncMessageRequest::new(
            action,
            AsyncMessageContext::new()
                .with("url", URL)
                .with("endpoint", "queue:IN"),
        )
    }

    async fn read_request(stream: &mut TcpStream) -> AsyncMessageRequest {
        let mut header = [0_u8; 4];
        stream.read_exact(&mut header).await.expect("request header");
        let mut payload = vec![0_u8; u32::from_be_bytes(header) as usize];
        stream.read_exact(&mut payload).await.expect("request payload");
        WireCodec::default()
            .decode_payload(&payload)
            .expect("request should decode")
    }

    async fn write_response(stream: &mut TcpStream, response: &AsyncMessageResponse) {
        let frame = WireCodec::default()
            .encode_frame(response)
            .expect("response should encode");
        stream.write_all(&frame).await.expect("response should be written");
    }

    #[test]
    fn classifies_failures() {
        let ok = classify_response(AsyncMessageResponse::success("w"))
            .expect("success passes through");
        assert_eq!(ok.worker, "w");

        let failed = classify_response(AsyncMessageResponse::failure("w", "no message on queue:IN"))
            .expect_err("failure should raise");
        assert!(matches!(
            failed,
            ClientError::AsyncMessage { ref message } if message == "no message on queue:IN"
        ));

        let aborted =
            classify_response(AsyncMessageResponse::aborted("w")).expect_err("abort should raise");
        assert!(matches!(aborted, ClientError::StopScenario));
    }

    #[tokio::test]
    async fn pins_worker_from_first_response_against_real_broker() {
        let backend = MemoryBackend::new();
        let mut config = AppConfig::default();
        config.server.port = 0;
        config.broker.poll_interval_ms = 20;
        let shutdown = ShutdownSignal::new();
        let broker = Broker::bind(
            &config,
            &BackendDrivers::memory(backend.clone()),
            Logger::silent(),
            shutdown.clone(),
        )
        .expect("broker should bind")
        .start()
        .expect("broker should start");

        let cancel = CancellationToken::new();
        let mut client = AsyncMessageClient::connect(&broker.local_addr().to_string())
            .await
            .expect("client should connect")
            .with_retry_interval(Duration::from_millis(10));

        let connected = client
            .request(mq_request("CONN"), &cancel)
            .await
            .expect("CONN should succeed");
        assert_eq!(client.worker(), Some(connected.worker.as_str()));

        backend.enqueue("QM1", "IN", b"payload".to_vec());
        let received = client
            .request(mq_request("GET"), &cancel)
            .await
            .expect("GET should succeed");
        assert_eq!(received.worker, connected.worker);
        assert_eq!(received.payload, Some(json!("payload")));
        assert_eq!(backend.connections_opened(), 1);

        let empty = client
            .request(mq_request("GET"), &cancel)
            .await
            .expect_err("empty queue should fail");
        assert_eq!(empty.to_string(), "no message on queue:IN");

        shutdown.trigger();
        broker.join().expect("broker should stop cleanly");
    }

    #[tokio::test]
    async fn cancellation_while_waiting_stops_the_scenario() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let address = listener.local_addr().expect("listener address").to_string();
        let silent_server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _ = read_request(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let mut client = AsyncMessageClient::connect(&address)
            .await
            .expect("client should connect")
            .with_retry_interval(Duration::from_millis(10));
        let error = client
            .request(mq_request("GET"), &cancel)
            .await
            .expect_err("cancelled request should not succeed");

        assert!(matches!(error, ClientError::StopScenario));
        silent_server.abort();
    }

    #[tokio::test]
    async fn discards_responses_for_other_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let address = listener.local_addr().expect("listener address").to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await;

            let stale =
                AsyncMessageResponse::failure("w-1", "stale").for_request("previous-request");
            write_response(&mut stream, &stale).await;
            let current = AsyncMessageResponse::success("w-1").for_request(&request.request_id);
            write_response(&mut stream, &current).await;
            stream
        });

        let mut client = AsyncMessageClient::connect(&address)
            .await
            .expect("client should connect")
            .with_retry_interval(Duration::from_millis(10));
        let response = client
            .request(mq_request("CONN"), &CancellationToken::new())
            .await
            .expect("current response should be returned");

        assert!(response.success);
        assert_eq!(client.worker(), Some("w-1"));
        let _ = server.await;
    }

    #[tokio::test]
    async fn closed_connection_without_answer_is_no_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let address = listener.local_addr().expect("listener address").to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _ = read_request(&mut stream).await;
        });

        let mut client = AsyncMessageClient::connect(&address)
            .await
            .expect("client should connect")
            .with_retry_interval(Duration::from_millis(10));
        let error = client
            .request(mq_request("CONN"), &CancellationToken::new())
            .await
            .expect_err("closed socket should fail");

        assert!(matches!(error, ClientError::NoResponse));
    }
}

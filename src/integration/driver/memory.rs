use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::{BackendConnection, BackendDriver, BackendMessage, BackendTarget, DriverError};

const SUBSCRIPTIONS_SEGMENT: &str = "/subscriptions/";

type Queues = HashMap<String, VecDeque<BackendMessage>>;

#[derive(Default)]
struct MemoryState {
    queues: Mutex<Queues>,
    available: Condvar,
    severed: AtomicBool,
    connections_opened: AtomicU64,
    refused: Mutex<HashSet<String>>,
}

impl MemoryState {
    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().expect("memory backend queues lock poisoned")
    }
}

// In-process stand-in for a broker: named FIFO queues per backend address.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, address: &str, destination: &str, body: Vec<u8>) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let mut queues = self.state.lock_queues();
        deliver(&mut queues, &queue_key(address, destination), BackendMessage {
            id: id.clone(),
            body,
        });
        drop(queues);
        self.state.available.notify_all();
        id
    }

    pub fn take(&self, address: &str, destination: &str) -> Option<BackendMessage> {
        self.state
            .lock_queues()
            .get_mut(&queue_key(address, destination))
            .and_then(VecDeque::pop_front)
    }

    pub fn depth(&self, address: &str, destination: &str) -> usize {
        self.state
            .lock_queues()
            .get(&queue_key(address, destination))
            .map_or(0, VecDeque::len)
    }

    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    // Every open and future connection fails with `ConnectionBroken` until restored.
    pub fn sever(&self) {
        self.state.severed.store(true, Ordering::SeqCst);
        self.state.available.notify_all();
    }

    pub fn restore(&self) {
        self.state.severed.store(false, Ordering::SeqCst);
    }

    pub fn refuse(&self, address: &str) {
        self.state
            .refused
            .lock()
            .expect("memory backend refused lock poisoned")
            .insert(address.to_owned());
    }
}

impl BackendDriver for MemoryBackend {
    fn connect(&self, target: &BackendTarget) -> Result<Box<dyn BackendConnection>, DriverError> {
        let refused = self
            .state
            .refused
            .lock()
            .expect("memory backend refused lock poisoned")
            .contains(&target.address);
        if refused {
            return Err(DriverError::ConnectionRefused {
                address: target.address.clone(),
                reason: "address refused by backend".to_owned(),
            });
        }
        if self.state.severed.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionBroken {
                address: target.address.clone(),
            });
        }

        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            address: target.address.clone(),
            open: true,
        }))
    }
}

struct MemoryConnection {
    state: Arc<MemoryState>,
    address: String,
    open: bool,
}

impl MemoryConnection {
    fn ensure_usable(&self) -> Result<(), DriverError> {
        if !self.open {
            return Err(DriverError::Closed);
        }
        if self.state.severed.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionBroken {
                address: self.address.clone(),
            });
        }
        Ok(())
    }
}

impl BackendConnection for MemoryConnection {
    fn declare(&mut self, destination: &str) -> Result<(), DriverError> {
        self.ensure_usable()?;
        self.state
            .lock_queues()
            .entry(queue_key(&self.address, destination))
            .or_default();
        Ok(())
    }

    fn put(&mut self, destination: &str, body: Vec<u8>) -> Result<String, DriverError> {
        self.ensure_usable()?;

        let id = Uuid::new_v4().simple().to_string();
        let mut queues = self.state.lock_queues();
        deliver(&mut queues, &queue_key(&self.address, destination), BackendMessage {
            id: id.clone(),
            body,
        });
        drop(queues);
        self.state.available.notify_all();

        Ok(id)
    }

    fn get(
        &mut self,
        destination: &str,
        wait: Duration,
    ) -> Result<Option<BackendMessage>, DriverError> {
        let key = queue_key(&self.address, destination);
        // No deadline when the wait does not fit in an Instant.
        let deadline = Instant::now().checked_add(wait);
        let mut queues = self.state.lock_queues();

        loop {
            self.ensure_usable()?;
            if let Some(message) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                return Ok(Some(message));
            }

            queues = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    self.state
                        .available
                        .wait_timeout(queues, remaining)
                        .expect("memory backend queues lock poisoned")
                        .0
                }
                None => self
                    .state
                    .available
                    .wait(queues)
                    .expect("memory backend queues lock poisoned"),
            };
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.open {
            return Err(DriverError::Closed);
        }
        self.open = false;
        Ok(())
    }
}

fn queue_key(address: &str, destination: &str) -> String {
    format!("{address}::{destination}")
}

// Topics fan out to their declared subscription queues; plain queues just append.
fn deliver(queues: &mut Queues, key: &str, message: BackendMessage) {
    let prefix = format!("{key}{SUBSCRIPTIONS_SEGMENT}");
    let subscriptions: Vec<String> = queues
        .keys()
        .filter(|candidate| candidate.starts_with(&prefix))
        .cloned()
        .collect();

    if subscriptions.is_empty() {
        queues.entry(key.to_owned()).or_default().push_back(message);
        return;
    }
    for subscription in subscriptions {
        if let Some(queue) = queues.get_mut(&subscription) {
            queue.push_back(message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::MemoryBackend;
    use crate::integration::driver::{BackendDriver, BackendTarget, DriverError};

    #[test]
    fn put_then_get_is_fifo_per_address() {
        let backend = MemoryBackend::new();
        let mut connection = backend
            .connect(&BackendTarget::new("QM1"))
            .expect("connect should work");

        connection.put("ORDERS", b"first".to_vec()).expect("put first");
        connection.put("ORDERS", b"second".to_vec()).expect("put second");
        backend.enqueue("QM2", "ORDERS", b"elsewhere".to_vec());

        let first = connection
            .get("ORDERS", Duration::ZERO)
            .expect("get should work")
            .expect("message should exist");
        assert_eq!(first.body, b"first");
        assert_eq!(backend.depth("QM1", "ORDERS"), 1);
        assert_eq!(backend.depth("QM2", "ORDERS"), 1);
    }

    #[test]
    fn get_waits_for_a_late_message() {
        let backend = MemoryBackend::new();
        let mut connection = backend
            .connect(&BackendTarget::new("QM1"))
            .expect("connect should work");

        let producer = backend.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.enqueue("QM1", "LATE", b"hello".to_vec());
        });

        let message = connection
            .get("LATE", Duration::from_secs(2))
            .expect("get should work");
        handle.join().expect("producer should finish");
        assert_eq!(message.map(|m| m.body), Some(b"hello".to_vec()));
    }

    #[test]
    fn empty_queue_times_out_with_none() {
        let backend = MemoryBackend::new();
        let mut connection = backend
            .connect(&BackendTarget::new("QM1"))
            .expect("connect should work");

        let message = connection
            .get("EMPTY", Duration::from_millis(20))
            .expect("get should work");
        assert!(message.is_none());
    }

    #[test]
    fn topic_fans_out_to_declared_subscriptions() {
        let backend = MemoryBackend::new();
        let mut connection = backend
            .connect(&BackendTarget::new("ns"))
            .expect("connect should work");
        connection.declare("events/subscriptions/a").expect("declare a");
        connection.declare("events/subscriptions/b").expect("declare b");

        connection.put("events", b"evt".to_vec()).expect("publish");

        assert_eq!(backend.depth("ns", "events/subscriptions/a"), 1);
        assert_eq!(backend.depth("ns", "events/subscriptions/b"), 1);
        assert_eq!(backend.depth("ns", "events"), 0);
    }

    #[test]
    fn severed_backend_breaks_open_connections() {
        let backend = MemoryBackend::new();
        let mut connection = backend
            .connect(&BackendTarget::new("QM1"))
            .expect("connect should work");

        backend.sever();

        let error = connection
            .put("ORDERS", b"x".to_vec())
            .expect_err("put on severed backend should fail");
        assert!(error.is_fatal());
    }

    #[test]
    fn restored_backend_accepts_new_connections() {
        let backend = MemoryBackend::new();
        backend.sever();
        assert!(backend.connect(&BackendTarget::new("QM1")).is_err());

        backend.restore();

        let mut connection = backend
            .connect(&BackendTarget::new("QM1"))
            .expect("connect after restore should work");
        connection.put("ORDERS", b"x".to_vec()).expect("put after restore");
        assert_eq!(backend.depth("QM1", "ORDERS"), 1);
        assert_eq!(backend.connections_opened(), 1);
    }

    #[test]
    fn wait_past_the_clock_range_still_returns_queued_message() {
        let backend = MemoryBackend::new();
        let mut connection = backend
            .connect(&BackendTarget::new("QM1"))
            .expect("connect should work");
        backend.enqueue("QM1", "IN", b"ready".to_vec());

        let message = connection
            .get("IN", Duration::MAX)
            .expect("get should work")
            .expect("queued message should be returned");
        assert_eq!(message.body, b"ready");
    }

    #[test]
    fn refused_address_fails_to_connect() {
        let backend = MemoryBackend::new();
        backend.refuse("QM9");

        let error = backend
            .connect(&BackendTarget::new("QM9"))
            .err()
            .expect("refused address should not connect");
        assert!(matches!(error, DriverError::ConnectionRefused { .. }));
        assert_eq!(backend.connections_opened(), 0);
    }
}

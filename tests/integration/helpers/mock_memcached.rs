//! Mock memcached server speaking the binary protocol
//!
//! Provides a configurable mock server that can:
//! - Store values with server-side CAS tokens
//! - Require SASL PLAIN credentials, or not know SASL at all
//! - Simulate failures, latency and corrupt frames
//! - Count connections and requests for assertions

use memcas::core::protocol::{self, Opcode, Request, Response, Status, HEADER_LEN};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

/// Tokens handed out for unconditional writes start here, far from the
/// small tokens tests pick by hand
const FIRST_CAS: u64 = 1_000_000;

/// Response mode for the mock server
#[derive(Debug, Clone)]
#[allow(dead_code)] // Not every scenario uses every mode
pub enum ResponseMode {
    /// Normal operation
    Normal,
    /// Close the connection instead of answering
    Failure,
    /// Answer after the given delay
    Slow(Duration),
    /// Answer with a frame that is not valid protocol
    Garbage,
}

/// Statistics tracked by the mock server
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub connections: usize,
    pub requests: usize,
    pub gets: usize,
    pub sets: usize,
    pub deletes: usize,
    pub auths: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Debug)]
struct Store {
    entries: HashMap<Vec<u8>, Entry>,
    next_cas: u64,
}

impl Store {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_cas: FIRST_CAS,
        }
    }

    /// Token to store for a write carrying `requested`
    fn token_for(&mut self, requested: u64) -> u64 {
        if requested != 0 {
            return requested;
        }
        self.next_cas += 1;
        self.next_cas
    }
}

/// Mock memcached server
pub struct MockMemcached {
    addr: String,
    response_mode: Arc<Mutex<ResponseMode>>,
    store: Arc<Mutex<Store>>,
    stats: Arc<Mutex<MockStats>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockMemcached {
    /// Create a new mock server with default settings
    pub async fn new() -> std::io::Result<Self> {
        MockMemcachedBuilder::new().build().await
    }

    /// Get the address the mock is listening on
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Set the response mode
    pub fn set_response_mode(&self, mode: ResponseMode) {
        *self.response_mode.lock().unwrap() = mode;
    }

    /// Get current statistics
    pub fn stats(&self) -> MockStats {
        self.stats.lock().unwrap().clone()
    }

    /// Get a value from the mock storage
    pub fn get_stored_value(&self, key: &str) -> Option<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store.entries.get(key.as_bytes()).map(|e| e.value.clone())
    }

    /// Get the CAS token currently stored for a key
    pub fn get_stored_cas(&self, key: &str) -> Option<u64> {
        let store = self.store.lock().unwrap();
        store.entries.get(key.as_bytes()).map(|e| e.cas)
    }

    /// Shutdown the mock server
    #[allow(dead_code)]
    pub fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
    }
}

/// Builder for MockMemcached with fluent configuration
pub struct MockMemcachedBuilder {
    bind_addr: String,
    response_mode: ResponseMode,
    credentials: Option<(String, String)>,
}

impl MockMemcachedBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            response_mode: ResponseMode::Normal,
            credentials: None,
        }
    }

    #[allow(dead_code)]
    pub fn response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    /// Require SASL PLAIN authentication with these credentials
    #[allow(dead_code)]
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub async fn build(self) -> std::io::Result<MockMemcached> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        let addr = listener.local_addr()?.to_string();

        let response_mode = Arc::new(Mutex::new(self.response_mode));
        let store = Arc::new(Mutex::new(Store::new()));
        let stats = Arc::new(Mutex::new(MockStats::default()));
        let credentials = Arc::new(self.credentials);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        // Spawn the accept loop
        let response_mode_clone = Arc::clone(&response_mode);
        let store_clone = Arc::clone(&store);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                stats_clone.lock().unwrap().connections += 1;
                                let session = Session {
                                    response_mode: Arc::clone(&response_mode_clone),
                                    store: Arc::clone(&store_clone),
                                    stats: Arc::clone(&stats_clone),
                                    authenticated: credentials.is_none(),
                                    credentials: Arc::clone(&credentials),
                                };

                                tokio::spawn(async move {
                                    let _ = session.run(stream).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        Ok(MockMemcached {
            addr,
            response_mode,
            store,
            stats,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Default for MockMemcachedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one accepted connection
struct Session {
    response_mode: Arc<Mutex<ResponseMode>>,
    store: Arc<Mutex<Store>>,
    stats: Arc<Mutex<MockStats>>,
    credentials: Arc<Option<(String, String)>>,
    authenticated: bool,
}

impl Session {
    async fn run(mut self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut frame = vec![0u8; HEADER_LEN];
            if stream.read_exact(&mut frame).await.is_err() {
                break; // Connection closed
            }
            let header = match protocol::decode_header(&frame) {
                Ok(header) => header,
                Err(_) => break,
            };
            frame.resize(header.frame_len(), 0);
            if stream.read_exact(&mut frame[HEADER_LEN..]).await.is_err() {
                break;
            }
            let request = match protocol::decode_request(&frame) {
                Ok(request) => request,
                Err(_) => break,
            };

            self.stats.lock().unwrap().requests += 1;

            let mode = self.response_mode.lock().unwrap().clone();
            let reply = match mode {
                ResponseMode::Failure => break,
                ResponseMode::Garbage => vec![0xffu8; HEADER_LEN],
                ResponseMode::Slow(delay) => {
                    sleep(delay).await;
                    protocol::encode_response(&self.handle(&request))
                }
                ResponseMode::Normal => protocol::encode_response(&self.handle(&request)),
            };

            if stream.write_all(&reply).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    fn handle(&mut self, request: &Request) -> Response {
        match request.opcode {
            Opcode::SaslListMechs => match self.credentials.as_ref() {
                None => Response::for_request(request, Status::UnknownCommand),
                Some(_) => Response {
                    value: b"PLAIN".to_vec(),
                    ..Response::for_request(request, Status::Success)
                },
            },
            Opcode::SaslAuth | Opcode::SaslStep => self.handle_auth(request),
            Opcode::Noop => Response::for_request(request, Status::Success),
            Opcode::Version => Response {
                value: b"1.6.0-mock".to_vec(),
                ..Response::for_request(request, Status::Success)
            },
            _ if !self.authenticated => Response::for_request(request, Status::AuthError),
            Opcode::Get => self.handle_get(request),
            Opcode::Set | Opcode::Replace => self.handle_store(request),
            Opcode::Delete => self.handle_delete(request),
        }
    }

    fn handle_auth(&mut self, request: &Request) -> Response {
        self.stats.lock().unwrap().auths += 1;

        let Some((username, password)) = self.credentials.as_ref() else {
            return Response::for_request(request, Status::UnknownCommand);
        };

        // PLAIN payload: authzid NUL authcid NUL password
        let parts: Vec<&[u8]> = request.value.split(|b| *b == 0).collect();
        let accepted = request.key == b"PLAIN"
            && parts.len() == 3
            && parts[1] == username.as_bytes()
            && parts[2] == password.as_bytes();

        if accepted {
            self.authenticated = true;
            Response {
                value: b"Authenticated".to_vec(),
                ..Response::for_request(request, Status::Success)
            }
        } else {
            Response::for_request(request, Status::AuthError)
        }
    }

    fn handle_get(&self, request: &Request) -> Response {
        self.stats.lock().unwrap().gets += 1;

        let store = self.store.lock().unwrap();
        match store.entries.get(&request.key) {
            Some(entry) => Response {
                flags: Some(entry.flags),
                value: entry.value.clone(),
                cas: entry.cas,
                ..Response::for_request(request, Status::Success)
            },
            None => Response::for_request(request, Status::KeyNotFound),
        }
    }

    fn handle_store(&self, request: &Request) -> Response {
        self.stats.lock().unwrap().sets += 1;

        let mut store = self.store.lock().unwrap();
        match store.entries.get(&request.key) {
            None if request.opcode == Opcode::Replace => {
                return Response::for_request(request, Status::KeyNotFound);
            }
            Some(entry) if request.cas != 0 && entry.cas != request.cas => {
                return Response::for_request(request, Status::KeyExists);
            }
            _ => {}
        }

        let cas = store.token_for(request.cas);
        store.entries.insert(
            request.key.clone(),
            Entry {
                value: request.value.clone(),
                flags: request.flags,
                cas,
            },
        );
        Response {
            cas,
            ..Response::for_request(request, Status::Success)
        }
    }

    fn handle_delete(&self, request: &Request) -> Response {
        self.stats.lock().unwrap().deletes += 1;

        let mut store = self.store.lock().unwrap();
        let status = match store.entries.get(&request.key) {
            None => Status::KeyNotFound,
            Some(entry) if request.cas != 0 && entry.cas != request.cas => Status::KeyExists,
            Some(_) => {
                store.entries.remove(&request.key);
                Status::Success
            }
        };
        Response::for_request(request, status)
    }
}

//! Local HTTP server for integration tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

use tiny_http::{Header, Response, Server};

/// Canned answer of the mock server.
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    pub last_modified: Option<String>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            last_modified: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, value: &str) -> Self {
        self.last_modified = Some(value.to_string());
        self
    }
}

/// HTTP server on an ephemeral port. Records the `If-Modified-Since` header
/// of every request it receives. Each request is answered on its own thread,
/// so a slow reply does not hold up the others.
pub struct MockServer {
    server: Arc<Server>,
    base: String,
    requests: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockServer {
    /// Serve every request with `handler`, which gets the request path and
    /// the `If-Modified-Since` value.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, Option<&str>) -> Reply + Send + Sync + 'static,
    {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let worker = Arc::clone(&server);
        let seen = Arc::clone(&requests);
        let handler = Arc::new(handler);
        thread::spawn(move || {
            for request in worker.incoming_requests() {
                let since = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("If-Modified-Since"))
                    .map(|h| h.value.as_str().to_string());
                seen.lock().push(since.clone());

                let handler = Arc::clone(&handler);
                thread::spawn(move || {
                    let reply = handler(request.url(), since.as_deref());
                    let mut response =
                        Response::from_data(reply.body).with_status_code(reply.status);
                    if let Some(value) = reply.last_modified {
                        let header =
                            Header::from_bytes(&b"Last-Modified"[..], value.as_bytes()).unwrap();
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                });
            }
        });

        Self {
            server,
            base: format!("http://{}", addr),
            requests,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// `If-Modified-Since` values of all requests so far.
    pub fn requests(&self) -> Vec<Option<String>> {
        self.requests.lock().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

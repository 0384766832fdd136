//! In-memory HTTP transport

use shelf_genre::services::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use std::sync::Mutex;

struct Route {
    pattern: String,
    replies: Vec<Result<HttpResponse, TransportError>>,
    served: usize,
}

/// Replies by substring match on the request URL (with query)
///
/// Each route serves its replies in order and then repeats the last one.
/// Requests matching no route get a 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, pattern: &str, replies: Vec<Result<HttpResponse, TransportError>>) -> Self {
        self.routes.lock().unwrap().push(Route {
            pattern: pattern.to_string(),
            replies,
            served: 0,
        });
        self
    }

    pub fn ok(self, pattern: &str, body: &str) -> Self {
        self.route(pattern, vec![Ok(HttpResponse::new(200, body))])
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.contains(pattern))
            .count()
    }
}

#[async_trait::async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let described = request.describe();
        self.requests.lock().unwrap().push(described.clone());

        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|r| described.contains(&r.pattern)) {
            Some(route) if !route.replies.is_empty() => {
                let index = route.served.min(route.replies.len() - 1);
                route.served += 1;
                route.replies[index].clone()
            }
            _ => Ok(HttpResponse::new(404, "")),
        }
    }
}

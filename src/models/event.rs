use crate::http::HttpRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    HttpRequest,
}

/// A unit of work handed from the listener to a backend
#[derive(Debug, Clone)]
pub enum Event {
    HttpRequest(HttpRequestEvent),
}

#[derive(Debug, Clone)]
pub struct HttpRequestEvent {
    /// Identifies the client session the request arrived on
    pub hash: u64,
    pub request: HttpRequest,
}

impl Event {
    pub fn http_request(hash: u64, request: HttpRequest) -> Self {
        Event::HttpRequest(HttpRequestEvent { hash, request })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Event::HttpRequest(_) => EventType::HttpRequest,
        }
    }

    pub fn hash(&self) -> u64 {
        match self {
            Event::HttpRequest(ev) => ev.hash,
        }
    }
}

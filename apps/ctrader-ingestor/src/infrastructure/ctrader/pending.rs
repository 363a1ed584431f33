//! Request Correlation
//!
//! Every outbound request gets a fresh `clientMsgId`; the broker echoes it
//! on the matching response. The correlator maps live ids to whatever the
//! session needs to route the response. An id that is no longer mapped
//! (timed out, or never issued by this connection) routes nowhere and the
//! response is dropped.

use std::collections::HashMap;

/// Maps in-flight `clientMsgId`s to routes.
#[derive(Debug)]
pub struct Correlator<R> {
    next_id: u64,
    routes: HashMap<String, R>,
}

impl<R> Default for Correlator<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Correlator<R> {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            routes: HashMap::new(),
        }
    }

    /// Register a route and return its fresh id.
    pub fn issue(&mut self, route: R) -> String {
        let id = format!("cm-{}", self.next_id);
        self.next_id += 1;
        self.routes.insert(id.clone(), route);
        id
    }

    /// Take the route for a response id.
    pub fn resolve(&mut self, id: &str) -> Option<R> {
        self.routes.remove(id)
    }

    /// Drop a route whose waiter gave up.
    pub fn forget(&mut self, id: &str) {
        self.routes.remove(id);
    }

    /// Whether an id is still in flight.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Drop every route.
    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

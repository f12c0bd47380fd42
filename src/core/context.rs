//! Request context management
//!
//! [`RequestContext`] holds the per-request state shared by admission, the filter chain,
//! route resolution and target execution. It is owned by one request and dropped with it,
//! which also releases every admission permit it holds.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{admission::AdmissionPermit, route::GatewayRoute};

/// Context that holds per-request state and metadata
pub struct RequestContext {
    pub request_id: String,

    /// Identity of the calling client or tenant, used for dedicated-line routing
    pub client_id: Option<String>,

    pub client_addr: Option<IpAddr>,

    /// The matched route, if any
    pub route: Option<Arc<GatewayRoute>>,

    /// Parameters extracted from the route pattern
    pub route_params: BTreeMap<String, String>,

    /// Cancelled when the client goes away or the request is abandoned
    pub cancel: CancellationToken,

    pub deadline: Option<Instant>,

    pub request_start: Instant,

    permits: Vec<AdmissionPermit>,

    /// Custom variables available to plugins (type-erased, thread-safe)
    vars: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(String::new(), CancellationToken::new())
    }
}

impl RequestContext {
    pub fn new(request_id: String, cancel: CancellationToken) -> Self {
        Self {
            request_id,
            client_id: None,
            client_addr: None,
            route: None,
            route_params: BTreeMap::new(),
            cancel,
            deadline: None,
            request_start: Instant::now(),
            permits: Vec::new(),
            vars: HashMap::new(),
        }
    }

    /// Keep an admission permit alive until the request finishes.
    pub fn hold_permit(&mut self, permit: AdmissionPermit) {
        self.permits.push(permit);
    }

    /// Report the request's outcome to every admission scope it holds.
    pub fn record_outcome(&mut self, success: bool) {
        for permit in &mut self.permits {
            permit.record_outcome(success);
        }
    }

    /// Tighten the request deadline; an earlier existing deadline is kept.
    pub fn set_timeout(&mut self, timeout: Duration) {
        let candidate = self.request_start + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
    }

    /// Store a typed value into the context
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.vars.insert(key.into(), Box::new(value));
    }

    /// Get a typed reference from the context
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.vars.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Get a string slice if the stored value is a `String`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.vars.remove(key)
    }
}

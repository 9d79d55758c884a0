//! Per-request context.
//!
//! Built by the handler entry points from the request parts: the
//! caller's scopes (resolved by the authentication collaborator) and
//! the request-bound access log. The context is an immutable value
//! handed down the call tree; nothing request-scoped lives in globals.

use std::sync::{Arc, Mutex};

use accesslog::{AccessLog, Accessor, Sink};
use manifest::Scopes;

/// Resolves the caller's scopes from an optional bearer token.
///
/// Token issuance and validation are external collaborators; the core
/// only consumes the resulting scope set.
pub trait ScopeSource: Send + Sync {
    fn scopes(&self, bearer: Option<&str>) -> Result<Grant, manifest::Error>;
}

#[derive(Debug, Clone)]
pub struct Grant {
    pub scopes: Scopes,
    /// Subject of the authenticated client, recorded as an accessor.
    pub client: Option<String>,
}

/// A fixed grant for every request, bearer or not. Used behind
/// trusted gateways and in tests.
pub struct StaticScopes(pub Vec<String>);

impl ScopeSource for StaticScopes {
    fn scopes(&self, _bearer: Option<&str>) -> Result<Grant, manifest::Error> {
        Ok(Grant {
            scopes: Scopes::new(self.0.iter().cloned()),
            client: None,
        })
    }
}

/// Rejects bearer tokens outright: with no authorization server
/// configured they cannot be validated. Anonymous requests proceed
/// with no scopes, so only open nodes are readable.
pub struct NoAuth;

impl ScopeSource for NoAuth {
    fn scopes(&self, bearer: Option<&str>) -> Result<Grant, manifest::Error> {
        if bearer.is_some() {
            return Err(manifest::Error::NoAuthServer);
        }
        Ok(Grant {
            scopes: Scopes::default(),
            client: None,
        })
    }
}

/// A sink handle shared by every request's access log.
#[derive(Clone)]
pub struct SharedSink(Arc<Mutex<Box<dyn Sink>>>);

impl SharedSink {
    pub fn new(sink: Box<dyn Sink>) -> SharedSink {
        SharedSink(Arc::new(Mutex::new(sink)))
    }
}

impl Sink for SharedSink {
    fn write(&mut self, lines: &[String]) -> Result<(), accesslog::Error> {
        self.0.lock().expect("sink lock is never poisoned").write(lines)
    }
}

pub struct RequestContext {
    pub scopes: Scopes,
    pub accesslog: AccessLog,
}

impl RequestContext {
    pub fn new(
        source: &dyn ScopeSource,
        sink: SharedSink,
        buffer_size: usize,
        bearer: Option<&str>,
        method: &str,
        url: &str,
    ) -> Result<RequestContext, manifest::Error> {
        let grant = source.scopes(bearer)?;
        let mut log = AccessLog::new(Box::new(sink), buffer_size);
        log.request(method, url);
        if let Some(client) = &grant.client {
            log.accessor(Accessor::client(client.clone()));
        }
        Ok(RequestContext {
            scopes: grant.scopes,
            accesslog: log,
        })
    }
}

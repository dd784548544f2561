//! What the guards need to know about an inbound request.

use std::net::SocketAddr;

/// Route template matched by the router (e.g. `/listings/:id`), inserted as a request
/// extension by the routing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRoute(pub String);

/// Authenticated principal id, inserted as a request extension by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Transport-agnostic view of a request.
///
/// Guards and key generators only ever see this descriptor, never the raw request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// HTTP method.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Route template, when the router matched one.
    pub route: Option<String>,
    /// Peer address of the connection.
    pub remote_addr: Option<String>,
    /// Raw `X-Forwarded-For` header.
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` header.
    pub real_ip: Option<String>,
    /// Authenticated user id, if any.
    pub user_id: Option<String>,
}

impl RequestDescriptor {
    /// Descriptor for `method path` with nothing else known.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method: method.into(), path: path.into(), ..Self::default() }
    }

    /// Set the matched route template.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Set the connection peer address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Set the `X-Forwarded-For` header value.
    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    /// Set the `X-Real-IP` header value.
    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    /// Set the authenticated user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Client identity used in limiter keys.
    ///
    /// First non-empty `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address,
    /// then `"unknown"`.
    pub fn identity(&self) -> &str {
        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|xff| xff.split(',').map(str::trim).find(|hop| !hop.is_empty()));

        forwarded
            .or_else(|| non_empty(self.real_ip.as_deref()))
            .or_else(|| non_empty(self.remote_addr.as_deref()))
            .unwrap_or("unknown")
    }

    /// Matched route template, falling back to the raw path.
    pub fn route_or_path(&self) -> &str {
        self.route.as_deref().unwrap_or(&self.path)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl<B> From<&http::Request<B>> for RequestDescriptor {
    fn from(req: &http::Request<B>) -> Self {
        let header = |name: &str| {
            req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
        };

        Self {
            method: req.method().as_str().to_owned(),
            path: req.uri().path().to_owned(),
            route: req.extensions().get::<MatchedRoute>().map(|r| r.0.clone()),
            remote_addr: req.extensions().get::<SocketAddr>().map(|addr| addr.ip().to_string()),
            forwarded_for: header("x-forwarded-for"),
            real_ip: header("x-real-ip"),
            user_id: req.extensions().get::<AuthenticatedUser>().map(|u| u.0.clone()),
        }
    }
}

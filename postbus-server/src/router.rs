//! Request routing: many services behind one composite-id lookup.
//!
//! A request addresses a method by `routing_key = service_id ^ method_id`,
//! both ids derived from a stable hash of the service and method names.
//! The registry is immutable once the server starts.

use crate::error::ServerError;
use postbus_core::ReceiveContext;
use postbus_protocol::Envelope;
use std::future::Future;
use std::pin::Pin;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Envelope, ServerError>> + Send>>;
pub type HandlerFn = Box<dyn Fn(ReceiveContext) -> HandlerFuture + Send + Sync>;

/// Stable id for a service or method name.
pub fn method_id(name: &str) -> u32 {
    crc32c::crc32c(name.as_bytes())
}

/// The composite id a request carries in its `meta` field.
pub fn routing_key(service_id: u32, method_id: u32) -> u32 {
    service_id ^ method_id
}

/// One registered method of a service.
pub struct Method {
    name: String,
    method_id: u32,
    handler: HandlerFn,
}

impl Method {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ReceiveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Envelope, ServerError>> + Send + 'static,
    {
        let name = name.into();
        Self {
            method_id: method_id(&name),
            name,
            handler: Box::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_id(&self) -> u32 {
        self.method_id
    }

    /// Runs the handler to completion; there is no cancellation once a
    /// message reaches it.
    pub fn invoke(&self, ctx: ReceiveContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("method_id", &self.method_id)
            .finish()
    }
}

/// A named bundle of methods sharing one service id.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    fn service_id(&self) -> u32;
    /// The method whose composite id matches the request, if any.
    fn method_for(&self, request_id: u32) -> Option<&Method>;
}

/// Hosts many services and routes a request id to a handler.
#[derive(Default)]
pub struct Router {
    services: Vec<Box<dyn Service>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Box<dyn Service>) {
        self.services.push(service);
    }

    pub fn handle_for(&self, request_id: u32) -> Option<&Method> {
        self.services
            .iter()
            .find_map(|service| service.method_for(request_id))
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn services(&self) -> impl Iterator<Item = &dyn Service> {
        self.services.iter().map(|s| s.as_ref())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.services.iter().map(|s| s.name()).collect();
        f.debug_struct("Router").field("services", &names).finish()
    }
}

/// A service assembled from closures, with ids hashed from names.
///
/// The shape code generators produce; also what demos and tests register
/// directly.
pub struct HashService {
    name: String,
    service_id: u32,
    methods: Vec<Method>,
}

impl HashService {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            service_id: method_id(&name),
            name,
            methods: Vec::new(),
        }
    }

    pub fn method<F, Fut>(mut self, method_name: &str, handler: F) -> Self
    where
        F: Fn(ReceiveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Envelope, ServerError>> + Send + 'static,
    {
        self.methods.push(Method::new(method_name, handler));
        self
    }

    /// The wire id a client must put in `meta` to reach `method_name`.
    pub fn request_id(&self, method_name: &str) -> u32 {
        routing_key(self.service_id, method_id(method_name))
    }
}

impl Service for HashService {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_id(&self) -> u32 {
        self.service_id
    }

    fn method_for(&self, request_id: u32) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| routing_key(self.service_id, m.method_id()) == request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn echo_service() -> HashService {
        HashService::new("echo").method("say", |ctx: ReceiveContext| async move {
            Ok(Envelope::new(ctx.body.clone()))
        })
    }

    #[test]
    fn test_routing_key_is_xor() {
        assert_eq!(routing_key(0b1100, 0b1010), 0b0110);
        assert_eq!(routing_key(method_id("a"), method_id("a")), 0);
    }

    #[test]
    fn test_router_finds_registered_method() {
        let service = echo_service();
        let key = service.request_id("say");
        let mut router = Router::new();
        router.register(Box::new(service));

        assert!(router.handle_for(key).is_some());
        assert_eq!(router.handle_for(key).unwrap().name(), "say");
        assert!(router.handle_for(key ^ 1).is_none());
    }

    #[test]
    fn test_first_registered_service_wins() {
        let a = HashService::new("svc").method("m", |_| async { Ok(Envelope::default()) });
        let key = a.request_id("m");
        let b = HashService::new("svc").method("m", |_| async { Ok(Envelope::default()) });

        let mut router = Router::new();
        router.register(Box::new(a));
        router.register(Box::new(b));
        assert!(router.handle_for(key).is_some());
    }

    #[tokio::test]
    async fn test_invoke_runs_handler() {
        let service = echo_service();
        let key = service.request_id("say");
        let method = service.method_for(key).unwrap();

        let ctx = ReceiveContext::new(
            "127.0.0.1:0".parse().unwrap(),
            {
                let mut h = postbus_protocol::Header::default();
                postbus_protocol::stamp(&mut h, b"hi");
                h
            },
            Bytes::from_static(b"hi"),
        );
        let reply = method.invoke(ctx).await.unwrap();
        assert_eq!(&reply.letter.body[..], b"hi");
    }
}

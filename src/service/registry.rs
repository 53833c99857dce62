//! Method table: fully-qualified name → access level + handler.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;

use crate::auth::Access;
use crate::pipeline::CallContext;
use crate::rpc::Status;

/// Boxed unary handler.
pub type UnaryHandler =
    Arc<dyn Fn(CallContext, Value) -> BoxFuture<'static, Result<Value, Status>> + Send + Sync>;

/// Boxed server-streaming handler.
pub type StreamHandler =
    Arc<dyn Fn(CallContext, Value) -> BoxStream<'static, Result<Value, Status>> + Send + Sync>;

/// Response shape of a method.
#[derive(Clone)]
pub enum MethodKind {
    /// One request, one response.
    Unary(UnaryHandler),
    /// One request, a stream of responses.
    ServerStreaming(StreamHandler),
}

/// A registered method.
#[derive(Clone)]
pub struct MethodDescriptor {
    /// `/<service>/<method>`
    pub name: String,
    /// Minimum access, consulted by the default authorizer.
    pub access: Access,
    /// Handler.
    pub kind: MethodKind,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            MethodKind::Unary(_) => "unary",
            MethodKind::ServerStreaming(_) => "server_streaming",
        };
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("access", &self.access)
            .field("kind", &kind)
            .finish()
    }
}

/// Fully-qualified method name for `service` / `method`.
#[must_use]
pub fn method_name(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// All methods the frontends can dispatch to. Immutable once the server
/// starts.
#[derive(Default, Debug)]
pub struct ServiceRegistry {
    methods: BTreeMap<String, MethodDescriptor>,
}

impl ServiceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary method, replacing any previous one with that name.
    pub fn unary<F, Fut>(&mut self, name: impl Into<String>, access: Access, handler: F) -> &mut Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Status>> + Send + 'static,
    {
        let name = name.into();
        let handler: UnaryHandler = Arc::new(move |ctx, req| handler(ctx, req).boxed());
        self.methods.insert(
            name.clone(),
            MethodDescriptor {
                name,
                access,
                kind: MethodKind::Unary(handler),
            },
        );
        self
    }

    /// Register a server-streaming method.
    pub fn server_streaming<F, S>(
        &mut self,
        name: impl Into<String>,
        access: Access,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(CallContext, Value) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, Status>> + Send + 'static,
    {
        let name = name.into();
        let handler: StreamHandler = Arc::new(move |ctx, req| handler(ctx, req).boxed());
        self.methods.insert(
            name.clone(),
            MethodDescriptor {
                name,
                access,
                kind: MethodKind::ServerStreaming(handler),
            },
        );
        self
    }

    /// Look up a method.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    /// Registered names, sorted.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_name_is_slash_qualified() {
        assert_eq!(method_name("pkg.Svc", "Do"), "/pkg.Svc/Do");
    }

    #[test]
    fn registered_methods_are_found_with_access() {
        let mut registry = ServiceRegistry::new();
        registry
            .unary("/a/One", Access::Reader, |_, req| async move { Ok(req) })
            .server_streaming("/a/Two", Access::Public, |_, _| futures::stream::empty());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("/a/One").unwrap().access, Access::Reader);
        assert!(matches!(
            registry.get("/a/Two").unwrap().kind,
            MethodKind::ServerStreaming(_)
        ));
        assert!(registry.get("/a/Three").is_none());
        assert_eq!(registry.method_names().collect::<Vec<_>>(), vec!["/a/One", "/a/Two"]);
    }
}

//! Services and per-method adapters.
//!
//! The runtime never inspects argument or reply types: each registered
//! method owns an adapter that decodes its argument, runs the user
//! function and encodes the reply, erased behind a byte-level closure.
//! Build a [`Service`] with [`Service::build`]:
//!
//! ```
//! use fastrpc::service::Service;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Args { num1: i64, num2: i64 }
//!
//! let service = Service::build("Foo")
//!     .method("Sum", |args: Args| async move { Ok::<_, String>(args.num1 + args.num2) })
//!     .finish();
//! assert!(service.method("Sum").is_some());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::conn::ConnType;

/// Boxed future returned by method adapters.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type InvokeFn = Box<dyn Fn(ConnType, Bytes) -> BoxFuture<'static, InvokeResult> + Send + Sync>;

/// Raw outcome of one invocation: encoded reply bytes, or the failure
/// message that goes into the response header.
pub type InvokeResult = std::result::Result<Bytes, String>;

/// One registered method: name, adapter and call statistics.
pub struct Method {
    name: String,
    invoke: InvokeFn,
    num_calls: AtomicU64,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of completed invocations so far.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode the argument bytes, run the user function once and encode
    /// the reply with the connection's codec.
    pub async fn invoke(&self, kind: ConnType, arg: Bytes) -> InvokeResult {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.invoke)(kind, arg).await
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named group of methods, addressed as `"<Service>.<Method>"`.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Start building a service with the given name.
    pub fn build(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by bare name (no service prefix).
    pub fn method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    /// All methods, for the debug page. Sorted by name.
    pub fn methods(&self) -> Vec<Arc<Method>> {
        let mut all: Vec<_> = self.methods.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

/// Fluent builder registering one adapter per method.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl ServiceBuilder {
    /// Register a method.
    ///
    /// The handler takes the decoded argument and resolves to
    /// `Ok(reply)` or `Err(message)`; the message travels to the caller
    /// in the response header.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let invoke: InvokeFn = Box::new(move |kind: ConnType, raw: Bytes| {
            let arg: A = match kind.decode(&raw) {
                Ok(arg) => arg,
                Err(e) => {
                    let msg = format!("invalid argument: {e}");
                    return Box::pin(async move { Err(msg) });
                }
            };
            let fut = handler(arg);
            Box::pin(async move {
                match fut.await {
                    Ok(reply) => kind
                        .encode(&reply)
                        .map(Bytes::from)
                        .map_err(|e| format!("encoding reply: {e}")),
                    Err(e) => Err(e.to_string()),
                }
            })
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                name: name.to_string(),
                invoke,
                num_calls: AtomicU64::new(0),
            }),
        );
        self
    }

    pub fn finish(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn arith() -> Service {
        Service::build("Foo")
            .method("Sum", |args: Args| async move {
                Ok::<_, String>(args.num1 + args.num2)
            })
            .method("Div", |args: Args| async move {
                if args.num2 == 0 {
                    Err("division by zero".to_string())
                } else {
                    Ok(args.num1 / args.num2)
                }
            })
            .finish()
    }

    #[tokio::test]
    async fn test_invoke_encodes_reply() {
        let service = arith();
        let sum = service.method("Sum").unwrap();

        for kind in [ConnType::Gob, ConnType::Json] {
            let arg = Bytes::from(kind.encode(&Args { num1: 2, num2: 3 }).unwrap());
            let reply = sum.invoke(kind, arg).await.unwrap();
            let value: i64 = kind.decode(&reply).unwrap();
            assert_eq!(value, 5);
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_message() {
        let service = arith();
        let div = service.method("Div").unwrap();

        let kind = ConnType::Gob;
        let arg = Bytes::from(kind.encode(&Args { num1: 1, num2: 0 }).unwrap());
        let err = div.invoke(kind, arg).await.unwrap_err();
        assert_eq!(err, "division by zero");
    }

    #[tokio::test]
    async fn test_bad_argument_reports_decode_failure() {
        let service = arith();
        let sum = service.method("Sum").unwrap();

        let kind = ConnType::Json;
        let arg = Bytes::from(kind.encode(&"not an args struct").unwrap());
        let err = sum.invoke(kind, arg).await.unwrap_err();
        assert!(err.contains("invalid argument"));
    }

    #[tokio::test]
    async fn test_num_calls_counts_invocations() {
        let service = arith();
        let sum = service.method("Sum").unwrap();
        assert_eq!(sum.num_calls(), 0);

        let kind = ConnType::Gob;
        for _ in 0..3 {
            let arg = Bytes::from(kind.encode(&Args { num1: 1, num2: 1 }).unwrap());
            let _ = sum.invoke(kind, arg).await;
        }
        assert_eq!(sum.num_calls(), 3);
    }

    #[test]
    fn test_unknown_method_lookup() {
        assert!(arith().method("Missing").is_none());
    }
}

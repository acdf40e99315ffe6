//! # fastrpc
//!
//! Connection-oriented RPC: a server exposing registered service methods
//! over a stream connection, a client multiplexing concurrent calls over
//! the same wire protocol, an HTTP registry with heartbeats, and a
//! load-balancing client façade.
//!
//! ## Protocol
//!
//! A connection opens with a handshake line (JSON `Options`: magic
//! number, codec, timeouts) which the server verifies and echoes. Every
//! later message is a frame: a `Header` (`ServiceMethod`, `Seq`, `Error`)
//! followed by a body, encoded by the negotiated codec (self-describing
//! binary or JSON). Handlers run concurrently on the server; responses are
//! matched back to callers by sequence number, so they may arrive in any
//! order.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fastrpc::{Client, Options, Server, Service};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Args { num1: i64, num2: i64 }
//!
//! #[tokio::main]
//! async fn main() -> fastrpc::Result<()> {
//!     let server = Arc::new(Server::new());
//!     server.register(
//!         Service::build("Foo")
//!             .method("Sum", |args: Args| async move {
//!                 Ok::<_, String>(args.num1 + args.num2)
//!             })
//!             .finish(),
//!     )?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = Client::dial(&addr.to_string(), Options::default()).await?;
//!     let sum: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod conn;
pub mod error;
pub mod registry;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Call, Client};
pub use conn::{ConnType, Header, Options};
pub use error::{Result, RpcError};
pub use registry::Registry;
pub use server::Server;
pub use service::Service;
pub use xclient::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, XClient};

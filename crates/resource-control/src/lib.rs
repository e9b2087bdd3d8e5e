#![forbid(unsafe_code)]
//! # Resource control client
//! Client-side admission control for per-tenant resource quotas enforced
//! by a remote resource manager.
//!
//! Each client instance keeps local token buckets for named resource
//! groups, admits or delays outgoing requests against those buckets,
//! measures actual consumption after each request, and periodically
//! reconciles with the central manager by trading consumption reports for
//! refilled tokens. Asynchronous scheduling is based on [`tokio`], the
//! group registry on [`dashmap`], the injected server contract on
//! [`async_trait`].
//!
//! ```toml
//! [dependencies]
//! resource-control = "0.1"
//! ```
//!
//! The typical flow wires a [`provider::ResourceGroupProvider`]
//! implementation into a [`ResourceGroupsController`], starts its
//! background loop and brackets every metered request with
//! `on_request_wait` / `on_response`.
//!
//! [`tokio`]: https://docs.rs/tokio
//! [`dashmap`]: https://docs.rs/dashmap
//! [`async_trait`]: https://docs.rs/async-trait

pub mod calculator;
pub mod config;
pub mod controller;
pub mod error;
pub mod limiter;
pub mod prelude;
pub mod provider;
pub mod types;

pub use self::controller::ResourceGroupsController;

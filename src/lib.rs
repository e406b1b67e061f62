//! Instrumented STOMP 1.2 client sessions for load-testing hosts.
//!
//! A [`Stomp`] module instance is created per host [`Runtime`]. It hands out
//! [`Client`] sessions whose send, read, ack and nack operations report
//! timings and outcome counters to the runtime's sample sink, and whose
//! subscriptions can push messages to listeners that run on the runtime's
//! single-threaded [`EventLoop`].
//!
//! ```no_run
//! use stomp_session::{MemorySink, Options, Runtime, Stomp, SubscribeOptions};
//!
//! # async fn demo() -> Result<(), stomp_session::SessionError> {
//! let (runtime, mut event_loop) = Runtime::new();
//! runtime.set_sink(MemorySink::new());
//! let stomp = Stomp::new(runtime);
//! let client = stomp.connect(&Options::new("localhost:61613")).await?;
//!
//! let sub = client.subscribe("/queue/test", SubscribeOptions::new()).await?;
//! client.send("/queue/test", "text/plain", "hello", None).await?;
//! let msg = sub.read().await?;
//! assert_eq!(msg.as_string(), "hello");
//!
//! let watcher = client.clone();
//! client
//!     .subscribe(
//!         "/queue/events",
//!         SubscribeOptions::new().listener(move |msg| {
//!             let watcher = watcher.clone();
//!             async move {
//!                 println!("{}", msg.as_string());
//!                 watcher.disconnect().await?;
//!                 Ok::<(), stomp_session::BoxError>(())
//!             }
//!         }),
//!     )
//!     .await?;
//! event_loop.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod metrics;
pub mod parser;
pub mod runtime;
pub mod subscription;
pub mod transaction;
pub mod transport;

pub use client::{Client, Stomp};
pub use codec::{StompCodec, StompItem};
pub use config::{HeartbeatOptions, Options, SendOptions};
pub use connection::{
    AckMode, ConnError, ConnectOptions, Connection, ServerError, negotiate_heartbeats,
    parse_heartbeat_header,
};
pub use error::{BoxError, SessionError};
pub use frame::Frame;
pub use message::Message;
pub use metrics::{Instrumentation, MemorySink, Metric, MetricKind, Sample, SampleSink};
pub use runtime::{EventLoop, Runtime};
pub use subscription::{
    DeliveryState, ErrorValue, ListenerErrorPolicy, Rearm, SubscribeOptions, Subscription,
};
pub use transaction::Transaction;

//! Realtime notification client for the Recall study platform.
//!
//! Maintains a persistent, authenticated WebSocket channel to the Recall
//! backend and fans asynchronous notifications (job progress, group
//! membership and content changes) out to typed handlers, so applications
//! never poll. The channel heals itself: abnormal closes trigger
//! exponential-backoff reconnection, and active topic subscriptions are
//! replayed automatically after every reconnect.
//!
//! # Example
//!
//! ```rust,no_run
//! use recall_link::{EventHandlers, EventType, LiveClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = LiveClient::builder()
//!     .base_url("https://api.recall.example.com/live")
//!     .event_handlers(
//!         EventHandlers::new()
//!             .on_connect(|| println!("live channel up"))
//!             .on_auth_failure(|| println!("session expired")),
//!     )
//!     .build()?;
//!
//! client.on(EventType::from("JOB_PROGRESS"), |envelope| {
//!     println!("job update: {}", envelope.payload);
//! });
//!
//! client.connect("bearer-token").await?;
//! client.subscribe("job-42").await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod event_handlers;
pub mod options;
pub mod state;

mod connection;
mod registry;

pub use backoff::RetryPolicy;
pub use client::{LiveClient, LiveClientBuilder};
pub use dispatch::{EventDispatcher, HandlerId};
pub use envelope::{Envelope, EventType};
pub use error::{RecallLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use options::ConnectionOptions;
pub use state::ConnectionState;

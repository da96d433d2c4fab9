#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # pg-large-notify
//!
//! Pub/sub over `PostgreSQL` LISTEN/NOTIFY that carries messages of any size.
//!
//! NOTIFY payloads are capped just under 8000 bytes. Messages that would not
//! fit are written to an unlogged staging table and replaced on the wire by
//! `__large_payload:<token>`, where the token is the row id sealed with
//! XChaCha20-Poly1305. Listeners recognise the marker, open the token, fetch
//! the row over a pooled connection and deliver the original message.
//!
//! ## Components
//!
//! - [`codec`] - sealing and opening reference tokens
//! - [`store`] - the staging table and its reap policy
//! - [`pool`] - publish pool and dedicated listen connections
//! - [`publisher`] - inline-or-stage broadcasting
//! - [`resolver`] - turning received payloads back into messages
//! - [`listener`] - the LISTEN loop
//! - [`dispatch`] - the callback loop fed by the listener
//! - [`adapter`] - everything above behind `broadcast` / `subscribe`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pg_large_notify::{HostContext, LargePayloadAdapter, RelayConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> pg_large_notify::Result<()> {
//! let config = RelayConfig::new()
//!     .with_url("postgresql://localhost/app")
//!     .with_payload_encryptor_secret("a-long-random-secret");
//! let adapter = LargePayloadAdapter::new(config, HostContext::new())?;
//!
//! adapter
//!     .subscribe(
//!         "chat",
//!         Arc::new(|channel: &str, message: String| {
//!             println!("{channel}: {} bytes", message.len());
//!         }),
//!     )
//!     .await?;
//!
//! adapter.broadcast("chat", &"a".repeat(20_000)).await?;
//! adapter.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod logging;
pub mod pool;
pub mod publisher;
pub mod resolver;
pub mod store;

pub use adapter::LargePayloadAdapter;
pub use codec::ReferenceCodec;
pub use config::{HostContext, RelayConfig, LARGE_PAYLOAD_PREFIX};
pub use dispatch::{DispatchLoop, MessageHandler};
pub use error::{RelayError, Result};
pub use listener::{ListenerState, ListenerStats, NotificationListener};
pub use pool::{ConnectionManager, ConnectionSource};
pub use publisher::{PgPublisher, Publisher};
pub use resolver::{InlineResolver, Resolver, StagedPayloadResolver};
pub use store::{ReapPolicy, StagingStore};

//! In-memory IPsec SADB/SPD engine with a PF_KEYv2 control interface.
//!
//! This crate maintains the two databases at the heart of an IPsec key
//! management plane — the Security Policy Database (what traffic should
//! be protected) and the Security Association Database (the keyed state
//! protecting it) — and implements the PF_KEYv2 message protocol used to
//! create, look up, update, and expire those objects. The cryptographic
//! transforms themselves and the socket transport stay outside, behind
//! the [`TransformProvider`] and [`MessageSink`] capabilities.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pfkey::{KeyConfig, KeyStoreContext, NullTransform};
//!
//! #[tokio::main]
//! async fn main() -> pfkey::Result<()> {
//!     let (ctx, hub) = KeyStoreContext::with_hub(
//!         KeyConfig::default(),
//!         Arc::new(NullTransform),
//!     );
//!     let mut ike = hub.attach(1);
//!     let sweeper = ctx.spawn_sweeper(std::time::Duration::from_secs(1));
//!
//!     // feed PF_KEY messages from the control channel
//!     ctx.handle_message(1, &request_bytes)?;
//!     let reply = ike.recv().await;
//!
//!     drop(sweeper);
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! Any number of threads may call into one [`KeyStoreContext`]: control
//! channels, the data-plane lookup surface
//! ([`KeyStoreContext::allocate_policy`],
//! [`KeyStoreContext::allocate_outbound`],
//! [`KeyStoreContext::allocate_inbound`]), and the periodic sweeper. The
//! SPD and SAD each sit behind one reader/writer lock; individual SAs
//! carry a fine-grained mutex for their keying material and lifetime
//! limits. Policies, association heads, and SAs are reference counted
//! and are only freed once unlinked and unreferenced.

pub mod acquire;
pub mod builder;
pub mod config;
pub mod context;
pub mod deliver;
pub mod error;
pub mod ext;
pub mod handler;
pub mod keys;
pub mod msg;
pub mod output;
pub mod proposal;
pub mod registry;
pub mod sad;
pub mod spd;
pub mod sweep;
pub mod types;
pub mod xform;

// Re-export the types most integrations need at the crate root.
pub use config::KeyConfig;
pub use context::KeyStoreContext;
pub use deliver::{DeliveryTarget, EventHub, MessageSink, MonitorStream};
pub use error::{Error, Result};
pub use registry::{ChannelId, Registry};
pub use types::{
    Direction, Endpoint, IpsecMode, IpsecProto, PolicyAction, PolicyLevel, SaIndex, SaState,
    SaType, SpIndex,
};
pub use xform::{KeyingView, NullTransform, TransformProvider};

//! # Coniql Gateway
//!
//! Multiplexes many client subscriptions onto at most one underlying channel
//! per process-variable identifier, and fans every value change out to each
//! interested client.
//!
//! ## Overview
//!
//! - [`ChannelSource`] is the seam to the control system. A source opens a
//!   channel and pushes [`SourceEvent`]s through a [`SourcePublisher`].
//! - [`PluginStore`] routes `transport://pv` ids to the source registered for
//!   that transport. [`SimSource`] provides the `ssim` demo channels.
//! - [`ChannelRegistry`] opens each identifier once, counts leases, and closes a
//!   channel after a grace delay once nobody holds it.
//! - [`SubscriptionHub`] owns sessions and listeners. Each listener gets the
//!   channel's current value and then every later event, through its own
//!   bounded queue that drops its oldest entry when full.
//!
//! ## Example
//!
//! ```rust,no_run
//! use coniql_gateway::{GatewayConfig, PluginStore, SimSource, SubscriptionHub, SIM_TRANSPORT};
//! use std::sync::Arc;
//!
//! # async fn example() -> coniql_gateway::Result<()> {
//! let store = PluginStore::new(SIM_TRANSPORT).with_plugin(SIM_TRANSPORT, Arc::new(SimSource::default()));
//! let id = store.normalize("sine(-1, 1)")?;
//! let hub = SubscriptionHub::new(Arc::new(store), GatewayConfig::default())?;
//!
//! let session = hub.open_session();
//! let mut subscription = hub.subscribe(&session, &id).await?;
//! if let Some(event) = subscription.recv().await {
//!     println!("{} = {:?}", event.id, event.value);
//! }
//!
//! hub.terminate_session(&session).await;
//! hub.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod listener;
pub mod plugins;
pub mod registry;
pub mod session;
pub mod sim;
pub mod source;
pub mod types;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use hub::{GatewayStats, SubscriptionHub};
pub use listener::{ListenerId, Subscription, SubscriptionState};
pub use plugins::{ChannelConfig, PluginStore};
pub use registry::ChannelRegistry;
pub use session::{ClientSession, SessionId};
pub use sim::{SimChannel, SimSource, MAX_RAMP_SIZE, SIM_TRANSPORT};
pub use source::{ChannelSource, SourceChannel, SourceError, SourceEvent, SourcePublisher};
pub use types::{
	ChannelDisplay, ChannelId, ChannelQuality, ChannelStatus, ChannelTime, ChannelValue, ConnectionState, Range,
	ValueEvent,
};

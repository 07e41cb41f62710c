use crate::error::{GatewayError, Result};
use std::time::Duration;

/// Tuning for the registry and hub
#[derive(Debug, Clone)]
pub struct GatewayConfig {
	/// How long a channel with no listeners stays open before it is closed
	pub grace_delay: Duration,
	/// Per-listener queue length; the oldest event is dropped when it is full
	pub listener_capacity: usize,
	/// Buffer between a source and the channel pump
	pub source_buffer: usize,
	/// Default wait used by one-shot reads
	pub get_timeout: Duration,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			grace_delay: Duration::from_secs(3),
			listener_capacity: 64,
			source_buffer: 128,
			get_timeout: Duration::from_secs(5),
		}
	}
}

impl GatewayConfig {
	#[must_use]
	pub fn with_grace_delay(mut self, grace_delay: Duration) -> Self {
		self.grace_delay = grace_delay;
		self
	}

	#[must_use]
	pub fn with_listener_capacity(mut self, listener_capacity: usize) -> Self {
		self.listener_capacity = listener_capacity;
		self
	}

	#[must_use]
	pub fn with_source_buffer(mut self, source_buffer: usize) -> Self {
		self.source_buffer = source_buffer;
		self
	}

	#[must_use]
	pub fn with_get_timeout(mut self, get_timeout: Duration) -> Self {
		self.get_timeout = get_timeout;
		self
	}

	pub fn validate(&self) -> Result<()> {
		if self.listener_capacity == 0 {
			return Err(GatewayError::InvalidConfig("listener_capacity must be at least 1".into()));
		}
		if self.source_buffer == 0 {
			return Err(GatewayError::InvalidConfig("source_buffer must be at least 1".into()));
		}
		Ok(())
	}
}

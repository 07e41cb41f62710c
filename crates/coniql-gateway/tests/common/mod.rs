#![allow(dead_code)]

use async_trait::async_trait;
use coniql_gateway::{
	ChannelId, ChannelSource, ChannelValue, GatewayConfig, SourceChannel, SourceError, SourceEvent,
	SourcePublisher,
	Subscription, SubscriptionHub, ValueEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory source that counts opens and lets tests drive each channel
#[derive(Default)]
pub struct FakeSource {
	opens: Mutex<HashMap<String, usize>>,
	publishers: Mutex<HashMap<String, SourcePublisher>>,
	failures: Mutex<HashMap<String, SourceError>>,
	delays: Mutex<HashMap<String, Duration>>,
	open_delay: Option<Duration>,
}

impl FakeSource {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn with_open_delay(delay: Duration) -> Arc<Self> {
		Arc::new(Self {
			open_delay: Some(delay),
			..Self::default()
		})
	}

	/// Make every later open of `id` take `delay`; other ids are unaffected
	pub fn delay_open(&self, id: &str, delay: Duration) {
		self.delays.lock().unwrap().insert(id.to_string(), delay);
	}

	/// Make the next open of `id` fail with `err`
	pub fn fail_next_open(&self, id: &str, err: SourceError) {
		self.failures.lock().unwrap().insert(id.to_string(), err);
	}

	pub fn opens(&self, id: &str) -> usize {
		self.opens.lock().unwrap().get(id).copied().unwrap_or(0)
	}

	pub fn publisher(&self, id: &str) -> SourcePublisher {
		self.publishers.lock().unwrap().get(id).cloned().unwrap_or_else(|| panic!("{id} was never opened"))
	}

	/// Drop the producer side, as if the source vanished
	pub fn hang_up(&self, id: &str) {
		self.publishers.lock().unwrap().remove(id);
	}

	pub async fn publish(&self, id: &str, event: SourceEvent) -> bool {
		self.publisher(id).publish(event).await
	}

	pub async fn value(&self, id: &str, value: f64) -> bool {
		self.publish(id, SourceEvent::value(ChannelValue::Float(value))).await
	}
}

#[async_trait]
impl ChannelSource for FakeSource {
	async fn open(&self, id: &ChannelId) -> Result<SourceChannel, SourceError> {
		let delay = self.delays.lock().unwrap().get(id.as_str()).copied().or(self.open_delay);
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if let Some(err) = self.failures.lock().unwrap().remove(id.as_str()) {
			return Err(err);
		}
		if id.as_str().starts_with("bad") {
			return Err(SourceError::UnknownChannel(format!("{id} does not exist")));
		}

		*self.opens.lock().unwrap().entry(id.to_string()).or_default() += 1;
		let (publisher, channel) = SourceChannel::pair(64);
		self.publishers.lock().unwrap().insert(id.to_string(), publisher);
		Ok(channel)
	}
}

pub fn hub(source: &Arc<FakeSource>) -> SubscriptionHub {
	hub_with(source, GatewayConfig::default())
}

pub fn hub_with(source: &Arc<FakeSource>, config: GatewayConfig) -> SubscriptionHub {
	SubscriptionHub::new(Arc::clone(source) as Arc<dyn ChannelSource>, config).unwrap()
}

pub fn id(raw: &str) -> ChannelId {
	ChannelId::new(raw)
}

/// Next event, failing the test instead of hanging forever
pub async fn next(sub: &mut Subscription) -> ValueEvent {
	tokio::time::timeout(Duration::from_secs(5), sub.recv())
		.await
		.expect("timed out waiting for an event")
		.expect("subscription ended")
}

pub async fn next_float(sub: &mut Subscription) -> f64 {
	next(sub).await.float().expect("event carries no float value")
}

/// Let spawned pumps and release tasks run
pub async fn settle() {
	tokio::time::sleep(Duration::from_millis(20)).await;
}

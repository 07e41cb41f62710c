use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::listener::{listener_queue, Delivery, ListenerId, ListenerTx, Subscription};
use crate::registry::{ChannelHandle, ChannelRegistry, Counters, ListenerEntry, SlotState};
use crate::session::{ClientSession, RecordOutcome, SessionId};
use crate::source::{ChannelSource, SourceEvent};
use crate::types::{
	ChannelId, ChannelQuality, ChannelStatus, ChannelTime, ChannelValue, ConnectionState, ValueEvent,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Point-in-time counters for the whole gateway
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
	pub open_channels: usize,
	pub listeners: usize,
	pub sessions: usize,
	pub channels_opened: u64,
	pub channels_closed: u64,
	pub events_delivered: u64,
	pub events_dropped: u64,
}

struct HubInner {
	registry: ChannelRegistry,
	sessions: DashMap<SessionId, ClientSession>,
	next_listener: AtomicU64,
	root: CancellationToken,
}

/// Fans channel events out to every subscribed listener.
///
/// The hub is the single entry point for the layer above: it opens
/// sessions, subscribes them to channels and releases their leases. Clones
/// share state, so hand one to every connection handler.
///
/// ```rust,ignore
/// let hub = SubscriptionHub::new(Arc::new(store), GatewayConfig::default())?;
/// let session = hub.open_session();
///
/// let mut sub = hub.subscribe(&session, &ChannelId::new("ssim://sine")).await?;
/// while let Some(event) = sub.recv().await {
///     println!("{:?}", event.value);
/// }
///
/// hub.terminate_session(&session).await;
/// ```
#[derive(Clone)]
pub struct SubscriptionHub {
	inner: Arc<HubInner>,
}

impl SubscriptionHub {
	pub fn new(source: Arc<dyn ChannelSource>, config: GatewayConfig) -> Result<Self> {
		config.validate()?;
		let root = CancellationToken::new();

		Ok(Self {
			inner: Arc::new(HubInner {
				registry: ChannelRegistry::new(source, config, root.clone()),
				sessions: DashMap::new(),
				next_listener: AtomicU64::new(1),
				root,
			}),
		})
	}

	pub fn registry(&self) -> &ChannelRegistry {
		&self.inner.registry
	}

	pub fn config(&self) -> &GatewayConfig {
		self.inner.registry.config()
	}

	pub fn is_shutting_down(&self) -> bool {
		self.inner.root.is_cancelled()
	}

	/// Start tracking a new client session
	pub fn open_session(&self) -> ClientSession {
		let session = ClientSession::new(&self.inner.root);
		self.inner.sessions.insert(session.id().clone(), session.clone());
		debug!(session = %session.id(), "session opened");
		session
	}

	/// Subscribe `session` to `id`.
	///
	/// The returned stream starts with the channel's current value when one
	/// exists. Subscribing again to a channel the session already holds
	/// replaces the earlier listener, which then ends.
	pub async fn subscribe(&self, session: &ClientSession, id: &ChannelId) -> Result<Subscription> {
		if session.is_terminated().await {
			return Err(GatewayError::SessionTerminated(session.id().clone()));
		}

		let listener = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = listener_queue(self.config().listener_capacity);

		{
			let mut acquired = self.inner.registry.acquire(id).await?;
			acquired.handle().attach(listener, session.id().clone(), tx, self.counters());
		}

		let mut subscription = Subscription::new(id.clone(), listener, session.clone(), self.clone(), rx);

		match session.record(id.clone(), listener).await {
			RecordOutcome::Recorded { replaced } => {
				if let Some(previous) = replaced {
					debug!(session = %session.id(), channel = %id, %previous, "replacing existing listener");
					self.detach(id, previous).await;
				}
			}
			RecordOutcome::Terminated => {
				subscription.cancel().await;
				return Err(GatewayError::SessionTerminated(session.id().clone()));
			}
		}

		subscription.activate();
		debug!(session = %session.id(), channel = %id, %listener, "subscribed");
		Ok(subscription)
	}

	/// Remove the session's listener for `id`. Returns whether one existed.
	pub async fn unsubscribe(&self, session: &ClientSession, id: &ChannelId) -> bool {
		let Some(listener) = session.take(id).await else {
			return false;
		};

		let removed = self.detach(id, listener).await;
		debug!(session = %session.id(), channel = %id, %listener, removed, "unsubscribed");
		removed
	}

	/// Release every lease the session holds. Safe to call any number of
	/// times; returns how many listeners this call removed.
	pub async fn terminate_session(&self, session: &ClientSession) -> usize {
		let registrations = session.drain().await;
		self.inner.sessions.remove(session.id());

		let mut removed = 0;
		for (id, listener) in registrations {
			if self.detach(&id, listener).await {
				removed += 1;
			}
		}

		if removed > 0 {
			debug!(session = %session.id(), removed, "session terminated");
		}
		removed
	}

	/// Read the current value of `id` once. Opening the channel and waiting
	/// for its first value share one `timeout` (or the configured default).
	pub async fn get(&self, id: &ChannelId, timeout: Option<Duration>) -> Result<ValueEvent> {
		let after = timeout.unwrap_or(self.config().get_timeout);
		let session = self.open_session();

		// one deadline covers opening the channel and waiting for its value
		let read = async {
			let mut subscription = self.subscribe(&session, id).await?;
			let result = loop {
				let Some(event) = subscription.recv().await else {
					break Err(GatewayError::ChannelUnavailable {
						id: id.clone(),
						reason: "subscription ended before a value arrived".into(),
					});
				};
				if let Some(reason) = event.error.clone() {
					break Err(GatewayError::ChannelUnavailable { id: id.clone(), reason });
				}
				if event.value.is_some() {
					break Ok(event);
				}
			};
			subscription.cancel().await;
			result
		};
		let result = tokio::time::timeout(after, read)
			.await
			.unwrap_or_else(|_| Err(GatewayError::Timeout { id: id.clone(), after }));

		self.terminate_session(&session).await;
		result
	}

	pub fn session_count(&self) -> usize {
		self.inner.sessions.len()
	}

	pub fn stats(&self) -> GatewayStats {
		let counters = self.counters();
		GatewayStats {
			open_channels: counters.live_channels.load(Ordering::Relaxed),
			listeners: counters.listeners.load(Ordering::Relaxed),
			sessions: self.inner.sessions.len(),
			channels_opened: counters.channels_opened.load(Ordering::Relaxed),
			channels_closed: counters.channels_closed.load(Ordering::Relaxed),
			events_delivered: counters.events_delivered.load(Ordering::Relaxed),
			events_dropped: counters.events_dropped.load(Ordering::Relaxed),
		}
	}

	/// Terminate every session and close every channel
	pub async fn shutdown(&self) {
		info!("shutting down subscription hub");
		self.inner.root.cancel();

		let sessions: Vec<ClientSession> = self.inner.sessions.iter().map(|entry| entry.value().clone()).collect();
		for session in sessions {
			self.terminate_session(&session).await;
		}

		self.inner.registry.shutdown().await;
		info!("subscription hub shut down");
	}

	/// Release path used by dropped or cancelled subscriptions
	pub(crate) async fn release_listener(
		&self,
		session: &ClientSession,
		id: &ChannelId,
		listener: ListenerId,
	) -> bool {
		session.forget(id, listener).await;
		self.detach(id, listener).await
	}

	fn counters(&self) -> &Counters {
		self.inner.registry.counters()
	}

	async fn detach(&self, id: &ChannelId, listener: ListenerId) -> bool {
		let Some(slot) = self.inner.registry.slot(id) else {
			return false;
		};

		let mut guard = slot.lock().await;
		let SlotState::Live(handle) = &mut *guard else {
			return false;
		};
		if !handle.detach(listener, self.counters()) {
			return false;
		}

		self.inner.registry.release(&slot, handle);
		true
	}
}

impl ChannelHandle {
	/// Register a listener, replaying the current value first. Runs under the
	/// slot lock, so no event can slip between the replay and registration.
	pub(crate) fn attach(
		&mut self,
		listener: ListenerId,
		session: SessionId,
		tx: ListenerTx,
		counters: &Counters,
	) {
		if let Some(snapshot) = self.latest.as_ref().filter(|event| event.has_value()) {
			tx.deliver(snapshot.clone());
		}
		self.listeners.insert(listener, ListenerEntry { session, tx });
		counters.listeners.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn detach(&mut self, listener: ListenerId, counters: &Counters) -> bool {
		match self.listeners.remove(&listener) {
			Some(entry) => {
				entry.tx.close();
				counters.listeners.fetch_sub(1, Ordering::Relaxed);
				true
			}
			None => false,
		}
	}

	/// Apply one source event. Returns `false` once the channel has failed.
	pub(crate) fn on_source_event(&mut self, event: SourceEvent, counters: &Counters) -> bool {
		match event {
			SourceEvent::Connected { display, mutable } => {
				self.state = ConnectionState::Connected;
				if display.is_some() {
					self.display = display;
				}
				self.mutable = mutable;
				// a value held over from before a disconnect is trusted again
				let quality = match self.latest.as_ref() {
					Some(event) if event.has_value() && event.status.quality != ChannelQuality::Undefined => {
						event.status.quality
					}
					Some(event) if event.has_value() => ChannelQuality::Valid,
					_ => ChannelQuality::Undefined,
				};
				self.emit(self.last_value(), ChannelStatus::new(quality, "", mutable), None, counters);
			}
			SourceEvent::Disconnected { reason } => {
				self.state = ConnectionState::Disconnected;
				self.emit(self.last_value(), ChannelStatus::undefined(reason), None, counters);
			}
			SourceEvent::Value { value, quality, time } => {
				self.state = ConnectionState::Connected;
				self.emit(Some(value), ChannelStatus::new(quality, "", self.mutable), time, counters);
			}
			SourceEvent::Failed { reason } => {
				self.fail(reason, counters);
				return false;
			}
		}
		true
	}

	/// The source gave up: tell every listener once and end their streams.
	/// Registrations stay until their owners release them.
	pub(crate) fn fail(&mut self, reason: String, counters: &Counters) {
		warn!(channel = %self.id, %reason, listeners = self.listeners.len(), "channel failed");
		self.failed = true;
		self.state = ConnectionState::Disconnected;

		let status = ChannelStatus::undefined(reason.clone());
		let event = self.event(self.last_value(), status, None, Some(reason));
		self.latest = Some(event.clone());
		self.publish(&event, counters);
		for entry in self.listeners.values() {
			entry.tx.close();
		}
		self.close_source();
	}

	/// Final close: optional last event, then every listener stream ends
	pub(crate) fn close(&mut self, state: ConnectionState, reason: Option<String>, counters: &Counters) {
		self.state = state;
		self.close_source();

		if let Some(reason) = reason {
			let status = ChannelStatus::undefined(reason.clone());
			let event = self.event(self.last_value(), status, None, Some(reason));
			self.publish(&event, counters);
		}

		let detached = self.listeners.len();
		for (_, entry) in self.listeners.drain() {
			entry.tx.close();
		}
		counters.listeners.fetch_sub(detached, Ordering::Relaxed);
	}

	fn last_value(&self) -> Option<ChannelValue> {
		self.latest.as_ref().and_then(|event| event.value.clone())
	}

	fn event(
		&self,
		value: Option<ChannelValue>,
		status: ChannelStatus,
		time: Option<ChannelTime>,
		error: Option<String>,
	) -> ValueEvent {
		ValueEvent {
			id: self.id.clone(),
			time: time.unwrap_or_else(ChannelTime::now),
			value,
			state: self.state,
			status,
			display: self.display.clone(),
			error,
		}
	}

	fn emit(
		&mut self,
		value: Option<ChannelValue>,
		status: ChannelStatus,
		time: Option<ChannelTime>,
		counters: &Counters,
	) {
		let event = self.event(value, status, time, None);
		self.publish(&event, counters);
		self.latest = Some(event);
	}

	fn publish(&self, event: &ValueEvent, counters: &Counters) {
		for (listener, entry) in &self.listeners {
			match entry.tx.deliver(event.clone()) {
				Delivery::Delivered => {
					counters.events_delivered.fetch_add(1, Ordering::Relaxed);
				}
				Delivery::DroppedOldest => {
					counters.events_delivered.fetch_add(1, Ordering::Relaxed);
					counters.events_dropped.fetch_add(1, Ordering::Relaxed);
					trace!(
						channel = %self.id,
						%listener,
						session = %entry.session,
						"slow listener, dropped oldest event"
					);
				}
				// session went away mid-delivery; its release is already on the way
				Delivery::Gone => {}
			}
		}
	}
}

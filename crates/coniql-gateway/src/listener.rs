use crate::hub::SubscriptionHub;
use crate::session::ClientSession;
use crate::types::{ChannelId, ValueEvent};
use async_broadcast::{broadcast, Receiver, RecvError, Sender, TryRecvError, TrySendError};
use futures::{Stream, StreamExt};
use std::{
	fmt,
	pin::Pin,
	task::{Context, Poll},
};

/// Unique id of one listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "L{}", self.0)
	}
}

/// Outcome of pushing one event into a listener queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
	Delivered,
	/// Queue was full, its oldest pending event was discarded
	DroppedOldest,
	/// Receiving side is gone
	Gone,
}

/// Sending half of a listener's bounded queue
pub(crate) struct ListenerTx {
	tx: Sender<ValueEvent>,
}

impl fmt::Debug for ListenerTx {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ListenerTx").field("queued", &self.tx.len()).field("closed", &self.tx.is_closed()).finish()
	}
}

/// Create a bounded drop-oldest queue for one listener
pub(crate) fn listener_queue(capacity: usize) -> (ListenerTx, Receiver<ValueEvent>) {
	let (mut tx, rx) = broadcast::<ValueEvent>(capacity.max(1));
	tx.set_overflow(true);
	tx.set_await_active(false);
	(ListenerTx { tx }, rx)
}

impl ListenerTx {
	/// Non-blocking push; never waits on the consumer
	pub(crate) fn deliver(&self, event: ValueEvent) -> Delivery {
		match self.tx.try_broadcast(event) {
			Ok(None) => Delivery::Delivered,
			Ok(Some(_oldest)) => Delivery::DroppedOldest,
			Err(TrySendError::Closed(_)) => Delivery::Gone,
			// unreachable with overflow on and await_active off
			Err(TrySendError::Full(_) | TrySendError::Inactive(_)) => Delivery::DroppedOldest,
		}
	}

	/// End the stream once the receiver has drained what is queued
	pub(crate) fn close(&self) {
		self.tx.close();
	}
}

/// Lifecycle of a single (session, channel) subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	Requested,
	Active,
	Terminated,
}

/// Caller-facing end of a listener.
///
/// Yields the current snapshot (if one exists) followed by every later
/// event for the channel. Dropping it releases the lease in the background.
pub struct Subscription {
	id: ChannelId,
	listener: ListenerId,
	session: ClientSession,
	hub: Option<SubscriptionHub>,
	rx: Receiver<ValueEvent>,
	state: SubscriptionState,
	missed: u64,
}

impl Subscription {
	pub(crate) fn new(
		id: ChannelId,
		listener: ListenerId,
		session: ClientSession,
		hub: SubscriptionHub,
		rx: Receiver<ValueEvent>,
	) -> Self {
		Self {
			id,
			listener,
			session,
			hub: Some(hub),
			rx,
			state: SubscriptionState::Requested,
			missed: 0,
		}
	}

	pub(crate) fn activate(&mut self) {
		if self.state == SubscriptionState::Requested {
			self.state = SubscriptionState::Active;
		}
	}

	pub fn channel_id(&self) -> &ChannelId {
		&self.id
	}

	pub fn listener_id(&self) -> ListenerId {
		self.listener
	}

	pub fn session(&self) -> &ClientSession {
		&self.session
	}

	pub fn state(&self) -> SubscriptionState {
		self.state
	}

	/// Events this listener lost to its own queue overflowing
	pub fn missed(&self) -> u64 {
		self.missed
	}

	/// Number of events waiting in the queue
	pub fn pending(&self) -> usize {
		self.rx.len()
	}

	/// Wait for the next event; `None` once the subscription has ended
	pub async fn recv(&mut self) -> Option<ValueEvent> {
		if self.state == SubscriptionState::Terminated {
			return None;
		}

		loop {
			match self.rx.recv().await {
				Ok(event) => return Some(event),
				Err(RecvError::Overflowed(n)) => {
					self.missed += n;
					tracing::trace!(channel = %self.id, listener = %self.listener, missed = n, "listener lagged");
				}
				Err(RecvError::Closed) => {
					self.state = SubscriptionState::Terminated;
					return None;
				}
			}
		}
	}

	/// Take the next event if one is already queued
	pub fn try_recv(&mut self) -> Option<ValueEvent> {
		loop {
			match self.rx.try_recv() {
				Ok(event) => return Some(event),
				Err(TryRecvError::Overflowed(n)) => self.missed += n,
				Err(TryRecvError::Closed) => {
					self.state = SubscriptionState::Terminated;
					return None;
				}
				Err(TryRecvError::Empty) => return None,
			}
		}
	}

	/// Release the lease now rather than from `Drop`
	pub async fn cancel(mut self) {
		self.state = SubscriptionState::Terminated;
		if let Some(hub) = self.hub.take() {
			hub.release_listener(&self.session, &self.id, self.listener).await;
		}
	}
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscription")
			.field("id", &self.id)
			.field("listener", &self.listener)
			.field("session", &self.session.id())
			.field("state", &self.state)
			.field("missed", &self.missed)
			.finish_non_exhaustive()
	}
}

impl Stream for Subscription {
	type Item = ValueEvent;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();
		if this.state == SubscriptionState::Terminated {
			return Poll::Ready(None);
		}

		if let Some(event) = this.try_recv() {
			return Poll::Ready(Some(event));
		}
		if this.state == SubscriptionState::Terminated {
			return Poll::Ready(None);
		}

		match this.rx.poll_next_unpin(cx) {
			Poll::Ready(None) => {
				this.state = SubscriptionState::Terminated;
				Poll::Ready(None)
			}
			other => other,
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		let Some(hub) = self.hub.take() else {
			return;
		};

		// Lease release must not wait for the channel, so it runs detached
		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				let session = self.session.clone();
				let id = self.id.clone();
				let listener = self.listener;
				runtime.spawn(async move {
					hub.release_listener(&session, &id, listener).await;
				});
			}
			Err(_) => {
				tracing::warn!(
					channel = %self.id,
					listener = %self.listener,
					"subscription dropped outside a runtime, lease not released"
				);
			}
		}
	}
}

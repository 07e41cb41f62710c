use crate::listener::ListenerId;
use crate::types::ChannelId;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordOutcome {
	Recorded { replaced: Option<ListenerId> },
	Terminated,
}

#[derive(Debug, Default)]
struct Registrations {
	terminated: bool,
	by_channel: HashMap<ChannelId, ListenerId>,
}

#[derive(Debug)]
struct SessionInner {
	id: SessionId,
	registrations: Mutex<Registrations>,
	cancel: CancellationToken,
}

/// One external client's set of channel leases.
///
/// Cheap to clone; all clones share the same registrations. The hub performs
/// the actual subscribe/unsubscribe work, the session only tracks which
/// listener it holds for each channel.
#[derive(Debug, Clone)]
pub struct ClientSession {
	inner: Arc<SessionInner>,
}

impl ClientSession {
	pub(crate) fn new(parent: &CancellationToken) -> Self {
		Self {
			inner: Arc::new(SessionInner {
				id: SessionId::new(),
				registrations: Mutex::new(Registrations::default()),
				cancel: parent.child_token(),
			}),
		}
	}

	pub fn id(&self) -> &SessionId {
		&self.inner.id
	}

	/// Fires when the session is terminated or the hub shuts down
	pub fn cancellation_token(&self) -> CancellationToken {
		self.inner.cancel.clone()
	}

	pub async fn is_terminated(&self) -> bool {
		self.inner.registrations.lock().await.terminated
	}

	pub async fn is_subscribed_to(&self, id: &ChannelId) -> bool {
		self.inner.registrations.lock().await.by_channel.contains_key(id)
	}

	/// Channels this session currently holds
	pub async fn channels(&self) -> Vec<ChannelId> {
		let regs = self.inner.registrations.lock().await;
		let mut channels: Vec<ChannelId> = regs.by_channel.keys().cloned().collect();
		drop(regs);
		channels.sort();
		channels
	}

	pub async fn count(&self) -> usize {
		self.inner.registrations.lock().await.by_channel.len()
	}

	/// Record a new listener, handing back the one it replaces. Nothing is
	/// recorded if the session was terminated in the meantime.
	pub(crate) async fn record(&self, id: ChannelId, listener: ListenerId) -> RecordOutcome {
		let mut regs = self.inner.registrations.lock().await;
		if regs.terminated {
			return RecordOutcome::Terminated;
		}
		RecordOutcome::Recorded {
			replaced: regs.by_channel.insert(id, listener),
		}
	}

	pub(crate) async fn take(&self, id: &ChannelId) -> Option<ListenerId> {
		self.inner.registrations.lock().await.by_channel.remove(id)
	}

	/// Forget `id` only if it still maps to `listener`
	pub(crate) async fn forget(&self, id: &ChannelId, listener: ListenerId) -> bool {
		let mut regs = self.inner.registrations.lock().await;
		if regs.by_channel.get(id) == Some(&listener) {
			regs.by_channel.remove(id);
			return true;
		}
		false
	}

	/// Mark terminated and hand back every registration in one step
	pub(crate) async fn drain(&self) -> Vec<(ChannelId, ListenerId)> {
		let drained = {
			let mut regs = self.inner.registrations.lock().await;
			regs.terminated = true;
			regs.by_channel.drain().collect()
		};
		self.inner.cancel.cancel();
		drained
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_record_and_forget() {
		let session = ClientSession::new(&CancellationToken::new());
		let id = ChannelId::new("det1");

		assert_eq!(session.record(id.clone(), ListenerId(1)).await, RecordOutcome::Recorded { replaced: None });
		assert!(session.is_subscribed_to(&id).await);

		assert!(!session.forget(&id, ListenerId(2)).await, "stale listener must not remove a newer one");
		assert!(session.forget(&id, ListenerId(1)).await);
		assert_eq!(session.count().await, 0);
	}

	#[tokio::test]
	async fn test_drain_is_idempotent() {
		let session = ClientSession::new(&CancellationToken::new());
		session.record(ChannelId::new("a"), ListenerId(1)).await;
		session.record(ChannelId::new("b"), ListenerId(2)).await;

		assert_eq!(session.drain().await.len(), 2);
		assert!(session.drain().await.is_empty());
		assert!(session.is_terminated().await);
		assert!(session.cancellation_token().is_cancelled());
	}

	#[tokio::test]
	async fn test_record_after_drain_is_refused() {
		let session = ClientSession::new(&CancellationToken::new());
		session.drain().await;

		assert_eq!(session.record(ChannelId::new("a"), ListenerId(1)).await, RecordOutcome::Terminated);
		assert_eq!(session.count().await, 0);
	}

	#[tokio::test]
	async fn test_record_reports_replaced_listener() {
		let session = ClientSession::new(&CancellationToken::new());
		let id = ChannelId::new("a");
		session.record(id.clone(), ListenerId(1)).await;

		let outcome = session.record(id.clone(), ListenerId(7)).await;
		assert_eq!(outcome, RecordOutcome::Recorded { replaced: Some(ListenerId(1)) });
		assert_eq!(session.count().await, 1);
	}

	#[tokio::test]
	async fn test_parent_cancel_propagates() {
		let parent = CancellationToken::new();
		let session = ClientSession::new(&parent);
		parent.cancel();
		assert!(session.cancellation_token().is_cancelled());
	}
}

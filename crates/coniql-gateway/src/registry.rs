use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::listener::{ListenerId, ListenerTx};
use crate::session::SessionId;
use crate::source::{ChannelSource, SourceEvent};
use crate::types::{ChannelDisplay, ChannelId, ConnectionState, ValueEvent};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-identifier lock. Lease counting, listener registration and delivery
/// for one channel happen under it. Opening the source does not.
pub(crate) type Slot = Arc<Mutex<SlotState>>;

#[derive(Debug)]
pub(crate) enum SlotState {
	/// Freshly created, nothing opened yet
	Vacant,
	/// First open in flight. The token is cancelled once the opener is done.
	Opening(CancellationToken),
	Live(ChannelHandle),
	/// Unlinked from the registry; holders must look the id up again
	Retired,
}

#[derive(Debug)]
pub(crate) struct ListenerEntry {
	pub(crate) session: SessionId,
	pub(crate) tx: ListenerTx,
}

/// One live underlying channel. Never leaves the registry's slots.
#[derive(Debug)]
pub(crate) struct ChannelHandle {
	pub(crate) id: ChannelId,
	pub(crate) state: ConnectionState,
	pub(crate) latest: Option<ValueEvent>,
	pub(crate) display: Option<ChannelDisplay>,
	pub(crate) mutable: bool,
	pub(crate) refcount: usize,
	pub(crate) listeners: HashMap<ListenerId, ListenerEntry>,
	pub(crate) failed: bool,
	/// Set while a failed channel is being reopened
	reopening: Option<CancellationToken>,
	closer: CancellationToken,
	generation: u64,
	close_generation: u64,
	pending_close: Option<CancellationToken>,
}

impl ChannelHandle {
	fn new(id: ChannelId, closer: CancellationToken, generation: u64) -> Self {
		Self {
			id,
			state: ConnectionState::Connecting,
			latest: None,
			display: None,
			mutable: false,
			refcount: 0,
			listeners: HashMap::new(),
			failed: false,
			reopening: None,
			closer,
			generation,
			close_generation: 0,
			pending_close: None,
		}
	}

	/// Swap in a new source after the previous one failed. Registrations
	/// made before the failure are kept so their leases stay balanced.
	fn reopen(&mut self, closer: CancellationToken, generation: u64) {
		self.closer.cancel();
		self.closer = closer;
		self.generation = generation;
		self.state = ConnectionState::Connecting;
		self.latest = None;
		self.failed = false;
		self.reopening = None;
	}

	fn cancel_pending_close(&mut self) -> bool {
		match self.pending_close.take() {
			Some(token) => {
				token.cancel();
				true
			}
			None => false,
		}
	}

	pub(crate) fn close_source(&self) {
		self.closer.cancel();
	}
}

/// Counters shared by the registry, the hub and every pump
#[derive(Debug, Default)]
pub(crate) struct Counters {
	pub(crate) live_channels: AtomicUsize,
	pub(crate) listeners: AtomicUsize,
	pub(crate) channels_opened: AtomicU64,
	pub(crate) channels_closed: AtomicU64,
	pub(crate) events_delivered: AtomicU64,
	pub(crate) events_dropped: AtomicU64,
}

/// A live handle returned by [`ChannelRegistry::acquire`], still locked and
/// with its lease already counted.
pub(crate) struct AcquiredChannel {
	pub(crate) slot: Slot,
	guard: OwnedMutexGuard<SlotState>,
}

impl AcquiredChannel {
	pub(crate) fn handle(&mut self) -> &mut ChannelHandle {
		match &mut *self.guard {
			SlotState::Live(handle) => handle,
			SlotState::Vacant | SlotState::Opening(_) | SlotState::Retired => {
				unreachable!("acquired slot is always live")
			}
		}
	}
}

/// What an acquirer found in the slot
enum Claim {
	Reuse,
	Wait(CancellationToken),
	Open,
}

/// Held by the caller that is opening a channel. If that caller is dropped
/// mid-open the slot is put back and waiters are released.
struct PendingOpen {
	registry: ChannelRegistry,
	id: ChannelId,
	slot: Slot,
	done: CancellationToken,
	armed: bool,
}

impl PendingOpen {
	fn finish(mut self) {
		self.armed = false;
		self.done.cancel();
	}
}

impl Drop for PendingOpen {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		if tokio::runtime::Handle::try_current().is_err() {
			self.done.cancel();
			return;
		}

		debug!(channel = %self.id, "open abandoned");
		if let Ok(mut guard) = Arc::clone(&self.slot).try_lock_owned() {
			self.registry.abandon_open(&self.id, &self.slot, &mut guard);
			self.done.cancel();
			return;
		}

		let registry = self.registry.clone();
		let id = self.id.clone();
		let slot = Arc::clone(&self.slot);
		let done = self.done.clone();
		tokio::spawn(async move {
			let mut guard = slot.lock().await;
			registry.abandon_open(&id, &slot, &mut guard);
			done.cancel();
		});
	}
}

struct RegistryInner {
	source: Arc<dyn ChannelSource>,
	slots: DashMap<ChannelId, Slot>,
	config: GatewayConfig,
	root: CancellationToken,
	generations: AtomicU64,
	counters: Arc<Counters>,
}

/// Owns every open underlying channel, at most one per identifier.
#[derive(Clone)]
pub struct ChannelRegistry {
	inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
	pub(crate) fn new(source: Arc<dyn ChannelSource>, config: GatewayConfig, root: CancellationToken) -> Self {
		Self {
			inner: Arc::new(RegistryInner {
				source,
				slots: DashMap::new(),
				config,
				root,
				generations: AtomicU64::new(1),
				counters: Arc::new(Counters::default()),
			}),
		}
	}

	pub(crate) fn counters(&self) -> &Arc<Counters> {
		&self.inner.counters
	}

	pub(crate) fn config(&self) -> &GatewayConfig {
		&self.inner.config
	}

	fn slot_for(&self, id: &ChannelId) -> Slot {
		let entry = self.inner.slots.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(SlotState::Vacant)));
		Arc::clone(entry.value())
	}

	pub(crate) fn slot(&self, id: &ChannelId) -> Option<Slot> {
		self.inner.slots.get(id).map(|entry| Arc::clone(entry.value()))
	}

	fn unlink(&self, id: &ChannelId, slot: &Slot) {
		self.inner.slots.remove_if(id, |_, current| Arc::ptr_eq(current, slot));
	}

	/// Take a lease on `id`, opening the underlying channel if needed.
	///
	/// Only one caller per id asks the source to open it; the others wait for
	/// that attempt and then reuse or retry. The slot lock is not held while
	/// the source opens, so releases and detaches on the same id never wait
	/// on it, and callers for other ids are not blocked.
	pub(crate) async fn acquire(&self, id: &ChannelId) -> Result<AcquiredChannel> {
		loop {
			if self.inner.root.is_cancelled() {
				return Err(GatewayError::ShuttingDown);
			}

			let slot = self.slot_for(id);
			let mut guard = Arc::clone(&slot).lock_owned().await;

			let claim = match &mut *guard {
				SlotState::Retired => continue,
				SlotState::Opening(done) => Claim::Wait(done.clone()),
				SlotState::Live(handle) => match &handle.reopening {
					Some(done) => Claim::Wait(done.clone()),
					None if handle.failed => Claim::Open,
					None => {
						handle.refcount += 1;
						if handle.cancel_pending_close() {
							debug!(channel = %id, "grace close cancelled, reusing channel");
						}
						Claim::Reuse
					}
				},
				SlotState::Vacant => Claim::Open,
			};

			let done = match claim {
				Claim::Reuse => return Ok(AcquiredChannel { slot, guard }),
				Claim::Wait(done) => {
					drop(guard);
					tokio::select! {
						() = done.cancelled() => {}
						() = self.inner.root.cancelled() => {}
					}
					continue;
				}
				Claim::Open => {
					let done = CancellationToken::new();
					match &mut *guard {
						SlotState::Live(handle) => handle.reopening = Some(done.clone()),
						_ => *guard = SlotState::Opening(done.clone()),
					}
					done
				}
			};
			drop(guard);

			let pending = PendingOpen {
				registry: self.clone(),
				id: id.clone(),
				slot: Arc::clone(&slot),
				done,
				armed: true,
			};
			let opened = tokio::select! {
				opened = self.inner.source.open(id) => opened,
				() = self.inner.root.cancelled() => return Err(GatewayError::ShuttingDown),
			};

			let mut guard = Arc::clone(&slot).lock_owned().await;
			let source = match opened {
				Ok(source) => source,
				Err(err) => {
					self.abandon_open(id, &slot, &mut guard);
					pending.finish();
					warn!(channel = %id, error = %err, "failed to open channel");
					return Err(GatewayError::from_source(id, err));
				}
			};

			if self.inner.root.is_cancelled() || matches!(*guard, SlotState::Vacant | SlotState::Retired) {
				// shut down while opening; the loop head reports it
				source.close();
				self.abandon_open(id, &slot, &mut guard);
				pending.finish();
				continue;
			}

			let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
			let (events, closer) = source.into_parts();

			match &mut *guard {
				SlotState::Live(handle) => {
					info!(channel = %id, "reopening failed channel");
					handle.reopen(closer.clone(), generation);
				}
				_ => {
					*guard = SlotState::Live(ChannelHandle::new(id.clone(), closer.clone(), generation));
					self.inner.counters.live_channels.fetch_add(1, Ordering::Relaxed);
					info!(channel = %id, "channel opened");
				}
			}
			self.inner.counters.channels_opened.fetch_add(1, Ordering::Relaxed);

			let mut acquired = AcquiredChannel { slot, guard };
			let handle = acquired.handle();
			handle.refcount += 1;
			handle.cancel_pending_close();

			tokio::spawn(pump(
				Arc::clone(&acquired.slot),
				events,
				closer,
				generation,
				self.inner.root.clone(),
				Arc::clone(&self.inner.counters),
			));

			pending.finish();
			return Ok(acquired);
		}
	}

	/// Undo the state an opener put in the slot when its open did not land
	fn abandon_open(&self, id: &ChannelId, slot: &Slot, state: &mut SlotState) {
		match state {
			SlotState::Opening(_) => {
				*state = SlotState::Retired;
				self.unlink(id, slot);
			}
			SlotState::Live(handle) => {
				handle.reopening = None;
				if handle.refcount == 0 {
					self.schedule_close(slot, handle);
				}
			}
			SlotState::Vacant | SlotState::Retired => {}
		}
	}

/// Drop one lease. At zero the channel lingers for the grace delay and is
	/// then closed unless someone acquires it again first.
	pub(crate) fn release(&self, slot: &Slot, handle: &mut ChannelHandle) {
		handle.refcount = handle.refcount.saturating_sub(1);
		if handle.refcount == 0 {
			self.schedule_close(slot, handle);
		}
	}

	fn schedule_close(&self, slot: &Slot, handle: &mut ChannelHandle) {
		handle.close_generation += 1;
		let generation = handle.close_generation;
		let token = self.inner.root.child_token();
		if let Some(previous) = handle.pending_close.replace(token.clone()) {
			previous.cancel();
		}

		let registry = self.clone();
		let slot = Arc::clone(slot);
		let id = handle.id.clone();
		let grace = self.inner.config.grace_delay;
		debug!(channel = %id, grace_ms = grace.as_millis() as u64, "last listener left, scheduling close");

		tokio::spawn(async move {
			tokio::select! {
				() = token.cancelled() => {}
				() = tokio::time::sleep(grace) => {
					registry.close_if_idle(&id, &slot, generation).await;
				}
			}
		});
	}

	async fn close_if_idle(&self, id: &ChannelId, slot: &Slot, generation: u64) {
		let mut guard = slot.lock().await;
		let idle = matches!(
			&*guard,
			SlotState::Live(handle)
				if handle.refcount == 0 && handle.close_generation == generation && handle.reopening.is_none()
		);
		if !idle {
			return;
		}

		if let SlotState::Live(mut handle) = std::mem::replace(&mut *guard, SlotState::Retired) {
			handle.pending_close = None;
			handle.close(ConnectionState::Closed, None, &self.inner.counters);
			self.inner.counters.live_channels.fetch_sub(1, Ordering::Relaxed);
			self.inner.counters.channels_closed.fetch_add(1, Ordering::Relaxed);
		}
		self.unlink(id, slot);
		info!(channel = %id, "channel closed after grace delay");
	}

	/// Close every channel now and stop all background work
	pub(crate) async fn shutdown(&self) {
		self.inner.root.cancel();

		let slots: Vec<(ChannelId, Slot)> =
			self.inner.slots.iter().map(|entry| (entry.key().clone(), Arc::clone(entry.value()))).collect();
		for (id, slot) in slots {
			let mut guard = slot.lock().await;
			if let SlotState::Live(mut handle) = std::mem::replace(&mut *guard, SlotState::Retired) {
				handle.cancel_pending_close();
				handle.close(ConnectionState::Closed, Some("gateway shut down".into()), &self.inner.counters);
				self.inner.counters.live_channels.fetch_sub(1, Ordering::Relaxed);
				self.inner.counters.channels_closed.fetch_add(1, Ordering::Relaxed);
			}
			self.unlink(&id, &slot);
		}
		info!("channel registry shut down");
	}

	/// Number of channels currently held open, including lingering ones
	pub fn open_channels(&self) -> usize {
		self.inner.counters.live_channels.load(Ordering::Relaxed)
	}

	pub async fn is_open(&self, id: &ChannelId) -> bool {
		match self.slot(id) {
			Some(slot) => matches!(&*slot.lock().await, SlotState::Live(handle) if !handle.failed),
			None => false,
		}
	}

	/// Current lease count for `id`, `None` if no channel is registered
	pub async fn refcount(&self, id: &ChannelId) -> Option<usize> {
		let slot = self.slot(id)?;
		let guard = slot.lock().await;
		match &*guard {
			SlotState::Live(handle) => Some(handle.refcount),
			SlotState::Vacant | SlotState::Opening(_) | SlotState::Retired => None,
		}
	}

	pub async fn connection_state(&self, id: &ChannelId) -> Option<ConnectionState> {
		let slot = self.slot(id)?;
		let guard = slot.lock().await;
		match &*guard {
			SlotState::Live(handle) => Some(handle.state),
			SlotState::Vacant | SlotState::Opening(_) | SlotState::Retired => None,
		}
	}
}

/// Single delivery path for one open channel: source -> handle -> listeners
async fn pump(
	slot: Slot,
	mut events: mpsc::Receiver<SourceEvent>,
	closer: CancellationToken,
	generation: u64,
	root: CancellationToken,
	counters: Arc<Counters>,
) {
	loop {
		let next = tokio::select! {
			biased;
			() = closer.cancelled() => break,
			() = root.cancelled() => break,
			next = events.recv() => next,
		};

		let mut guard = slot.lock().await;
		let SlotState::Live(handle) = &mut *guard else {
			break;
		};
		if handle.generation != generation {
			break;
		}

		match next {
			Some(event) => {
				if !handle.on_source_event(event, &counters) {
					break;
				}
			}
			None => {
				handle.fail("source closed the channel".into(), &counters);
				break;
			}
		}
	}

	closer.cancel();
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::{SourceChannel, SourceError, SourcePublisher};
	use async_trait::async_trait;
	use std::time::Duration;

	struct CountingSource {
		opens: AtomicUsize,
		delay: Duration,
		publishers: std::sync::Mutex<Vec<SourcePublisher>>,
	}

	impl CountingSource {
		fn new() -> Arc<Self> {
			Self::slow(Duration::from_millis(5))
		}

		fn slow(delay: Duration) -> Arc<Self> {
			Arc::new(Self {
				opens: AtomicUsize::new(0),
				delay,
				publishers: std::sync::Mutex::new(Vec::new()),
			})
		}
	}

	#[async_trait]
	impl ChannelSource for CountingSource {
		async fn open(&self, id: &ChannelId) -> std::result::Result<SourceChannel, SourceError> {
			if id.as_str() == "missing" {
				return Err(SourceError::UnknownChannel(id.to_string()));
			}
			self.opens.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(self.delay).await;
			let (publisher, channel) = SourceChannel::pair(8);
			self.publishers.lock().unwrap().push(publisher);
			Ok(channel)
		}
	}

	fn registry(source: Arc<CountingSource>) -> ChannelRegistry {
		let config = GatewayConfig::default().with_grace_delay(Duration::from_millis(50));
		ChannelRegistry::new(source, config, CancellationToken::new())
	}

	#[tokio::test]
	async fn test_concurrent_acquire_opens_once() {
		let source = CountingSource::new();
		let registry = registry(Arc::clone(&source));
		let id = ChannelId::new("det1");

		let mut tasks = Vec::new();
		for _ in 0..16 {
			let registry = registry.clone();
			let id = id.clone();
			tasks.push(tokio::spawn(async move {
				let acquired = registry.acquire(&id).await.unwrap();
				drop(acquired);
			}));
		}
		for task in tasks {
			task.await.unwrap();
		}

		assert_eq!(source.opens.load(Ordering::SeqCst), 1);
		assert_eq!(registry.refcount(&id).await, Some(16));
		assert_eq!(registry.open_channels(), 1);
	}

	#[tokio::test]
	async fn test_failed_open_leaves_no_handle() {
		let source = CountingSource::new();
		let registry = registry(Arc::clone(&source));
		let id = ChannelId::new("missing");

		let err = registry.acquire(&id).await.err().unwrap();
		assert!(matches!(err, GatewayError::UnknownIdentifier { .. }));
		assert!(registry.slot(&id).is_none());
		assert_eq!(registry.open_channels(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_release_closes_after_grace() {
		let source = CountingSource::new();
		let registry = registry(Arc::clone(&source));
		let id = ChannelId::new("det1");

		let mut acquired = registry.acquire(&id).await.unwrap();
		let slot = Arc::clone(&acquired.slot);
		registry.release(&slot, acquired.handle());
		drop(acquired);

		assert!(registry.is_open(&id).await, "channel lingers during grace");
		tokio::time::sleep(Duration::from_millis(100)).await;

		assert!(!registry.is_open(&id).await);
		assert!(registry.slot(&id).is_none());
		assert!(source.publishers.lock().unwrap()[0].is_closed());
	}

	#[tokio::test]
	async fn test_shutdown_refuses_new_acquires() {
		let source = CountingSource::new();
		let registry = registry(source);
		let id = ChannelId::new("det1");

		drop(registry.acquire(&id).await.unwrap());
		registry.shutdown().await;

		assert_eq!(registry.open_channels(), 0);
		assert!(matches!(registry.acquire(&id).await, Err(GatewayError::ShuttingDown)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_slot_is_unlocked_while_opening() {
		let source = CountingSource::slow(Duration::from_secs(10));
		let registry = registry(Arc::clone(&source));
		let id = ChannelId::new("det1");

		let opener = {
			let registry = registry.clone();
			let id = id.clone();
			tokio::spawn(async move { registry.acquire(&id).await.map(drop) })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;

		let slot = registry.slot(&id).unwrap();
		assert!(matches!(*slot.try_lock().unwrap(), SlotState::Opening(_)));
		assert_eq!(registry.refcount(&id).await, None);

		opener.await.unwrap().unwrap();
		assert_eq!(registry.refcount(&id).await, Some(1));
		assert_eq!(source.opens.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_abandoned_open_unlinks_slot_and_wakes_waiters() {
		let source = CountingSource::slow(Duration::from_secs(10));
		let registry = registry(Arc::clone(&source));
		let id = ChannelId::new("det1");

		let abandoned = tokio::time::timeout(Duration::from_millis(100), registry.acquire(&id)).await;
		assert!(abandoned.is_err());
		assert!(registry.slot(&id).is_none());
		assert_eq!(registry.open_channels(), 0);

		// a waiter parked behind an abandoned opener takes over the open
		let opener = {
			let registry = registry.clone();
			let id = id.clone();
			tokio::spawn(async move {
				let _ = tokio::time::timeout(Duration::from_millis(100), registry.acquire(&id)).await;
			})
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		let waiter = {
			let registry = registry.clone();
			let id = id.clone();
			tokio::spawn(async move { registry.acquire(&id).await.map(drop) })
		};

		opener.await.unwrap();
		waiter.await.unwrap().unwrap();
		assert_eq!(registry.refcount(&id).await, Some(1));
		assert_eq!(source.opens.load(Ordering::SeqCst), 3);
	}
}

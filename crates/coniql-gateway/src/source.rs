use crate::types::{ChannelDisplay, ChannelId, ChannelQuality, ChannelTime, ChannelValue};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors a source may report when asked to open a channel
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SourceError {
	#[error("unknown channel: {0}")]
	UnknownChannel(String),

	#[error("invalid channel arguments: {0}")]
	InvalidArguments(String),

	#[error("no plugin registered for transport '{0}'")]
	UnknownTransport(String),

	#[error("channel unavailable: {0}")]
	Unavailable(String),
}

/// Events a source produces for one open channel, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
	Connected { display: Option<ChannelDisplay>, mutable: bool },
	Disconnected { reason: String },
	Value { value: ChannelValue, quality: ChannelQuality, time: Option<ChannelTime> },
	/// The source gave up on the channel; no further events follow
	Failed { reason: String },
}

impl SourceEvent {
	pub fn value(value: ChannelValue) -> Self {
		Self::Value {
			value,
			quality: ChannelQuality::Valid,
			time: None,
		}
	}
}

/// Gateway side of one open underlying channel.
///
/// Events arrive on `events` until the source stops or the gateway calls
/// [`SourceChannel::close`], which the producer observes through
/// [`SourcePublisher::closed`].
#[derive(Debug)]
pub struct SourceChannel {
	events: mpsc::Receiver<SourceEvent>,
	closer: CancellationToken,
}

impl SourceChannel {
	/// Create a connected publisher/channel pair with the given buffer
	pub fn pair(buffer: usize) -> (SourcePublisher, Self) {
		let (tx, events) = mpsc::channel(buffer.max(1));
		let closer = CancellationToken::new();

		let publisher = SourcePublisher { tx, closer: closer.clone() };
		(publisher, Self { events, closer })
	}

	pub fn close(&self) {
		self.closer.cancel();
	}

	pub fn close_token(&self) -> CancellationToken {
		self.closer.clone()
	}

	pub(crate) fn into_parts(self) -> (mpsc::Receiver<SourceEvent>, CancellationToken) {
		(self.events, self.closer)
	}
}

/// Producer side handed to the task that talks to the real channel
#[derive(Debug, Clone)]
pub struct SourcePublisher {
	tx: mpsc::Sender<SourceEvent>,
	closer: CancellationToken,
}

impl SourcePublisher {
	/// Push an event; returns false once the gateway has closed the channel
	pub async fn publish(&self, event: SourceEvent) -> bool {
		if self.closer.is_cancelled() {
			return false;
		}
		self.tx.send(event).await.is_ok()
	}

	pub fn is_closed(&self) -> bool {
		self.closer.is_cancelled() || self.tx.is_closed()
	}

	/// Resolves when the gateway closes the channel
	pub async fn closed(&self) {
		tokio::select! {
			() = self.closer.cancelled() => {}
			() = self.tx.closed() => {}
		}
	}
}

/// Capability that opens underlying channels.
///
/// Implementations own reconnect and retry. A failure to open must be
/// reported, not retried silently.
#[async_trait]
pub trait ChannelSource: Send + Sync + 'static {
	async fn open(&self, id: &ChannelId) -> Result<SourceChannel, SourceError>;
}

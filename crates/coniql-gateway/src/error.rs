use crate::session::SessionId;
use crate::source::SourceError;
use crate::types::ChannelId;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
	#[error("channel {id} unavailable: {reason}")]
	ChannelUnavailable { id: ChannelId, reason: String },

	#[error("unknown channel {id}: {reason}")]
	UnknownIdentifier { id: ChannelId, reason: String },

	#[error("no plugin registered for transport '{0}'")]
	UnknownTransport(String),

	#[error("session {0} has been terminated")]
	SessionTerminated(SessionId),

	#[error("timed out after {after:?} waiting for a value from {id}")]
	Timeout { id: ChannelId, after: Duration },

	#[error("invalid gateway configuration: {0}")]
	InvalidConfig(String),

	#[error("gateway is shutting down")]
	ShuttingDown,
}

impl GatewayError {
	pub(crate) fn from_source(id: &ChannelId, err: SourceError) -> Self {
		match err {
			SourceError::UnknownChannel(reason) => Self::UnknownIdentifier { id: id.clone(), reason },
			SourceError::InvalidArguments(reason) => Self::UnknownIdentifier { id: id.clone(), reason },
			SourceError::UnknownTransport(transport) => Self::UnknownTransport(transport),
			SourceError::Unavailable(reason) => Self::ChannelUnavailable { id: id.clone(), reason },
		}
	}

	/// Whether retrying the same request later can succeed
	pub fn is_recoverable(&self) -> bool {
		matches!(self, Self::ChannelUnavailable { .. } | Self::Timeout { .. })
	}
}

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Identifier of a control-system data point, normally a PV name with an
/// optional `transport://` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
	pub fn new(id: impl Into<Arc<str>>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Split `transport://pv` into its parts. Ids without a prefix yield `None`.
	pub fn split_transport(&self) -> (Option<&str>, &str) {
		match self.0.split_once("://") {
			Some((transport, pv)) => (Some(transport), pv),
			None => (None, &self.0),
		}
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for ChannelId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

impl From<String> for ChannelId {
	fn from(id: String) -> Self {
		Self::new(id)
	}
}

/// Connection state of an underlying channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	Connecting,
	Connected,
	Disconnected,
	Closed,
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Connecting => write!(f, "Connecting"),
			Self::Connected => write!(f, "Connected"),
			Self::Disconnected => write!(f, "Disconnected"),
			Self::Closed => write!(f, "Closed"),
		}
	}
}

/// Quality of the current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelQuality {
	/// Value is known, valid, nothing is wrong
	Valid,
	/// Value is known, valid, but in the range generating a warning
	Warning,
	/// Value is known, valid, but in the range generating an alarm condition
	Alarm,
	/// Value is known, but not valid, e.g. a RW before its first put
	Invalid,
	/// Value is unknown, for instance because the channel is disconnected
	Undefined,
	/// The channel is currently in the process of being changed
	Changing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
	pub quality: ChannelQuality,
	pub message: String,
	pub mutable: bool,
}

impl ChannelStatus {
	pub fn new(quality: ChannelQuality, message: impl Into<String>, mutable: bool) -> Self {
		Self {
			quality,
			message: message.into(),
			mutable,
		}
	}

	pub fn undefined(message: impl Into<String>) -> Self {
		Self::new(ChannelQuality::Undefined, message, false)
	}
}

/// Timestamp of a value, split the way channel-access reports it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelTime {
	/// Floating point seconds since the unix epoch
	pub seconds: f64,
	/// Nanoseconds part of `seconds`, at full precision
	pub nanoseconds: u32,
	/// Integer tag whose interpretation is left to the source
	pub user_tag: i32,
}

impl ChannelTime {
	pub fn now() -> Self {
		Self::from_datetime(Utc::now())
	}

	pub fn from_datetime(at: DateTime<Utc>) -> Self {
		let nanoseconds = at.timestamp_subsec_nanos();
		Self {
			seconds: at.timestamp() as f64 + f64::from(nanoseconds) / 1e9,
			nanoseconds,
			user_tag: 0,
		}
	}

	#[must_use]
	pub fn with_user_tag(mut self, user_tag: i32) -> Self {
		self.user_tag = user_tag;
		self
	}

	pub fn datetime(&self) -> Option<DateTime<Utc>> {
		Utc.timestamp_opt(self.seconds.floor() as i64, self.nanoseconds).single()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
	pub min: f64,
	pub max: f64,
}

/// How a channel should be displayed
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelDisplay {
	pub description: String,
	pub units: String,
	pub precision: usize,
	pub range: Option<Range>,
}

/// Raw value carried by a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
	Int(i64),
	Float(f64),
	Text(String),
	FloatArray(Vec<f64>),
}

impl ChannelValue {
	/// The value as a float, `None` if it is not expressible as one
	pub fn to_float(&self) -> Option<f64> {
		match self {
			Self::Float(v) => Some(*v),
			Self::Int(v) => Some(*v as f64),
			Self::Text(s) => s.trim().parse().ok(),
			Self::FloatArray(_) => None,
		}
	}

	/// Render the value as a string with the given precision and optional units
	pub fn format(&self, precision: usize, units: Option<&str>) -> String {
		let body = match self {
			Self::Float(v) => format!("{v:.precision$}"),
			Self::Int(v) => v.to_string(),
			Self::Text(s) => s.clone(),
			Self::FloatArray(values) => {
				let parts: Vec<String> = values.iter().map(|v| format!("{v:.precision$}")).collect();
				format!("[{}]", parts.join(", "))
			}
		};

		match units {
			Some(units) if !units.is_empty() => format!("{body} {units}"),
			_ => body,
		}
	}
}

/// Immutable snapshot of a channel, delivered to every listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEvent {
	pub id: ChannelId,
	pub time: ChannelTime,
	pub value: Option<ChannelValue>,
	pub state: ConnectionState,
	pub status: ChannelStatus,
	pub display: Option<ChannelDisplay>,
	/// Present only on the final event of a channel that failed
	pub error: Option<String>,
}

impl ValueEvent {
	pub fn has_value(&self) -> bool {
		self.value.is_some()
	}

	pub fn is_terminal(&self) -> bool {
		self.error.is_some()
	}

	/// The value as a float, using the same rules as [`ChannelValue::to_float`]
	pub fn float(&self) -> Option<f64> {
		self.value.as_ref().and_then(ChannelValue::to_float)
	}
}

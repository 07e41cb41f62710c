//! Simulated channels for demos and tests, served under the `ssim` transport.
//!
//! Every channel is addressed as `name` or `name(arg, arg, ...)` with numeric
//! arguments; missing trailing arguments take their defaults.

mod channels;

pub use channels::{SimChannel, MAX_RAMP_SIZE};

use crate::source::{ChannelSource, SourceChannel, SourceError};
use crate::types::ChannelId;
use async_trait::async_trait;
use tracing::debug;

pub const SIM_TRANSPORT: &str = "ssim";

#[derive(Debug, Clone)]
pub struct SimSource {
	buffer: usize,
}

impl Default for SimSource {
	fn default() -> Self {
		Self { buffer: 128 }
	}
}

impl SimSource {
	pub fn new(buffer: usize) -> Self {
		Self { buffer }
	}
}

#[async_trait]
impl ChannelSource for SimSource {
	async fn open(&self, id: &ChannelId) -> Result<SourceChannel, SourceError> {
		let channel = SimChannel::parse(id.as_str())?;
		let (publisher, source) = SourceChannel::pair(self.buffer);

		debug!(channel = %id, kind = channel.kind(), "starting simulated channel");
		tokio::spawn(channel.run(publisher));
		Ok(source)
	}
}

/// Split `name(a, b, c)` into the name and its numeric arguments
pub(crate) fn parse_call(raw: &str) -> Result<(&str, Vec<f64>), SourceError> {
	let raw = raw.trim();
	let Some(open) = raw.find('(') else {
		if raw.contains(')') {
			return Err(SourceError::InvalidArguments(format!("unbalanced parentheses in '{raw}'")));
		}
		return Ok((raw, Vec::new()));
	};

	let name = raw[..open].trim();
	let Some(inner) = raw[open + 1..].strip_suffix(')') else {
		return Err(SourceError::InvalidArguments(format!("unbalanced parentheses in '{raw}'")));
	};
	if inner.trim().is_empty() {
		return Ok((name, Vec::new()));
	}

	let args = inner
		.split(',')
		.map(|arg| {
			let arg = arg.trim();
			arg.parse::<f64>()
				.map_err(|_| SourceError::InvalidArguments(format!("'{arg}' is not a number in '{raw}'")))
		})
		.collect::<Result<Vec<f64>, SourceError>>()?;

	Ok((name, args))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::SourceEvent;
	use crate::types::ChannelValue;

	#[test]
	fn test_parse_call() {
		assert_eq!(parse_call("sine").unwrap(), ("sine", vec![]));
		assert_eq!(parse_call("sine()").unwrap(), ("sine", vec![]));
		assert_eq!(parse_call(" sine(-1, 1.5 ,10) ").unwrap(), ("sine", vec![-1.0, 1.5, 10.0]));

		assert!(matches!(parse_call("sine(1,"), Err(SourceError::InvalidArguments(_))));
		assert!(matches!(parse_call("sine(a)"), Err(SourceError::InvalidArguments(_))));
		assert!(matches!(parse_call("sine)"), Err(SourceError::InvalidArguments(_))));
	}

	#[tokio::test]
	async fn test_open_unknown_channel_fails_eagerly() {
		let source = SimSource::default();
		let err = source.open(&ChannelId::new("cosine")).await.err().unwrap();
		assert!(matches!(err, SourceError::UnknownChannel(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_open_sine_produces_values() {
		let source = SimSource::default();
		let channel = source.open(&ChannelId::new("sine(-1,1,4,0.1)")).await.unwrap();
		let (mut events, closer) = channel.into_parts();

		assert!(matches!(events.recv().await, Some(SourceEvent::Connected { display: Some(_), mutable: false })));
		let Some(SourceEvent::Value { value: ChannelValue::Float(first), .. }) = events.recv().await else {
			panic!("expected a float value");
		};
		assert!((first - 0.0).abs() < 1e-9);

		closer.cancel();
		tokio::time::sleep(std::time::Duration::from_secs(1)).await;
		while events.try_recv().is_ok() {}
		assert!(events.recv().await.is_none(), "producer stops once closed");
	}
}

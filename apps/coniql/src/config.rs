use clap::Parser;
use coniql_gateway::{GatewayConfig, SIM_TRANSPORT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(author, version, about = "Live PV subscription gateway", long_about = None)]
pub struct Config {
	/// Use JSON formatting for tracing
	#[arg(long, env = "LOG_JSON", default_value = "false")]
	pub log_json: bool,

	/// Log level
	#[arg(long, env = "RUST_LOG", default_value = "info")]
	pub rust_log: Option<String>,

	/// How long an unused channel stays open, in milliseconds
	#[arg(long, env = "GRACE_DELAY_MS", default_value = "3000", value_parser = parse_millis)]
	pub grace_delay_ms: Duration,

	/// Events buffered per listener before the oldest is dropped
	#[arg(long, env = "LISTENER_CAPACITY", default_value = "64")]
	pub listener_capacity: usize,

	/// Events buffered between a source and its channel
	#[arg(long, env = "SOURCE_BUFFER", default_value = "128")]
	pub source_buffer: usize,

	/// Transport used for ids without a prefix
	#[arg(long, env = "DEFAULT_TRANSPORT", default_value = SIM_TRANSPORT)]
	pub default_transport: String,

	/// Number of demo sessions subscribing to every channel
	#[arg(long, env = "SESSIONS", default_value = "2")]
	pub sessions: usize,

	/// Stop after this many seconds instead of waiting for Ctrl+C
	#[arg(long, env = "RUN_FOR_SECS", value_parser = parse_secs)]
	pub run_for_secs: Option<Duration>,

	/// Channels to subscribe to, e.g. `sine(-5,5)` or `ssim://rampwave(8)`.
	/// From the environment they are separated by `;`.
	#[arg(env = "CHANNELS", value_delimiter = ';', default_value = "sine")]
	pub channels: Vec<String>,
}

impl Config {
	pub fn gateway(&self) -> GatewayConfig {
		GatewayConfig::default()
			.with_grace_delay(self.grace_delay_ms)
			.with_listener_capacity(self.listener_capacity)
			.with_source_buffer(self.source_buffer)
	}
}

fn parse_millis(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_millis)
}

fn parse_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}

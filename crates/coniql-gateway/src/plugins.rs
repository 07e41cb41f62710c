use crate::error::{GatewayError, Result};
use crate::source::{ChannelSource, SourceChannel, SourceError};
use crate::types::ChannelId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A named device channel backed by one or two PVs. Subscriptions follow
/// `read_pv`, falling back to `write_pv` for write-only devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
	pub read_pv: Option<String>,
	pub write_pv: Option<String>,
}

impl ChannelConfig {
	pub fn read(pv: impl Into<String>) -> Self {
		Self {
			read_pv: Some(pv.into()),
			write_pv: None,
		}
	}

	#[must_use]
	pub fn with_write_pv(mut self, pv: impl Into<String>) -> Self {
		self.write_pv = Some(pv.into());
		self
	}

	/// The PV a subscription reads from
	pub fn pv(&self) -> Option<&str> {
		self.read_pv.as_deref().or(self.write_pv.as_deref())
	}
}

/// Routes `transport://pv` identifiers to the plugin registered for
/// `transport`. Ids without a prefix go to the default transport, and
/// configured device names resolve to their PV first.
#[derive(Clone)]
pub struct PluginStore {
	default_transport: String,
	plugins: HashMap<String, Arc<dyn ChannelSource>>,
	devices: HashMap<String, ChannelConfig>,
}

impl PluginStore {
	pub fn new(default_transport: impl Into<String>) -> Self {
		Self {
			default_transport: default_transport.into(),
			plugins: HashMap::new(),
			devices: HashMap::new(),
		}
	}

	#[must_use]
	pub fn with_plugin(mut self, transport: impl Into<String>, plugin: Arc<dyn ChannelSource>) -> Self {
		self.add_plugin(transport, plugin);
		self
	}

	pub fn add_plugin(&mut self, transport: impl Into<String>, plugin: Arc<dyn ChannelSource>) {
		let transport = transport.into();
		debug!(%transport, "registering channel plugin");
		self.plugins.insert(transport, plugin);
	}

	#[must_use]
	pub fn with_device(mut self, name: impl Into<String>, config: ChannelConfig) -> Self {
		self.add_device(name, config);
		self
	}

	pub fn add_device(&mut self, name: impl Into<String>, config: ChannelConfig) {
		let name = name.into();
		debug!(device = %name, pv = ?config.pv(), "registering device channel");
		self.devices.insert(name, config);
	}

	pub fn device(&self, name: &str) -> Option<&ChannelConfig> {
		self.devices.get(name)
	}

	pub fn default_transport(&self) -> &str {
		&self.default_transport
	}

	/// Registered transport names, sorted
	pub fn transports(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	/// Canonical form of a raw id, so `sine` and `ssim://sine` share one
	/// channel when `ssim` is the default. A device name becomes its PV.
	pub fn normalize(&self, raw: &str) -> Result<ChannelId> {
		let raw = raw.trim();
		match self.devices.get(raw) {
			Some(config) => {
				let pv = config.pv().ok_or_else(|| GatewayError::UnknownIdentifier {
					id: ChannelId::new(raw),
					reason: "device has no read or write pv".into(),
				})?;
				self.canonical(pv.trim())
			}
			None => self.canonical(raw),
		}
	}

	fn canonical(&self, raw: &str) -> Result<ChannelId> {
		let (transport, pv) = match raw.split_once("://") {
			Some((transport, pv)) => (transport, pv),
			None => (self.default_transport.as_str(), raw),
		};

		if !self.plugins.contains_key(transport) {
			return Err(GatewayError::UnknownTransport(transport.to_string()));
		}
		if pv.is_empty() {
			return Err(GatewayError::UnknownIdentifier {
				id: ChannelId::new(raw),
				reason: "empty channel name".into(),
			});
		}
		Ok(ChannelId::new(format!("{transport}://{pv}")))
	}

	fn route<'a>(
		&'a self,
		id: &'a ChannelId,
	) -> std::result::Result<(&'a dyn ChannelSource, &'a str), SourceError> {
		let (transport, pv) = id.split_transport();
		let transport = transport.unwrap_or(self.default_transport.as_str());
		let plugin = self
			.plugins
			.get(transport)
			.ok_or_else(|| SourceError::UnknownTransport(transport.to_string()))?;
		Ok((plugin.as_ref(), pv))
	}
}

#[async_trait]
impl ChannelSource for PluginStore {
	async fn open(&self, id: &ChannelId) -> std::result::Result<SourceChannel, SourceError> {
		let (plugin, pv) = self.route(id)?;
		plugin.open(&ChannelId::new(pv)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	#[derive(Default)]
	struct Recorder {
		opened: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl ChannelSource for Recorder {
		async fn open(&self, id: &ChannelId) -> std::result::Result<SourceChannel, SourceError> {
			self.opened.lock().unwrap().push(id.to_string());
			Ok(SourceChannel::pair(1).1)
		}
	}

	#[test]
	fn test_normalize_applies_default_transport() {
		let store = PluginStore::new("ssim").with_plugin("ssim", Arc::new(Recorder::default()));

		assert_eq!(store.normalize("sine").unwrap(), ChannelId::new("ssim://sine"));
		assert_eq!(store.normalize(" ssim://sine ").unwrap(), ChannelId::new("ssim://sine"));
		assert!(matches!(store.normalize("ca://det1"), Err(GatewayError::UnknownTransport(t)) if t == "ca"));
		assert!(matches!(store.normalize("ssim://"), Err(GatewayError::UnknownIdentifier { .. })));
	}

	#[tokio::test]
	async fn test_open_strips_prefix_and_routes() {
		let sim = Arc::new(Recorder::default());
		let ca = Arc::new(Recorder::default());
		let store = PluginStore::new("ssim").with_plugin("ssim", sim.clone()).with_plugin("ca", ca.clone());

		store.open(&ChannelId::new("ssim://sine(-1,1)")).await.unwrap();
		store.open(&ChannelId::new("ca://BL01:DET1")).await.unwrap();
		store.open(&ChannelId::new("rampwave")).await.unwrap();

		assert_eq!(*sim.opened.lock().unwrap(), vec!["sine(-1,1)", "rampwave"]);
		assert_eq!(*ca.opened.lock().unwrap(), vec!["BL01:DET1"]);
		assert_eq!(store.transports(), vec!["ca", "ssim"]);
	}

	#[test]
	fn test_device_names_resolve_to_their_pv() {
		let store = PluginStore::new("ssim")
			.with_plugin("ssim", Arc::new(Recorder::default()))
			.with_plugin("ca", Arc::new(Recorder::default()))
			.with_device(
				"stage.x",
				ChannelConfig::read("ca://BL07I-MO-01:X.RBV").with_write_pv("ca://BL07I-MO-01:X"),
			)
			.with_device("shutter", ChannelConfig { read_pv: None, write_pv: Some("sine".into()) })
			.with_device("empty", ChannelConfig::default())
			.with_device("offline", ChannelConfig::read("pva://BL07I:X"));

		assert_eq!(store.normalize("stage.x").unwrap(), ChannelId::new("ca://BL07I-MO-01:X.RBV"));
		assert_eq!(store.normalize("shutter").unwrap(), ChannelId::new("ssim://sine"));
		assert_eq!(store.device("stage.x").and_then(|d| d.write_pv.as_deref()), Some("ca://BL07I-MO-01:X"));
		assert!(matches!(store.normalize("empty"), Err(GatewayError::UnknownIdentifier { .. })));
		assert!(matches!(store.normalize("offline"), Err(GatewayError::UnknownTransport(t)) if t == "pva"));
		assert_eq!(store.normalize("stage.y").unwrap(), ChannelId::new("ssim://stage.y"));
	}

	#[tokio::test]
	async fn test_open_unknown_transport() {
		let store = PluginStore::new("ssim");
		let err = store.open(&ChannelId::new("pva://x")).await.err().unwrap();
		assert_eq!(err, SourceError::UnknownTransport("pva".into()));
	}
}

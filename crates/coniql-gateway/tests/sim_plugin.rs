#[cfg(test)]
mod tests {
	use coniql_gateway::*;
	use std::sync::Arc;
	use std::time::Duration;

	fn store() -> PluginStore {
		PluginStore::new(SIM_TRANSPORT).with_plugin(SIM_TRANSPORT, Arc::new(SimSource::default()))
	}

	fn sim_hub() -> (PluginStore, SubscriptionHub) {
		let store = store();
		let hub = SubscriptionHub::new(Arc::new(store.clone()), GatewayConfig::default()).unwrap();
		(store, hub)
	}

	async fn next(sub: &mut Subscription) -> ValueEvent {
		tokio::time::timeout(Duration::from_secs(30), sub.recv()).await.unwrap().unwrap()
	}

	#[tokio::test(start_paused = true)]
	async fn test_prefixed_and_bare_ids_share_one_channel() {
		let (store, hub) = sim_hub();
		let bare = store.normalize("sine(-1, 1, 4, 0.5)").unwrap();
		let prefixed = store.normalize("ssim://sine(-1, 1, 4, 0.5)").unwrap();
		assert_eq!(bare, prefixed);

		let a = hub.open_session();
		let b = hub.open_session();
		let mut sub_a = hub.subscribe(&a, &bare).await.unwrap();
		let mut sub_b = hub.subscribe(&b, &prefixed).await.unwrap();
		assert_eq!(hub.registry().open_channels(), 1);

		let connected = next(&mut sub_a).await;
		assert_eq!(connected.state, ConnectionState::Connected);
		assert_eq!(connected.display.as_ref().and_then(|d| d.range), Some(Range { min: -1.0, max: 1.0 }));

		let value = next(&mut sub_a).await;
		assert!(value.float().is_some());
		assert_eq!(next(&mut sub_b).await.state, ConnectionState::Connected);
	}

	#[tokio::test(start_paused = true)]
	async fn test_disconnector_flips_state() {
		let (store, hub) = sim_hub();
		let id = store.normalize("disconnector(0.1)").unwrap();
		let session = hub.open_session();
		let mut sub = hub.subscribe(&session, &id).await.unwrap();

		let mut states = Vec::new();
		while states.len() < 4 {
			states.push(next(&mut sub).await.state);
		}
		assert_eq!(
			states,
			vec![
				ConnectionState::Connected,
				ConnectionState::Connected,
				ConnectionState::Disconnected,
				ConnectionState::Connected,
			]
		);
	}

	#[tokio::test]
	async fn test_unknown_sim_channel_is_rejected() {
		let (store, hub) = sim_hub();
		let session = hub.open_session();

		let err = hub.subscribe(&session, &store.normalize("triangle").unwrap()).await.unwrap_err();
		assert!(matches!(err, GatewayError::UnknownIdentifier { .. }));

		let err = hub.subscribe(&session, &store.normalize("sine(1, 2, x)").unwrap()).await.unwrap_err();
		assert!(matches!(err, GatewayError::UnknownIdentifier { .. }));

		assert!(matches!(store.normalize("pva://det1"), Err(GatewayError::UnknownTransport(_))));
		assert_eq!(hub.stats().open_channels, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_get_reads_one_value() {
		let (store, hub) = sim_hub();
		let id = store.normalize("randomwalk(5, 0)").unwrap();

		let event = hub.get(&id, None).await.unwrap();
		assert_eq!(event.float(), Some(5.0));
		assert_eq!(event.status.quality, ChannelQuality::Valid);
	}
}

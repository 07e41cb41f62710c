mod config;

use anyhow::Context;
use clap::Parser;
use coniql_gateway::{ClientSession, PluginStore, SimSource, Subscription, SubscriptionHub, SIM_TRANSPORT};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt::format::JsonFields, util::SubscriberInitExt, Layer};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	dotenv::dotenv().ok();

	let config = Config::parse();
	init_tracing(&config);

	let store = PluginStore::new(config.default_transport.clone())
		.with_plugin(SIM_TRANSPORT, Arc::new(SimSource::new(config.source_buffer)));
	let channels = config
		.channels
		.iter()
		.map(|raw| store.normalize(raw).with_context(|| format!("invalid channel '{raw}'")))
		.collect::<anyhow::Result<Vec<_>>>()?;

	let hub = SubscriptionHub::new(Arc::new(store), config.gateway()).context("could not start gateway")?;
	info!(channels = channels.len(), sessions = config.sessions, "gateway started");

	let mut tasks = Vec::new();
	for _ in 0..config.sessions {
		let session = hub.open_session();
		for id in &channels {
			match hub.subscribe(&session, id).await {
				Ok(subscription) => tasks.push(forward(session.clone(), subscription)),
				Err(e) => warn!(session = %session.id(), channel = %id, error = %e, "subscribe failed"),
			}
		}
	}

	match config.run_for_secs {
		Some(run_for) => {
			tokio::select! {
				() = tokio::time::sleep(run_for) => info!("run time elapsed"),
				signal = tokio::signal::ctrl_c() => log_signal(signal),
			}
		}
		None => log_signal(tokio::signal::ctrl_c().await),
	}

	hub.shutdown().await;
	for result in futures::future::join_all(tasks).await {
		if let Err(e) = result {
			error!(error = %e, "forwarding task panicked");
		}
	}

	let stats = hub.stats();
	info!(
		channels_opened = stats.channels_opened,
		channels_closed = stats.channels_closed,
		events_delivered = stats.events_delivered,
		events_dropped = stats.events_dropped,
		"gateway stopped"
	);
	Ok(())
}

/// Log every event of one subscription until it ends or its session goes away
fn forward(session: ClientSession, mut subscription: Subscription) -> JoinHandle<()> {
	let token = session.cancellation_token();
	tokio::spawn(async move {
		loop {
			let event = tokio::select! {
				() = token.cancelled() => break,
				event = subscription.next() => event,
			};
			let Some(event) = event else {
				break;
			};

			match serde_json::to_string(&event) {
				Ok(json) => info!(session = %session.id(), event = %json, "value"),
				Err(e) => warn!(channel = %event.id, error = %e, "could not encode event"),
			}
		}

		if subscription.missed() > 0 {
			warn!(
				session = %session.id(),
				channel = %subscription.channel_id(),
				missed = subscription.missed(),
				"listener fell behind"
			);
		}
	})
}

fn log_signal(signal: std::io::Result<()>) {
	match signal {
		Ok(()) => info!("received shutdown signal"),
		Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
	}
}

pub fn init_tracing(config: &Config) -> Option<()> {
	use std::str::FromStr;
	use tracing_subscriber::layer::SubscriberExt;

	let filter = EnvFilter::from_str(config.rust_log.as_deref()?).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::registry()
		.with(if config.log_json {
			Box::new(
				tracing_subscriber::fmt::layer()
					.fmt_fields(JsonFields::default())
					.event_format(
						tracing_subscriber::fmt::format().json().flatten_event(true).with_span_list(false),
					)
					.with_filter(filter),
			) as Box<dyn Layer<_> + Send + Sync>
		} else {
			Box::new(
				tracing_subscriber::fmt::layer()
					.event_format(tracing_subscriber::fmt::format().pretty())
					.with_filter(filter),
			)
		})
		.init();
	None
}

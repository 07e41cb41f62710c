use super::parse_call;
use crate::source::{SourceError, SourceEvent, SourcePublisher};
use crate::types::{ChannelDisplay, ChannelQuality, ChannelTime, ChannelValue, Range};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::f64::consts::TAU;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Largest `rampwave` array; every tick allocates one of this size
pub const MAX_RAMP_SIZE: usize = 1 << 20;

/// One simulated channel and its generator state
#[derive(Debug, Clone, PartialEq)]
pub enum SimChannel {
	/// `sine(min, max, steps, update_seconds, warning_percent, alarm_percent)`
	Sine {
		min: f64,
		max: f64,
		steps: u32,
		update: Duration,
		warning_percent: f64,
		alarm_percent: f64,
	},
	/// `rampwave(size, update_seconds)`: an array ramp that shifts every tick
	RampWave { size: usize, update: Duration },
	/// `randomwalk(start, step, update_seconds)`
	RandomWalk { current: f64, step: f64, update: Duration },
	/// `disconnector(update_seconds)`: alternates between connected and not
	Disconnector { update: Duration },
}

impl SimChannel {
	pub fn parse(raw: &str) -> Result<Self, SourceError> {
		let (name, args) = parse_call(raw)?;

		let channel = match name {
			"sine" => {
				expect_at_most(raw, &args, 6)?;
				let min = arg(&args, 0, -5.0);
				let max = arg(&args, 1, 5.0);
				if max <= min {
					return Err(SourceError::InvalidArguments(format!("max must exceed min in '{raw}'")));
				}
				Self::Sine {
					min,
					max,
					steps: count(raw, arg(&args, 2, 10.0))?,
					update: period(raw, arg(&args, 3, 1.0))?,
					warning_percent: arg(&args, 4, 80.0),
					alarm_percent: arg(&args, 5, 90.0),
				}
			}
			"rampwave" => {
				expect_at_most(raw, &args, 2)?;
				let size = count(raw, arg(&args, 0, 10.0))? as usize;
				if size > MAX_RAMP_SIZE {
					return Err(SourceError::InvalidArguments(format!(
						"rampwave size is limited to {MAX_RAMP_SIZE}, got {size} in '{raw}'"
					)));
				}
				Self::RampWave {
					size,
					update: period(raw, arg(&args, 1, 1.0))?,
				}
			}
			"randomwalk" => {
				expect_at_most(raw, &args, 3)?;
				let step = arg(&args, 1, 1.0);
				if !(step >= 0.0 && step.is_finite()) {
					return Err(SourceError::InvalidArguments(format!(
						"step must be a non-negative number in '{raw}'"
					)));
				}
				Self::RandomWalk {
					current: arg(&args, 0, 0.0),
					step,
					update: period(raw, arg(&args, 2, 1.0))?,
				}
			}
			"disconnector" => {
				expect_at_most(raw, &args, 1)?;
				Self::Disconnector {
					update: period(raw, arg(&args, 0, 1.0))?,
				}
			}
			other => return Err(SourceError::UnknownChannel(format!("no simulated channel named '{other}'"))),
		};

		Ok(channel)
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Self::Sine { .. } => "sine",
			Self::RampWave { .. } => "rampwave",
			Self::RandomWalk { .. } => "randomwalk",
			Self::Disconnector { .. } => "disconnector",
		}
	}

	pub fn update(&self) -> Duration {
		match self {
			Self::Sine { update, .. }
			| Self::RampWave { update, .. }
			| Self::RandomWalk { update, .. }
			| Self::Disconnector { update } => *update,
		}
	}

	pub fn display(&self) -> ChannelDisplay {
		match self {
			Self::Sine { min, max, .. } => ChannelDisplay {
				description: "A sine value generator".into(),
				units: String::new(),
				precision: 5,
				range: Some(Range { min: *min, max: *max }),
			},
			Self::RampWave { size, .. } => ChannelDisplay {
				description: "A ramp wave array generator".into(),
				units: String::new(),
				precision: 0,
				range: Some(Range { min: 0.0, max: (*size - 1) as f64 }),
			},
			Self::RandomWalk { .. } => ChannelDisplay {
				description: "A random walk generator".into(),
				units: String::new(),
				precision: 3,
				range: None,
			},
			Self::Disconnector { .. } => ChannelDisplay {
				description: "A channel that connects and disconnects".into(),
				..ChannelDisplay::default()
			},
		}
	}

	/// Events for the `tick`-th update
	pub(crate) fn step(&mut self, tick: u64, rng: &mut impl Rng) -> Vec<SourceEvent> {
		match self {
			Self::Sine {
				min,
				max,
				steps,
				warning_percent,
				alarm_percent,
				..
			} => {
				let mid = (*min + *max) / 2.0;
				let amplitude = (*max - *min) / 2.0;
				let phase = (tick % u64::from(*steps)) as f64 / f64::from(*steps);
				let value = amplitude.mul_add((TAU * phase).sin(), mid);

				let deviation = (value - mid).abs() / amplitude * 100.0;
				let quality = if deviation >= *alarm_percent {
					ChannelQuality::Alarm
				} else if deviation >= *warning_percent {
					ChannelQuality::Warning
				} else {
					ChannelQuality::Valid
				};
				vec![timed(ChannelValue::Float(value), quality)]
			}
			Self::RampWave { size, .. } => {
				let offset = (tick % *size as u64) as usize;
				let ramp = (0..*size).map(|i| ((i + offset) % *size) as f64).collect();
				vec![timed(ChannelValue::FloatArray(ramp), ChannelQuality::Valid)]
			}
			Self::RandomWalk { current, step, .. } => {
				if tick > 0 && *step > 0.0 {
					*current += rng.gen_range(-*step..=*step);
				}
				vec![timed(ChannelValue::Float(*current), ChannelQuality::Valid)]
			}
			Self::Disconnector { .. } => {
				if tick % 2 == 0 {
					vec![
						SourceEvent::Connected {
							display: Some(self.display()),
							mutable: false,
						},
						timed(ChannelValue::Int(tick as i64 / 2), ChannelQuality::Valid),
					]
				} else {
					vec![SourceEvent::Disconnected {
						reason: "simulated disconnect".into(),
					}]
				}
			}
		}
	}

	/// Produce events until the gateway closes the channel
	pub(crate) async fn run(mut self, publisher: SourcePublisher) {
		let kind = self.kind();
		if !matches!(self, Self::Disconnector { .. }) {
			let connected = SourceEvent::Connected {
				display: Some(self.display()),
				mutable: false,
			};
			if !publisher.publish(connected).await {
				return;
			}
		}

		let mut rng = StdRng::from_entropy();
		let mut ticker = tokio::time::interval(self.update());
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut tick = 0u64;
		'produce: loop {
			tokio::select! {
				() = publisher.closed() => break,
				_ = ticker.tick() => {}
			}

			for event in self.step(tick, &mut rng) {
				if !publisher.publish(event).await {
					break 'produce;
				}
			}
			tick += 1;
		}

		debug!(kind, ticks = tick, "simulated channel stopped");
	}
}

fn timed(value: ChannelValue, quality: ChannelQuality) -> SourceEvent {
	SourceEvent::Value {
		value,
		quality,
		time: Some(ChannelTime::now()),
	}
}

fn arg(args: &[f64], index: usize, default: f64) -> f64 {
	args.get(index).copied().unwrap_or(default)
}

fn expect_at_most(raw: &str, args: &[f64], max: usize) -> Result<(), SourceError> {
	if args.len() > max {
		return Err(SourceError::InvalidArguments(format!(
			"'{raw}' takes at most {max} arguments, got {}",
			args.len()
		)));
	}
	Ok(())
}

fn count(raw: &str, value: f64) -> Result<u32, SourceError> {
	if value < 1.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
		return Err(SourceError::InvalidArguments(format!(
			"expected a positive whole number, got {value} in '{raw}'"
		)));
	}
	Ok(value as u32)
}

fn period(raw: &str, seconds: f64) -> Result<Duration, SourceError> {
	match Duration::try_from_secs_f64(seconds) {
		Ok(update) if !update.is_zero() => Ok(update),
		_ => Err(SourceError::InvalidArguments(format!(
			"update_seconds must be positive, got {seconds} in '{raw}'"
		))),
	}
}

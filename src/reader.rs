//! Per-sensor polling loop: acquire, decode, calibrate, publish.

use crate::{
    core::{
        modbus::{decode_scaled_from_registers, RegisterRequest},
        text::decode_measurement_line,
        CalibrationCurve, DecodeError, DeviceConnectionState, Reading, ReadingFault,
    },
    supervisor::Registry,
    Error, LineChannel, RegisterChannel,
};

use futures::FutureExt;
use std::{sync::Arc, time::Duration};
use stream_cancel::Tripwire;

pub const DEFAULT_TEXT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Polling,
    Updated,
    Faulted,
    Stopped,
}

/// Result of a single poll cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PollOutcome {
    /// A new value was stored.
    Updated(f64),
    /// The device delivered something that is not a measurement.
    Invalid(DecodeError),
    /// Nothing arrived in time, the previous reading stays as it is.
    Stale,
    /// The channel failed or could not be opened.
    Faulted,
}

/// Poll interval and the ceiling for the retry delay after faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub max_backoff: Duration,
}

impl Schedule {
    pub fn new(interval: Duration, max_backoff: Duration) -> Self {
        Self {
            interval,
            max_backoff: max_backoff.max(interval),
        }
    }
}

/// Doubles the delay after every faulted poll, up to a ceiling.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            base: schedule.interval,
            max: schedule.max_backoff.max(schedule.interval),
            current: schedule.interval,
        }
    }

    pub fn next_delay(&mut self, faulted: bool) -> Duration {
        self.current = if faulted {
            self.current.saturating_mul(2).min(self.max)
        } else {
            self.base
        };
        self.current
    }
}

pub enum Acquisition {
    Text(Box<dyn LineChannel>),
    Registers {
        channel: Box<dyn RegisterChannel>,
        request: RegisterRequest,
        scale: f64,
        curve: Option<CalibrationCurve>,
    },
}

pub struct SensorReader {
    tag: String,
    acquisition: Acquisition,
    schedule: Schedule,
    state: ReaderState,
    connected: bool,
}

impl SensorReader {
    pub fn new(tag: impl Into<String>, acquisition: Acquisition, schedule: Schedule) -> Self {
        Self {
            tag: tag.into(),
            acquisition,
            schedule,
            state: ReaderState::Idle,
            connected: false,
        }
    }

    /// A sensor that streams ASCII measurements.
    pub fn text(
        tag: impl Into<String>,
        channel: impl LineChannel + 'static,
        schedule: Schedule,
    ) -> Self {
        Self::new(tag, Acquisition::Text(Box::new(channel)), schedule)
    }

    /// A sensor behind a register bus. The leading register is multiplied
    /// by `scale` and then passed through `curve`, if any.
    pub fn registers(
        tag: impl Into<String>,
        channel: impl RegisterChannel + 'static,
        request: RegisterRequest,
        scale: f64,
        curve: Option<CalibrationCurve>,
        schedule: Schedule,
    ) -> Self {
        Self::new(
            tag,
            Acquisition::Registers {
                channel: Box::new(channel),
                request,
                scale,
                curve,
            },
            schedule,
        )
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Whether the last poll reached the device.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Run one acquisition cycle and store the result under this tag.
    pub async fn poll_once(&mut self, registry: &Registry) -> PollOutcome {
        self.state = ReaderState::Polling;
        let tag = self.tag.as_str();
        let outcome = match &mut self.acquisition {
            Acquisition::Text(channel) => poll_text(tag, channel.as_mut(), registry).await,
            Acquisition::Registers {
                channel,
                request,
                scale,
                curve,
            } => {
                poll_registers(
                    tag,
                    channel.as_mut(),
                    *request,
                    *scale,
                    curve.as_ref(),
                    registry,
                )
                .await
            }
        };
        self.connected = registry.get(tag).map_or(false, |status| status.connected);
        self.state = match outcome {
            PollOutcome::Updated(_) | PollOutcome::Invalid(_) => ReaderState::Updated,
            PollOutcome::Faulted => ReaderState::Faulted,
            PollOutcome::Stale => ReaderState::Polling,
        };
        outcome
    }

    /// Poll until the tripwire fires, then close the channel.
    ///
    /// I/O calls are never interrupted, their own timeouts bound how long
    /// a shutdown may take. Only the idle delay between polls is cut short.
    pub async fn run(mut self, registry: Arc<Registry>, tripwire: Tripwire) {
        let mut backoff = Backoff::new(self.schedule);
        loop {
            if is_tripped(&tripwire) {
                break;
            }
            let outcome = self.poll_once(&registry).await;
            let delay = backoff.next_delay(outcome == PollOutcome::Faulted);
            if outcome == PollOutcome::Faulted && delay > self.schedule.interval {
                log::debug!("Retrying {} in {:?}", self.tag, delay);
            }
            if is_tripped(&tripwire) {
                break;
            }
            tokio::select! {
                _ = tripwire.clone() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.close().await;
        log::info!("Stopped reader for {}", self.tag);
    }

    pub async fn close(&mut self) {
        match &mut self.acquisition {
            Acquisition::Text(channel) => channel.close().await,
            Acquisition::Registers { channel, .. } => channel.close().await,
        }
        self.connected = false;
        self.state = ReaderState::Stopped;
    }
}

fn is_tripped(tripwire: &Tripwire) -> bool {
    matches!(tripwire.clone().now_or_never(), Some(true))
}

async fn poll_text(tag: &str, channel: &mut dyn LineChannel, registry: &Registry) -> PollOutcome {
    if channel.state() != DeviceConnectionState::Connected {
        if let Err(err) = channel.open().await {
            log::warn!("{}: {}", tag, err);
            registry.update(tag, |status| status.unreachable());
            return PollOutcome::Faulted;
        }
        registry.update(tag, |status| status.connected = true);
    }
    match channel.poll_line().await {
        Some(line) => match decode_measurement_line(&line) {
            Ok(value) => {
                registry.update(tag, |status| status.record(Reading::Value(value), true));
                PollOutcome::Updated(value)
            }
            Err(err) => {
                log::warn!("{}: cannot decode {:?} from {}: {}", tag, line, channel.name(), err);
                registry.update(tag, |status| {
                    status.record(Reading::Error(ReadingFault::Decode), true)
                });
                PollOutcome::Invalid(err)
            }
        },
        None if channel.state() == DeviceConnectionState::Faulted => {
            let at = channel.last_fault();
            registry.update(tag, |status| status.fault(ReadingFault::Offline, at));
            channel.close().await;
            PollOutcome::Faulted
        }
        None => PollOutcome::Stale,
    }
}

async fn poll_registers(
    tag: &str,
    channel: &mut dyn RegisterChannel,
    request: RegisterRequest,
    scale: f64,
    curve: Option<&CalibrationCurve>,
    registry: &Registry,
) -> PollOutcome {
    match channel.read_registers(request).await {
        Ok(registers) => match decode_scaled_from_registers(&registers, scale) {
            Ok(raw) => {
                let value = curve.map_or(raw, |curve| curve.map(raw));
                log::debug!("{}: raw {} calibrated {}", tag, raw, value);
                registry.update(tag, |status| status.record(Reading::Value(value), true));
                PollOutcome::Updated(value)
            }
            Err(err) => {
                log::warn!("{}: cannot decode registers {:?}: {}", tag, registers, err);
                registry.update(tag, |status| {
                    status.record(Reading::Error(ReadingFault::Decode), true)
                });
                PollOutcome::Invalid(err)
            }
        },
        Err(Error::ChannelOpen { port, source }) => {
            log::warn!("{}: cannot open {}: {}", tag, port, source);
            registry.update(tag, |status| status.unreachable());
            PollOutcome::Faulted
        }
        Err(err) => {
            log::warn!("{}: {}", tag, err);
            let at = channel.last_fault();
            registry.update(tag, |status| status.fault(ReadingFault::Bus, at));
            PollOutcome::Faulted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::modbus::{OXYGEN_CALIBRATION, OXYGEN_REQUEST, OXYGEN_SCALE},
        mock::{LineEvent, MockLineChannel, MockRegisterChannel, RegisterEvent},
    };
    use std::time::Instant;

    fn schedule() -> Schedule {
        let _ = env_logger::builder().is_test(true).try_init();
        Schedule::new(Duration::from_millis(5), Duration::from_millis(40))
    }

    fn reading(registry: &Registry, tag: &str) -> Reading {
        registry.get(tag).unwrap().reading.reading
    }

    #[tokio::test]
    async fn unparseable_line_is_an_error_not_zero() {
        let registry = Registry::new();
        let (channel, proxy) = MockLineChannel::new("sonde");
        proxy.push(LineEvent::Line("0".to_owned()));
        proxy.push(LineEvent::Line("#ERR".to_owned()));
        let mut reader = SensorReader::text("Sonde", channel, schedule());
        assert_eq!(ReaderState::Idle, reader.state());

        assert_eq!(PollOutcome::Updated(0.0), reader.poll_once(&registry).await);
        assert_eq!(Reading::Value(0.0), reading(&registry, "Sonde"));
        assert_eq!(ReaderState::Updated, reader.state());

        let outcome = reader.poll_once(&registry).await;
        assert_eq!(PollOutcome::Invalid(DecodeError::InvalidInput), outcome);
        assert_eq!(
            Reading::Error(ReadingFault::Decode),
            reading(&registry, "Sonde")
        );
        // The link itself is fine
        assert!(reader.is_connected());
        assert!(registry.get("Sonde").unwrap().connected);
    }

    #[tokio::test]
    async fn silence_leaves_previous_reading() {
        let registry = Registry::new();
        let (channel, proxy) = MockLineChannel::new("sonde");
        proxy.push(LineEvent::Line("6.8".to_owned()));
        proxy.push(LineEvent::Silence);
        let mut reader = SensorReader::text("pH", channel, schedule());

        reader.poll_once(&registry).await;
        let before = registry.get("pH").unwrap();
        assert_eq!(PollOutcome::Stale, reader.poll_once(&registry).await);
        assert_eq!(before, registry.get("pH").unwrap());
        assert_eq!(1, proxy.opens());
    }

    #[tokio::test]
    async fn fault_closes_and_reopens() {
        let registry = Registry::new();
        let (channel, proxy) = MockLineChannel::new("sonde");
        proxy.push(LineEvent::Line("6.8".to_owned()));
        proxy.push(LineEvent::Fault);
        proxy.push(LineEvent::Line("6.9".to_owned()));
        let mut reader = SensorReader::text("pH", channel, schedule());

        reader.poll_once(&registry).await;
        assert_eq!(PollOutcome::Faulted, reader.poll_once(&registry).await);
        let status = registry.get("pH").unwrap();
        assert_eq!(Reading::Error(ReadingFault::Offline), status.reading.reading);
        assert!(!status.connected);
        assert!(status.last_fault.is_some());
        assert_eq!(1, proxy.closes());
        assert_eq!(ReaderState::Faulted, reader.state());

        assert_eq!(PollOutcome::Updated(6.9), reader.poll_once(&registry).await);
        assert_eq!(2, proxy.opens());
        assert!(registry.get("pH").unwrap().connected);
    }

    #[tokio::test]
    async fn never_connecting_sensor_shows_no_data() {
        let registry = Registry::new();
        let (channel, proxy) = MockLineChannel::new("missing");
        proxy.set_open_failure(true);
        let mut reader = SensorReader::text("NH4", channel, schedule());

        for _ in 0..3 {
            assert_eq!(PollOutcome::Faulted, reader.poll_once(&registry).await);
        }
        let status = registry.get("NH4").unwrap();
        assert_eq!(Reading::NoData, status.reading.reading);
        assert!(!status.connected);
        assert_eq!(3, proxy.opens());
        assert_eq!(0, proxy.reads());
    }

    #[tokio::test]
    async fn registers_are_scaled_and_calibrated() {
        let registry = Registry::new();
        let (channel, proxy) = MockRegisterChannel::new("bus");
        proxy.push(RegisterEvent::Registers(vec![8340]));
        proxy.push(RegisterEvent::Registers(vec![10000]));
        let curve = CalibrationCurve::new(OXYGEN_CALIBRATION).unwrap();
        let mut reader =
            SensorReader::registers("O2", channel, OXYGEN_REQUEST, OXYGEN_SCALE, Some(curve), schedule());

        match reader.poll_once(&registry).await {
            PollOutcome::Updated(value) => assert!((value - 20.95).abs() < 1e-9),
            outcome => panic!("unexpected {:?}", outcome),
        }
        // Beyond the top anchor the last segment's slope continues
        let slope = (20.95 - 10.475) / (8.34 - 5.425);
        let expected = 20.95 + (10.0 - 8.34) * slope;
        let value = registry.get("O2").unwrap().value().unwrap();
        assert!((value - 20.95).abs() < 1e-9);
        reader.poll_once(&registry).await;
        let value = registry.get("O2").unwrap().value().unwrap();
        assert!((value - expected).abs() < 1e-9);
        assert!(reader.is_connected());
    }

    #[tokio::test]
    async fn device_exception_marks_sensor_disconnected() {
        let registry = Registry::new();
        let (channel, proxy) = MockRegisterChannel::new("bus");
        proxy.push(RegisterEvent::Registers(vec![500]));
        proxy.push(RegisterEvent::Exception("IllegalFunction".to_owned()));
        proxy.push(RegisterEvent::Registers(vec![600]));
        let mut reader =
            SensorReader::registers("O2", channel, OXYGEN_REQUEST, 1.0, None, schedule());

        reader.poll_once(&registry).await;
        assert!(registry.get("O2").unwrap().connected);

        assert_eq!(PollOutcome::Faulted, reader.poll_once(&registry).await);
        let status = registry.get("O2").unwrap();
        assert!(!status.connected);
        assert_eq!(Reading::Error(ReadingFault::Bus), status.reading.reading);
        assert!(status.last_fault.is_some());
        assert!(!reader.is_connected());

        assert_eq!(PollOutcome::Updated(600.0), reader.poll_once(&registry).await);
        assert!(registry.get("O2").unwrap().connected);
    }

    #[tokio::test]
    async fn malformed_block_is_a_bus_fault() {
        let registry = Registry::new();
        let (channel, proxy) = MockRegisterChannel::new("bus");
        proxy.push(RegisterEvent::Registers(vec![]));
        let mut reader =
            SensorReader::registers("O2", channel, OXYGEN_REQUEST, 1.0, None, schedule());
        assert_eq!(PollOutcome::Faulted, reader.poll_once(&registry).await);
        assert_eq!(Reading::Error(ReadingFault::Bus), reading(&registry, "O2"));
    }

    #[tokio::test]
    async fn unreachable_bus_invalidates_live_value() {
        let registry = Registry::new();
        let (channel, proxy) = MockRegisterChannel::new("bus");
        proxy.push(RegisterEvent::Registers(vec![0]));
        proxy.push(RegisterEvent::OpenFailure);
        let mut reader =
            SensorReader::registers("O2", channel, OXYGEN_REQUEST, 1.0, None, schedule());

        assert_eq!(PollOutcome::Updated(0.0), reader.poll_once(&registry).await);
        assert_eq!(PollOutcome::Faulted, reader.poll_once(&registry).await);
        assert_eq!(
            Reading::Error(ReadingFault::Offline),
            reading(&registry, "O2")
        );
        assert!(!registry.get("O2").unwrap().connected);
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Schedule::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        ));
        assert_eq!(Duration::from_secs(1), backoff.next_delay(false));
        assert_eq!(Duration::from_secs(2), backoff.next_delay(true));
        assert_eq!(Duration::from_secs(4), backoff.next_delay(true));
        assert_eq!(Duration::from_secs(5), backoff.next_delay(true));
        assert_eq!(Duration::from_secs(5), backoff.next_delay(true));
        assert_eq!(Duration::from_secs(1), backoff.next_delay(false));
    }

    #[test]
    fn schedule_ceiling_is_never_below_interval() {
        let schedule = Schedule::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(Duration::from_secs(5), schedule.max_backoff);
    }

    #[tokio::test]
    async fn shutdown_mid_poll_closes_once() {
        let registry = Arc::new(Registry::new());
        let (channel, proxy) = MockLineChannel::new("sonde");
        let read_time = Duration::from_millis(200);
        proxy.set_delay(read_time);
        proxy.set_fallback(Some(LineEvent::Line("7.0".to_owned())));
        let reader = SensorReader::text("pH", channel, schedule());

        let (trigger, tripwire) = Tripwire::new();
        let task = tokio::spawn(reader.run(Arc::clone(&registry), tripwire));
        // Let the first read start
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, proxy.reads());

        let started = Instant::now();
        trigger.cancel();
        task.await.unwrap();
        assert!(started.elapsed() < read_time + Duration::from_millis(100));
        assert_eq!(1, proxy.closes());
        assert_eq!(1, proxy.reads());
        // The read in flight still completed
        assert_eq!(Some(7.0), registry.get("pH").unwrap().value());
    }

    #[tokio::test]
    async fn shutdown_while_idle() {
        let registry = Arc::new(Registry::new());
        let (channel, proxy) = MockRegisterChannel::new("bus");
        proxy.set_fallback(Some(RegisterEvent::Registers(vec![1])));
        let reader = SensorReader::registers(
            "O2",
            channel,
            OXYGEN_REQUEST,
            1.0,
            None,
            Schedule::new(Duration::from_secs(30), Duration::from_secs(60)),
        );

        let (trigger, tripwire) = Tripwire::new();
        let task = tokio::spawn(reader.run(Arc::clone(&registry), tripwire));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        trigger.cancel();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(1, proxy.reads());
        assert_eq!(1, proxy.closes());
    }
}

//! Resolved acquisition configuration.

use crate::{
    core::{
        modbus::{
            rtu::{self, ParitySetting},
            RegisterKind, RegisterRequest, OXYGEN_CALIBRATION, OXYGEN_REG_COUNT, OXYGEN_REG_START,
            OXYGEN_SCALE, OXYGEN_SLAVE_ADDR,
        },
        CalibrationCurve,
    },
    reader::{
        SensorReader, Schedule, DEFAULT_BUS_POLL_INTERVAL, DEFAULT_MAX_BACKOFF,
        DEFAULT_TEXT_POLL_INTERVAL,
    },
    Error, Result,
};

use serde::Deserialize;
use std::{collections::HashSet, path::Path, time::Duration};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

pub const SONDE_TAG: &str = "Sonde";
pub const OXYGEN_TAG: &str = "O2";

fn default_baud_rate() -> u32 {
    rtu::BAUD_RATE
}

fn default_register_count() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub publish: PublishConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    pub tag: String,
    /// Sensors without a port are not instantiated.
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub max_backoff: Option<Duration>,
    /// Anchor points `[input, output]` with strictly increasing inputs.
    #[serde(default)]
    pub calibration: Option<Vec<(f64, f64)>>,
    pub connection: ConnectionConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ConnectionConfig {
    SerialText {
        #[serde(default)]
        init_command: Option<String>,
        #[serde(default)]
        request: Option<String>,
    },
    RegisterBus {
        device_address: u8,
        register_address: u16,
        #[serde(default = "default_register_count")]
        register_count: u16,
        #[serde(default)]
        register_kind: RegisterKind,
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: ParitySetting,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    #[serde(default = "default_publish_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub snapshot_file: Option<String>,
}

fn default_publish_interval() -> Duration {
    DEFAULT_PUBLISH_INTERVAL
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PUBLISH_INTERVAL,
            snapshot_file: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {}", path.display());
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    /// The field deployment: a water-quality sonde streaming text and a
    /// dissolved-oxygen transducer on Modbus RTU, both without a port.
    pub fn field_default() -> Self {
        Self {
            sensors: vec![
                SensorConfig {
                    tag: SONDE_TAG.to_owned(),
                    port: None,
                    baud_rate: rtu::BAUD_RATE,
                    poll_interval: None,
                    timeout: None,
                    max_backoff: None,
                    calibration: None,
                    connection: ConnectionConfig::SerialText {
                        init_command: Some("0\r\n".to_owned()),
                        request: None,
                    },
                },
                SensorConfig {
                    tag: OXYGEN_TAG.to_owned(),
                    port: None,
                    baud_rate: rtu::BAUD_RATE,
                    poll_interval: None,
                    timeout: None,
                    max_backoff: None,
                    calibration: Some(OXYGEN_CALIBRATION.to_vec()),
                    connection: ConnectionConfig::RegisterBus {
                        device_address: OXYGEN_SLAVE_ADDR,
                        register_address: OXYGEN_REG_START,
                        register_count: OXYGEN_REG_COUNT,
                        register_kind: RegisterKind::Input,
                        scale: OXYGEN_SCALE,
                        data_bits: default_data_bits(),
                        parity: ParitySetting::None,
                        stop_bits: default_stop_bits(),
                    },
                },
            ],
            publish: PublishConfig::default(),
        }
    }

    pub fn sensor(&self, tag: &str) -> Option<&SensorConfig> {
        self.sensors.iter().find(|sensor| sensor.tag == tag)
    }

    pub fn override_port(&mut self, tag: &str, port: impl Into<String>) -> Result<()> {
        let sensor = self
            .sensors
            .iter_mut()
            .find(|sensor| sensor.tag == tag)
            .ok_or_else(|| Error::configuration(format!("No sensor with tag '{}'", tag)))?;
        sensor.port = Some(port.into());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.publish.interval.is_zero() {
            return Err(Error::configuration("Publish interval must not be zero"));
        }
        let mut tags = HashSet::new();
        for sensor in &self.sensors {
            if !tags.insert(sensor.tag.as_str()) {
                return Err(Error::configuration(format!(
                    "Sensor tag '{}' is configured twice",
                    sensor.tag
                )));
            }
            sensor.validate()?;
        }
        Ok(())
    }
}

impl SensorConfig {
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.unwrap_or(match self.connection {
            ConnectionConfig::SerialText { .. } => DEFAULT_TEXT_POLL_INTERVAL,
            ConnectionConfig::RegisterBus { .. } => DEFAULT_BUS_POLL_INTERVAL,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::new(
            self.poll_interval(),
            self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF),
        )
    }

    pub fn calibration_curve(&self) -> Result<Option<CalibrationCurve>> {
        match &self.calibration {
            Some(points) => CalibrationCurve::new(points.iter().copied())
                .map(Some)
                .map_err(|err| Error::configuration(format!("Sensor '{}': {}", self.tag, err))),
            None => Ok(None),
        }
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::configuration(format!("Sensor '{}': {}", self.tag, reason))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tag.trim().is_empty() {
            return Err(Error::configuration("Sensor tag must not be empty"));
        }
        if self.poll_interval().is_zero() {
            return Err(self.invalid("poll interval must not be zero"));
        }
        if self.timeout().is_zero() {
            return Err(self.invalid("timeout must not be zero"));
        }
        if self.baud_rate == 0 {
            return Err(self.invalid("baud rate must not be zero"));
        }
        self.calibration_curve()?;
        if let ConnectionConfig::RegisterBus {
            register_count,
            scale,
            data_bits,
            stop_bits,
            ..
        } = self.connection
        {
            if register_count == 0 {
                return Err(self.invalid("register count must not be zero"));
            }
            if !scale.is_finite() {
                return Err(self.invalid("scale must be finite"));
            }
            if rtu::data_bits_from_u8(data_bits).is_none() {
                return Err(self.invalid("data bits must be 5, 6, 7 or 8"));
            }
            if rtu::stop_bits_from_u8(stop_bits).is_none() {
                return Err(self.invalid("stop bits must be 1 or 2"));
            }
        }
        Ok(())
    }

    pub fn register_request(&self) -> Option<RegisterRequest> {
        match self.connection {
            ConnectionConfig::RegisterBus {
                device_address,
                register_address,
                register_count,
                register_kind,
                ..
            } => Some(RegisterRequest {
                kind: register_kind,
                slave: device_address,
                start: register_address,
                count: register_count,
            }),
            ConnectionConfig::SerialText { .. } => None,
        }
    }

    /// Construct the reader and its channel. Nothing is opened yet.
    pub fn build_reader(&self) -> Result<SensorReader> {
        self.validate()?;
        let port = self
            .port
            .as_deref()
            .ok_or_else(|| self.invalid("no port configured"))?;
        match &self.connection {
            ConnectionConfig::SerialText {
                init_command,
                request,
            } => self.build_text_reader(port, init_command.clone(), request.clone()),
            ConnectionConfig::RegisterBus { .. } => self.build_bus_reader(port),
        }
    }

    #[cfg(feature = "serial-text")]
    fn build_text_reader(
        &self,
        port: &str,
        init_command: Option<String>,
        request: Option<String>,
    ) -> Result<SensorReader> {
        use crate::serial::{SerialTextChannel, SerialTextSettings};

        let mut settings = SerialTextSettings::new(port, self.baud_rate, self.timeout());
        settings.init_command = init_command;
        settings.request = request;
        Ok(SensorReader::text(
            self.tag.clone(),
            SerialTextChannel::new(settings),
            self.schedule(),
        ))
    }

    #[cfg(not(feature = "serial-text"))]
    fn build_text_reader(
        &self,
        _port: &str,
        _init_command: Option<String>,
        _request: Option<String>,
    ) -> Result<SensorReader> {
        Err(Error::FeatureNotEnabled("serial-text"))
    }

    #[cfg(feature = "modbus-rtu")]
    fn build_bus_reader(&self, port: &str) -> Result<SensorReader> {
        use crate::{
            core::modbus::rtu::Framing,
            modbus::{RegisterBusChannel, RegisterBusSettings},
        };

        let ConnectionConfig::RegisterBus {
            scale,
            data_bits,
            parity,
            stop_bits,
            ..
        } = self.connection
        else {
            return Err(self.invalid("not a register bus sensor"));
        };
        let request = self
            .register_request()
            .ok_or_else(|| self.invalid("not a register bus sensor"))?;
        let framing = Framing {
            data_bits: rtu::data_bits_from_u8(data_bits)
                .ok_or_else(|| self.invalid("data bits must be 5, 6, 7 or 8"))?,
            parity: parity.into(),
            stop_bits: rtu::stop_bits_from_u8(stop_bits)
                .ok_or_else(|| self.invalid("stop bits must be 1 or 2"))?,
        };
        let settings = RegisterBusSettings {
            port: port.to_owned(),
            baud_rate: self.baud_rate,
            framing,
            timeout: self.timeout(),
        };
        Ok(SensorReader::registers(
            self.tag.clone(),
            RegisterBusChannel::new(settings),
            request,
            scale,
            self.calibration_curve()?,
            self.schedule(),
        ))
    }

    #[cfg(not(feature = "modbus-rtu"))]
    fn build_bus_reader(&self, _port: &str) -> Result<SensorReader> {
        Err(Error::FeatureNotEnabled("modbus-rtu"))
    }
}

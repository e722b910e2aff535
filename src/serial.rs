//! ASCII line sensors on a plain serial port.

use super::*;

use std::{io, mem, time::Duration};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialTextSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    /// Written once right after the port has been opened.
    pub init_command: Option<String>,
    /// Written before every poll for sensors that answer on request.
    pub request: Option<String>,
}

impl SerialTextSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout,
            init_command: None,
            request: None,
        }
    }
}

pub struct SerialTextChannel {
    settings: SerialTextSettings,
    stream: Option<BufReader<SerialStream>>,
    // Bytes of a line that has not been terminated yet
    pending: Vec<u8>,
    health: ConnectionHealth,
}

impl SerialTextChannel {
    pub fn new(settings: SerialTextSettings) -> Self {
        Self {
            settings,
            stream: None,
            pending: Vec::new(),
            health: ConnectionHealth::default(),
        }
    }

    pub fn settings(&self) -> &SerialTextSettings {
        &self.settings
    }

    /// Take over an already opened port and send the init command.
    pub async fn attach(&mut self, mut port: SerialStream) -> Result<()> {
        self.stream = None;
        self.pending.clear();
        if let Some(command) = &self.settings.init_command {
            log::debug!("Sending init command {:?} to {}", command, self.settings.port);
            let written =
                write_bounded(&mut port, command.as_bytes(), self.settings.read_timeout).await;
            if let Err(err) = written {
                return Err(self.open_error(err));
            }
        }
        self.stream = Some(BufReader::new(port));
        self.health.connected();
        Ok(())
    }

    fn open_error(&self, source: io::Error) -> Error {
        Error::ChannelOpen {
            port: self.settings.port.clone(),
            source,
        }
    }

    fn fault(&mut self, err: &dyn std::fmt::Display) {
        log::warn!("Serial port {} faulted: {}", self.settings.port, err);
        self.health.faulted();
    }
}

async fn write_bounded(port: &mut SerialStream, bytes: &[u8], limit: Duration) -> io::Result<()> {
    match tokio::time::timeout(limit, port.write_all(bytes)).await {
        Ok(written) => written,
        Err(_elapsed) => Err(io::ErrorKind::TimedOut.into()),
    }
}

#[async_trait]
impl DeviceChannel for SerialTextChannel {
    fn name(&self) -> &str {
        &self.settings.port
    }

    fn state(&self) -> DeviceConnectionState {
        self.health.state()
    }

    fn last_fault(&self) -> Option<DateTime<Utc>> {
        self.health.last_fault()
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!("Closed serial port {}", self.settings.port);
        }
        self.pending.clear();
        self.health.disconnected();
    }
}

#[async_trait]
impl LineChannel for SerialTextChannel {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() && self.health.is_connected() {
            return Ok(());
        }
        log::info!(
            "Opening serial port {} at {} baud",
            self.settings.port,
            self.settings.baud_rate
        );
        self.stream = None;
        let port = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
            .timeout(self.settings.read_timeout)
            .open_native_async()
            .map_err(|err| self.open_error(err.into()))?;
        self.attach(port).await
    }

    /// Returns the most recent complete line. Lines that queued up since
    /// the last poll are skipped, a trailing partial line is kept.
    async fn poll_line(&mut self) -> Option<String> {
        let limit = self.settings.read_timeout;
        if let Some(request) = &self.settings.request {
            let stream = self.stream.as_mut()?;
            if let Err(err) = write_bounded(stream.get_mut(), request.as_bytes(), limit).await {
                self.fault(&err);
                return None;
            }
        }
        let mut latest = None;
        let mut wait = limit;
        loop {
            let stream = self.stream.as_mut()?;
            // `read_until` keeps partial input in `pending` if the timeout fires
            let read = tokio::time::timeout(wait, stream.read_until(b'\n', &mut self.pending)).await;
            match read {
                Err(_elapsed) => break,
                Ok(Ok(0)) => {
                    self.fault(&"unexpected end of stream");
                    return None;
                }
                Ok(Ok(_)) => {
                    if self.pending.last() != Some(&b'\n') {
                        break;
                    }
                    latest = Some(mem::take(&mut self.pending));
                    // Only drain what is already buffered
                    wait = Duration::ZERO;
                }
                Ok(Err(err)) => {
                    self.fault(&err);
                    return None;
                }
            }
        }
        let line = String::from_utf8_lossy(&latest?).trim().to_owned();
        log::debug!("Received line {:?} from {}", line, self.settings.port);
        Some(line)
    }
}

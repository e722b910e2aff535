//! Addressed register devices on a Modbus RTU line.

pub mod rtu;

use super::*;

use crate::core::modbus::{rtu::Framing, RegisterKind};
use std::time::Duration;
use tokio_modbus::client::{Client, Context as ClientContext, Reader};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterBusSettings {
    pub port: String,
    pub baud_rate: u32,
    pub framing: Framing,
    pub timeout: Duration,
}

/// One field bus link that is opened for every exchange and closed
/// right after it.
pub struct RegisterBusChannel {
    settings: RegisterBusSettings,
    health: ConnectionHealth,
}

impl RegisterBusChannel {
    pub fn new(settings: RegisterBusSettings) -> Self {
        Self {
            settings,
            health: ConnectionHealth::default(),
        }
    }

    pub fn settings(&self) -> &RegisterBusSettings {
        &self.settings
    }

    fn connect(&self, slave: u8) -> Result<ClientContext> {
        rtu::connect_path(
            &self.settings.port,
            self.settings.baud_rate,
            self.settings.framing,
            slave,
        )
        .map_err(|source| Error::ChannelOpen {
            port: self.settings.port.clone(),
            source,
        })
    }
}

async fn exchange(
    ctx: &mut ClientContext,
    request: RegisterRequest,
) -> std::result::Result<Vec<u16>, BusError> {
    let response = match request.kind {
        RegisterKind::Input => ctx.read_input_registers(request.start, request.count).await,
        RegisterKind::Holding => {
            ctx.read_holding_registers(request.start, request.count)
                .await
        }
    };
    let registers = match response {
        Ok(Ok(registers)) => registers,
        Ok(Err(exception)) => return Err(BusError::Exception(format!("{:?}", exception))),
        Err(err) => return Err(BusError::Transport(err.to_string())),
    };
    if registers.len() != usize::from(request.count) {
        return Err(BusError::Malformed {
            expected: request.count,
            actual: registers.len(),
        });
    }
    Ok(registers)
}

#[async_trait]
impl DeviceChannel for RegisterBusChannel {
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
        // The link is released after every exchange
        self.health.disconnected();
    }
}

#[async_trait]
impl RegisterChannel for RegisterBusChannel {
    async fn read_registers(&mut self, request: RegisterRequest) -> Result<Vec<u16>> {
        let mut ctx = match self.connect(request.slave) {
            Ok(ctx) => ctx,
            Err(err) => {
                self.health.disconnected();
                return Err(err);
            }
        };
        self.health.connected();

        let timeout = self.settings.timeout;
        let result = match tokio::time::timeout(timeout, exchange(&mut ctx, request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(BusError::Timeout(timeout)),
        };

        match tokio::time::timeout(timeout, ctx.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!("Closing {} failed: {}", self.settings.port, err),
            Err(_elapsed) => log::debug!("Closing {} timed out", self.settings.port),
        }
        drop(ctx);

        match result {
            Ok(registers) => {
                self.health.disconnected();
                Ok(registers)
            }
            Err(err) => {
                log::warn!(
                    "Reading {:?} from slave {} on {} failed: {}",
                    request.kind,
                    request.slave,
                    self.settings.port,
                    err
                );
                self.health.faulted();
                self.health.disconnected();
                Err(err.into())
            }
        }
    }
}

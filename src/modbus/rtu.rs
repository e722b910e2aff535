//! Serial transport of the register bus.

use crate::core::modbus::rtu::*;

use std::io;
use tokio_modbus::{
    client::{rtu::attach_slave, Context as ClientContext},
    Slave,
};
use tokio_serial::{SerialPortBuilder, SerialPortBuilderExt, SerialStream};

pub fn serial_port_builder(path: &str, baud_rate: u32, framing: Framing) -> SerialPortBuilder {
    tokio_serial::new(path, baud_rate)
        .data_bits(framing.data_bits)
        .parity(framing.parity)
        .stop_bits(framing.stop_bits)
        .flow_control(FLOW_CONTROL)
}

pub fn connect(transport: SerialStream, slave: u8) -> ClientContext {
    attach_slave(transport, Slave(slave))
}

pub fn connect_path(
    path: &str,
    baud_rate: u32,
    framing: Framing,
    slave: u8,
) -> io::Result<ClientContext> {
    log::debug!("Connecting to serial port {}", path);
    let serial = serial_port_builder(path, baud_rate, framing).open_native_async()?;
    Ok(connect(serial, slave))
}

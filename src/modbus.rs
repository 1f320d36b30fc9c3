//! Modbus client for PV inverter communication
//!
//! This module provides the error taxonomy, the `ModbusTransport` contract
//! shared by the TCP and RTU clients, and register codec helpers. Each client
//! owns one connection task; requests reach it over a channel and every
//! request completes exactly once through its own oneshot.

mod frame;
mod rtu;
mod tcp;

pub use frame::{
    FunctionCode, Request, Response, TcpFrame, encode_tcp_frame, parse_response_pdu,
    parse_tcp_frame, take_tcp_frame,
};
#[cfg(feature = "rtu")]
pub use rtu::open_serial;
pub use rtu::{
    ModbusRtuClient, RtuConnector, RtuEvent, RtuFrameReceiver, RtuState, encode_rtu_frame,
    inter_frame_gap,
};
pub use tcp::{ModbusTcpClient, TcpClientSettings};

use crate::error::{HeliosError, Result};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Largest register count for FC 3/4
pub const MAX_READ_COUNT: u16 = 125;
/// Largest register count for FC 16
pub const MAX_WRITE_COUNT: u16 = 123;

/// Modbus exception and transport-local failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailedToRespond,
    /// Exception code not defined by the Modbus application protocol
    Unknown(u8),
    UnsupportedFunction,
    CrcError,
    ParseError,
    Timeout,
    TcpError,
    /// The client was closed or dropped with the request pending
    Cancelled,
}

impl ModbusException {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ModbusException::IllegalFunction,
            2 => ModbusException::IllegalDataAddress,
            3 => ModbusException::IllegalDataValue,
            4 => ModbusException::SlaveDeviceFailure,
            5 => ModbusException::Acknowledge,
            6 => ModbusException::SlaveDeviceBusy,
            7 => ModbusException::MemoryParityError,
            10 => ModbusException::GatewayPathUnavailable,
            11 => ModbusException::GatewayTargetDeviceFailedToRespond,
            other => ModbusException::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ModbusException::IllegalFunction => 1,
            ModbusException::IllegalDataAddress => 2,
            ModbusException::IllegalDataValue => 3,
            ModbusException::SlaveDeviceFailure => 4,
            ModbusException::Acknowledge => 5,
            ModbusException::SlaveDeviceBusy => 6,
            ModbusException::MemoryParityError => 7,
            ModbusException::GatewayPathUnavailable => 10,
            ModbusException::GatewayTargetDeviceFailedToRespond => 11,
            ModbusException::Unknown(code) => code,
            ModbusException::Cancelled => 250,
            ModbusException::UnsupportedFunction => 251,
            ModbusException::CrcError => 252,
            ModbusException::ParseError => 253,
            ModbusException::Timeout => 254,
            ModbusException::TcpError => 255,
        }
    }

    /// Failures caused by the link rather than by the device
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            ModbusException::Timeout | ModbusException::TcpError | ModbusException::Cancelled
        )
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusException::IllegalFunction => "illegal function",
            ModbusException::IllegalDataAddress => "illegal data address",
            ModbusException::IllegalDataValue => "illegal data value",
            ModbusException::SlaveDeviceFailure => "slave device failure",
            ModbusException::Acknowledge => "acknowledge",
            ModbusException::SlaveDeviceBusy => "slave device busy",
            ModbusException::MemoryParityError => "memory parity error",
            ModbusException::GatewayPathUnavailable => "gateway path unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => {
                "gateway target device failed to respond"
            }
            ModbusException::Unknown(_) => "unknown exception",
            ModbusException::UnsupportedFunction => "unsupported function",
            ModbusException::CrcError => "CRC error",
            ModbusException::ParseError => "parse error",
            ModbusException::Timeout => "timeout",
            ModbusException::TcpError => "connection error",
            ModbusException::Cancelled => "cancelled",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// A failed Modbus exchange
#[derive(Debug, Clone, thiserror::Error)]
#[error("{exception}: {message}")]
pub struct ModbusError {
    pub exception: ModbusException,
    pub message: String,
}

impl ModbusError {
    pub fn new<S: Into<String>>(exception: ModbusException, message: S) -> Self {
        Self {
            exception,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(ModbusException::Timeout, "no reply within timeout")
    }

    pub fn cancelled() -> Self {
        Self::new(ModbusException::Cancelled, "client closed")
    }

    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::new(ModbusException::ParseError, message)
    }

    pub fn tcp<S: Into<String>>(message: S) -> Self {
        Self::new(ModbusException::TcpError, message)
    }
}

pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Register access shared by the TCP and RTU clients
#[async_trait::async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn read_holding_registers(&self, unit: u8, start: u16, count: u16)
    -> ModbusResult<Vec<u16>>;

    async fn read_input_registers(&self, unit: u8, start: u16, count: u16)
    -> ModbusResult<Vec<u16>>;

    /// Returns the value echoed by the device
    async fn write_single_register(&self, unit: u8, register: u16, value: u16)
    -> ModbusResult<u16>;

    async fn write_multiple_registers(&self, unit: u8, start: u16, values: &[u16])
    -> ModbusResult<()>;
}

/// One outstanding request handed to a connection task
pub(crate) struct Exchange {
    pub unit: u8,
    pub request: Request,
    pub timeout: Duration,
    pub reply: oneshot::Sender<ModbusResult<Response>>,
}

impl Exchange {
    pub fn complete(self, result: ModbusResult<Response>) {
        // The caller may have given up already
        let _ = self.reply.send(result);
    }
}

pub(crate) enum Message {
    Exchange(Exchange),
    Close,
}

/// Client-side half shared by both transports
#[derive(Debug, Clone)]
pub(crate) struct Submitter {
    tx: mpsc::UnboundedSender<Message>,
    timeout: Duration,
}

impl Submitter {
    pub fn new(tx: mpsc::UnboundedSender<Message>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }

    pub async fn submit(&self, unit: u8, request: Request) -> ModbusResult<Response> {
        request.validate()?;
        let (reply, rx) = oneshot::channel();
        let exchange = Exchange {
            unit,
            request,
            timeout: self.timeout,
            reply,
        };
        self.tx
            .send(Message::Exchange(exchange))
            .map_err(|_| ModbusError::cancelled())?;
        rx.await.map_err(|_| ModbusError::cancelled())?
    }

    pub async fn read(
        &self,
        function: FunctionCode,
        unit: u8,
        start: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        match self.submit(unit, Request::Read { function, start, count }).await? {
            Response::Registers(values) => Ok(values),
            other => Err(ModbusError::parse(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn write_single(&self, unit: u8, register: u16, value: u16) -> ModbusResult<u16> {
        match self
            .submit(unit, Request::WriteSingle { register, value })
            .await?
        {
            Response::WriteSingle { value, .. } => Ok(value),
            other => Err(ModbusError::parse(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn write_multiple(&self, unit: u8, start: u16, values: &[u16]) -> ModbusResult<()> {
        let request = Request::WriteMultiple {
            start,
            values: values.to_vec(),
        };
        match self.submit(unit, request).await? {
            Response::WriteMultiple { .. } => Ok(()),
            other => Err(ModbusError::parse(format!("unexpected reply {:?}", other))),
        }
    }
}

/// Decode 32-bit float from two 16-bit registers (big-endian)
pub fn decode_32bit_float(registers: &[u16]) -> Result<f32> {
    Ok(f32::from_bits(decode_u32(registers)?))
}

/// Decode an unsigned 32-bit value, high word first
pub fn decode_u32(registers: &[u16]) -> Result<u32> {
    if registers.len() < 2 {
        return Err(HeliosError::modbus(
            "Insufficient registers for 32-bit value",
        ));
    }
    Ok((u32::from(registers[0]) << 16) | u32::from(registers[1]))
}

/// Reinterpret a register as a signed value
pub fn decode_i16(register: u16) -> i16 {
    register as i16
}

/// Decode string from registers; NULs and surrounding whitespace are stripped
pub fn decode_string(registers: &[u16]) -> String {
    let bytes: Vec<u8> = registers.iter().flat_map(|r| r.to_be_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .replace('\0', "")
        .trim()
        .to_string()
}

/// Encode 32-bit float to two 16-bit registers (big-endian)
pub fn encode_32bit_float(value: f32) -> [u16; 2] {
    encode_u32(value.to_bits())
}

/// Encode an unsigned 32-bit value, high word first
pub fn encode_u32(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, (value & 0xFFFF) as u16]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_32bit_float() {
        let registers = [0x3F80, 0x0000]; // 1.0 in big-endian
        let result = decode_32bit_float(&registers).unwrap();
        assert!((result - 1.0).abs() < f32::EPSILON);
        assert!(decode_32bit_float(&[0x3F80]).is_err());
    }

    #[test]
    fn test_encode_32bit_float() {
        assert_eq!(encode_32bit_float(1.0), [0x3F80, 0x0000]);
        assert_eq!(encode_u32(120), [0, 120]);
    }

    #[test]
    fn test_decode_string() {
        let registers = [0x4672, 0x6F6E, 0x6975, 0x7300, 0x0000]; // "Fronius"
        assert_eq!(decode_string(&registers), "Fronius");
        assert_eq!(decode_string(&[0x0041, 0x0042, 0x0043]), "ABC");
    }

    #[test]
    fn test_decode_i16() {
        assert_eq!(decode_i16(0xFFFE), -2);
        assert_eq!(decode_u32(&[0x0001, 0x0002]).unwrap(), 0x0001_0002);
    }

    #[test]
    fn exception_codes() {
        assert_eq!(ModbusException::from_code(2), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::from_code(42), ModbusException::Unknown(42));
        assert_eq!(ModbusException::Timeout.code(), 254);
        assert_eq!(ModbusException::TcpError.code(), 255);
        assert!(ModbusException::Cancelled.is_transport());
        assert!(!ModbusException::IllegalDataAddress.is_transport());
    }

    #[test]
    fn error_display() {
        let err = ModbusError::new(ModbusException::IllegalDataAddress, "read 40000");
        assert_eq!(err.to_string(), "illegal data address (2): read 40000");
        let helios: HeliosError = err.into();
        assert!(matches!(helios, HeliosError::Modbus { .. }));
    }
}

//! Modbus RTU client
//!
//! Replies are recognised byte by byte with `RtuFrameReceiver`. Only one
//! exchange is on the wire at a time; further requests wait in a FIFO queue.

use super::frame::{Response, parse_response_pdu};
use super::{
    Exchange, FunctionCode, Message, ModbusError, ModbusResult, ModbusTransport, Submitter,
};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crc16::{MODBUS, State};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

/// Receiver position within an RTU reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuState {
    Idle,
    Address,
    Function,
    ByteCount,
    StartAddressMsb,
    StartAddressLsb,
    Data,
    CrcLsb,
    CrcMsb,
}

/// Outcome of a completed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtuEvent {
    /// A frame for the expected unit and function, CRC verified. Holds the PDU.
    Frame(Vec<u8>),
    /// A complete frame that failed the CRC, unit or function check
    Rejected,
}

/// Byte-level reply recogniser
pub struct RtuFrameReceiver {
    state: RtuState,
    expected_unit: u8,
    expected_function: u8,
    frame: Vec<u8>,
    crc: State<MODBUS>,
    received_crc: u16,
    remaining: usize,
}

impl Default for RtuFrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl RtuFrameReceiver {
    pub fn new() -> Self {
        Self {
            state: RtuState::Idle,
            expected_unit: 0,
            expected_function: 0,
            frame: Vec::with_capacity(256),
            crc: State::<MODBUS>::new(),
            received_crc: 0,
            remaining: 0,
        }
    }

    pub fn state(&self) -> RtuState {
        self.state
    }

    /// Arm the receiver for the reply to a request just sent
    pub fn expect(&mut self, unit: u8, function: FunctionCode) {
        self.expected_unit = unit;
        self.expected_function = function as u8;
        self.restart();
    }

    /// Stop listening; bytes are ignored until the next `expect`
    pub fn reset(&mut self) {
        self.state = RtuState::Idle;
        self.frame.clear();
    }

    fn restart(&mut self) {
        self.state = RtuState::Address;
        self.frame.clear();
        self.crc = State::<MODBUS>::new();
        self.received_crc = 0;
        self.remaining = 0;
    }

    fn push(&mut self, byte: u8) {
        self.frame.push(byte);
        self.crc.update(&[byte]);
    }

    pub fn feed(&mut self, byte: u8) -> Option<RtuEvent> {
        match self.state {
            RtuState::Idle => {}
            RtuState::Address => {
                self.push(byte);
                self.state = RtuState::Function;
            }
            RtuState::Function => {
                self.push(byte);
                if byte & 0x80 != 0 {
                    self.remaining = 1;
                    self.state = RtuState::Data;
                } else {
                    match FunctionCode::from_u8(byte) {
                        Some(FunctionCode::ReadHoldingRegisters)
                        | Some(FunctionCode::ReadInputRegisters) => {
                            self.state = RtuState::ByteCount;
                        }
                        Some(FunctionCode::WriteSingleRegister)
                        | Some(FunctionCode::WriteMultipleRegisters) => {
                            self.state = RtuState::StartAddressMsb;
                        }
                        None => self.restart(),
                    }
                }
            }
            RtuState::ByteCount => {
                self.push(byte);
                self.remaining = usize::from(byte);
                self.state = if byte == 0 {
                    RtuState::CrcLsb
                } else {
                    RtuState::Data
                };
            }
            RtuState::StartAddressMsb => {
                self.push(byte);
                self.state = RtuState::StartAddressLsb;
            }
            RtuState::StartAddressLsb => {
                self.push(byte);
                self.remaining = 2;
                self.state = RtuState::Data;
            }
            RtuState::Data => {
                self.push(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = RtuState::CrcLsb;
                }
            }
            RtuState::CrcLsb => {
                self.received_crc = u16::from(byte);
                self.state = RtuState::CrcMsb;
            }
            RtuState::CrcMsb => {
                self.received_crc |= u16::from(byte) << 8;
                return Some(self.finish());
            }
        }
        None
    }

    fn finish(&mut self) -> RtuEvent {
        let valid = self.received_crc == self.crc.get()
            && self.frame.first() == Some(&self.expected_unit)
            && self.frame.get(1).map(|f| f & 0x7F) == Some(self.expected_function);
        if valid {
            let pdu = self.frame[1..].to_vec();
            self.reset();
            RtuEvent::Frame(pdu)
        } else {
            self.restart();
            RtuEvent::Rejected
        }
    }
}

/// Append the CRC (low byte first) to an address + PDU
pub fn encode_rtu_frame(unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit);
    frame.extend_from_slice(pdu);
    let crc = State::<MODBUS>::calculate(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Silent interval required between frames (3.5 character times)
pub fn inter_frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1_750);
    }
    // 11 bits per character
    Duration::from_micros(u64::from(11 * 3_500_000 / baud_rate) + 1)
}

/// First wait before reopening a port that failed to open
const REOPEN_BACKOFF_MIN: Duration = Duration::from_secs(1);
const REOPEN_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Opens the byte stream under an RTU link. Called again after the port failed.
pub type RtuConnector<T> = Box<dyn FnMut() -> std::io::Result<T> + Send>;

/// Handle onto an RTU link task
#[derive(Debug, Clone)]
pub struct ModbusRtuClient {
    submitter: Submitter,
}

impl ModbusRtuClient {
    /// Run the client over an already open byte stream (pty, in-memory duplex).
    /// The link cannot be reopened once the stream fails.
    pub fn new<T>(io: T, baud_rate: u32, response_timeout: Duration) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(Some(io), None, baud_rate, response_timeout)
    }

    /// Run the client over streams opened by `connector`. The first request
    /// opens the port; after a read or write failure the next request reopens it.
    pub fn with_connector<T>(
        connector: RtuConnector<T>,
        baud_rate: u32,
        response_timeout: Duration,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(None, Some(connector), baud_rate, response_timeout)
    }

    fn start<T>(
        io: Option<T>,
        connector: Option<RtuConnector<T>>,
        baud_rate: u32,
        response_timeout: Duration,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = RtuLink {
            io,
            connector,
            reopen_at: Instant::now(),
            backoff: REOPEN_BACKOFF_MIN,
            gap: inter_frame_gap(baud_rate),
            receiver: RtuFrameReceiver::new(),
            queue: VecDeque::new(),
            last_activity: Instant::now(),
            broken: None,
            logger: get_logger_with_context(LogContext::new("modbus_rtu")),
        };
        tokio::spawn(link.run(rx));
        Self {
            submitter: Submitter::new(tx, response_timeout),
        }
    }

    /// Close the link; pending and queued requests complete with `Cancelled`
    pub fn close(&self) {
        self.submitter.close();
    }
}

/// Run an RTU client on a serial port (8N1), reopening it after failures
#[cfg(feature = "rtu")]
pub fn open_serial(
    device: &str,
    baud_rate: u32,
    response_timeout: Duration,
) -> crate::error::Result<ModbusRtuClient> {
    use tokio_serial::SerialPortBuilderExt;

    let builder = tokio_serial::new(device, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One);
    // Fail at startup when the device is missing
    let port = builder.clone().open_native_async().map_err(|e| {
        crate::error::HeliosError::modbus(format!("Failed to open {}: {}", device, e))
    })?;
    let mut first = Some(port);
    let connector: RtuConnector<tokio_serial::SerialStream> =
        Box::new(move || match first.take() {
            Some(port) => Ok(port),
            None => builder.clone().open_native_async().map_err(std::io::Error::from),
        });
    Ok(ModbusRtuClient::with_connector(connector, baud_rate, response_timeout))
}

#[async_trait::async_trait]
impl ModbusTransport for ModbusRtuClient {
    async fn read_holding_registers(
        &self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.submitter
            .read(FunctionCode::ReadHoldingRegisters, unit, start, count)
            .await
    }

    async fn read_input_registers(
        &self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.submitter
            .read(FunctionCode::ReadInputRegisters, unit, start, count)
            .await
    }

    async fn write_single_register(
        &self,
        unit: u8,
        register: u16,
        value: u16,
    ) -> ModbusResult<u16> {
        self.submitter.write_single(unit, register, value).await
    }

    async fn write_multiple_registers(
        &self,
        unit: u8,
        start: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.submitter.write_multiple(unit, start, values).await
    }
}

struct RtuLink<T> {
    /// `None` until opened, and again after a failure
    io: Option<T>,
    connector: Option<RtuConnector<T>>,
    /// No reopen attempt before this
    reopen_at: Instant,
    backoff: Duration,
    gap: Duration,
    receiver: RtuFrameReceiver,
    queue: VecDeque<Exchange>,
    last_activity: Instant,
    /// Why the port is unusable; reported to requests until it reopens
    broken: Option<String>,
    logger: StructuredLogger,
}

enum Step {
    Continue,
    Shutdown,
}

enum Wire {
    Reply(ModbusResult<Response>),
    Failed(String),
    Shutdown,
}

impl<T> RtuLink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            let exchange = match self.queue.pop_front() {
                Some(exchange) => exchange,
                None => match rx.recv().await {
                    Some(Message::Exchange(exchange)) => exchange,
                    Some(Message::Close) | None => break,
                },
            };
            if let Step::Shutdown = self.transact(exchange, &mut rx).await {
                break;
            }
        }
        for exchange in self.queue.drain(..) {
            exchange.complete(Err(ModbusError::cancelled()));
        }
    }

    /// Take the open stream, opening it through the connector when needed
    fn take_io(&mut self) -> Result<T, String> {
        if let Some(io) = self.io.take() {
            return Ok(io);
        }
        let reason = self
            .broken
            .clone()
            .unwrap_or_else(|| "serial port not open".to_string());
        let Some(connector) = self.connector.as_mut() else {
            return Err(reason);
        };
        let now = Instant::now();
        if now < self.reopen_at {
            return Err(reason);
        }
        match connector() {
            Ok(io) => {
                if self.broken.take().is_some() {
                    self.logger.info("Serial port reopened");
                }
                self.backoff = REOPEN_BACKOFF_MIN;
                Ok(io)
            }
            Err(e) => {
                let reason = format!("serial open failed: {}", e);
                self.logger.warn(&format!(
                    "{}; retrying in {}s",
                    reason,
                    self.backoff.as_secs()
                ));
                self.reopen_at = now + self.backoff;
                self.backoff = (self.backoff * 2).min(REOPEN_BACKOFF_MAX);
                self.broken = Some(reason.clone());
                Err(reason)
            }
        }
    }

    async fn transact(
        &mut self,
        exchange: Exchange,
        rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Step {
        let mut io = match self.take_io() {
            Ok(io) => io,
            Err(reason) => {
                exchange.complete(Err(ModbusError::tcp(reason)));
                return Step::Continue;
            }
        };

        sleep_until(self.last_activity + self.gap).await;
        let wire = self.exchange_on(&mut io, &exchange, rx).await;
        self.receiver.reset();
        self.last_activity = Instant::now();
        match wire {
            Wire::Reply(result) => {
                self.io = Some(io);
                exchange.complete(result);
                Step::Continue
            }
            Wire::Failed(reason) => {
                // Dropping `io` closes the port; the next request reopens it
                self.logger.error(&reason);
                self.reopen_at = Instant::now();
                self.broken = Some(reason.clone());
                exchange.complete(Err(ModbusError::tcp(reason)));
                Step::Continue
            }
            Wire::Shutdown => {
                exchange.complete(Err(ModbusError::cancelled()));
                Step::Shutdown
            }
        }
    }

    /// Write the request and wait for its reply or its deadline
    async fn exchange_on(
        &mut self,
        io: &mut T,
        exchange: &Exchange,
        rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Wire {
        let frame = encode_rtu_frame(exchange.unit, &exchange.request.encode_pdu());
        if let Err(e) = io.write_all(&frame).await {
            return Wire::Failed(format!("serial write failed: {}", e));
        }
        self.receiver.expect(exchange.unit, exchange.request.function());
        let deadline = Instant::now() + exchange.timeout;
        let mut chunk = [0u8; 256];

        loop {
            tokio::select! {
                read = io.read(&mut chunk) => match read {
                    Ok(0) => return Wire::Failed("serial port closed".to_string()),
                    Ok(n) => {
                        if let Some(pdu) = self.scan(&chunk[..n]) {
                            return Wire::Reply(parse_response_pdu(&exchange.request, &pdu));
                        }
                    }
                    Err(e) => return Wire::Failed(format!("serial read failed: {}", e)),
                },
                _ = sleep_until(deadline) => {
                    self.logger.debug(&format!(
                        "No reply from unit {} within {:?}",
                        exchange.unit, exchange.timeout
                    ));
                    return Wire::Reply(Err(ModbusError::timeout()));
                }
                msg = rx.recv() => match msg {
                    Some(Message::Exchange(next)) => self.queue.push_back(next),
                    Some(Message::Close) | None => return Wire::Shutdown,
                },
            }
        }
    }

    /// Feed received bytes; returns the PDU of the first accepted frame
    fn scan(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        for &b in bytes {
            match self.receiver.feed(b) {
                Some(RtuEvent::Frame(pdu)) => return Some(pdu),
                Some(RtuEvent::Rejected) => {
                    self.logger.debug("Discarding frame with bad CRC, unit or function");
                }
                None => {}
            }
        }
        None
    }
}

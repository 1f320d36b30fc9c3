//! Modbus TCP client
//!
//! A `ModbusTcpClient` is a cheap handle onto a connection task that owns the
//! socket. The task connects lazily, writes queued exchanges in FIFO order
//! (up to the pipeline depth), matches replies by transaction id and enforces
//! per-request deadlines.

use super::frame::{encode_tcp_frame, parse_response_pdu, parse_tcp_frame, take_tcp_frame};
use super::{
    Exchange, FunctionCode, Message, ModbusError, ModbusResult, ModbusTransport, Submitter,
};
use crate::config::ModbusConfig;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};

/// Connection parameters for a TCP client
#[derive(Debug, Clone, Copy)]
pub struct TcpClientSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pipeline_depth: usize,
}

impl Default for TcpClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            pipeline_depth: 1,
        }
    }
}

impl TcpClientSettings {
    pub fn from_config(config: &ModbusConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            pipeline_depth: config.tcp_pipeline_depth.max(1),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Handle onto a Modbus TCP connection task
#[derive(Debug, Clone)]
pub struct ModbusTcpClient {
    submitter: Submitter,
    address: String,
}

impl ModbusTcpClient {
    /// Create a client for `host:port`; the connection is opened on first use
    pub fn new(host: &str, port: u16, settings: TcpClientSettings) -> Self {
        let address = format!("{}:{}", host, port);
        let (tx, rx) = mpsc::unbounded_channel();
        let logger = get_logger_with_context(
            LogContext::new("modbus_tcp").with_location(address.clone()),
        );
        let connection = TcpConnection {
            address: address.clone(),
            settings,
            stream: None,
            buffer: Vec::with_capacity(512),
            queue: VecDeque::new(),
            pending: HashMap::new(),
            next_transaction_id: 0,
            logger,
        };
        tokio::spawn(connection.run(rx));
        Self {
            submitter: Submitter::new(tx, settings.request_timeout),
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Close the connection; pending and queued requests complete with `Cancelled`
    pub fn close(&self) {
        self.submitter.close();
    }
}

#[async_trait::async_trait]
impl ModbusTransport for ModbusTcpClient {
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

struct InFlight {
    exchange: Exchange,
    deadline: Instant,
}

struct TcpConnection {
    address: String,
    settings: TcpClientSettings,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    queue: VecDeque<Exchange>,
    pending: HashMap<u16, InFlight>,
    next_transaction_id: u16,
    logger: StructuredLogger,
}

async fn read_some(stream: &mut Option<TcpStream>, chunk: &mut [u8]) -> std::io::Result<usize> {
    match stream {
        Some(s) => s.read(chunk).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl TcpConnection {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        let mut chunk = [0u8; 1024];
        loop {
            self.dispatch().await;
            let deadline = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(Message::Exchange(exchange)) => self.queue.push_back(exchange),
                    Some(Message::Close) | None => {
                        self.cancel_all();
                        return;
                    }
                },
                read = read_some(&mut self.stream, &mut chunk) => match read {
                    Ok(0) => self.connection_lost("connection closed by peer"),
                    Ok(n) => {
                        self.buffer.extend_from_slice(&chunk[..n]);
                        self.drain_frames();
                    }
                    Err(e) => self.connection_lost(&format!("read failed: {}", e)),
                },
                _ = sleep_until_opt(deadline) => self.expire(Instant::now()),
            }
        }
    }

    /// Write queued exchanges while the pipeline has room
    async fn dispatch(&mut self) {
        while !self.queue.is_empty() && self.pending.len() < self.settings.pipeline_depth {
            if self.stream.is_none() && !self.connect().await {
                return;
            }
            let Some(exchange) = self.queue.pop_front() else {
                return;
            };

            let transaction_id = self.next_transaction_id;
            self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
            let frame =
                encode_tcp_frame(transaction_id, exchange.unit, &exchange.request.encode_pdu());

            let Some(stream) = self.stream.as_mut() else {
                self.queue.push_front(exchange);
                return;
            };
            if let Err(e) = stream.write_all(&frame).await {
                exchange.complete(Err(ModbusError::tcp(format!("write failed: {}", e))));
                self.connection_lost(&format!("write failed: {}", e));
                continue;
            }
            self.logger.trace(&format!(
                "Sent transaction {} ({:?}) to unit {}",
                transaction_id,
                exchange.request.function(),
                exchange.unit
            ));
            let deadline = Instant::now() + exchange.timeout;
            self.pending.insert(transaction_id, InFlight { exchange, deadline });
        }
    }

    async fn connect(&mut self) -> bool {
        self.logger.debug(&format!("Connecting to {}", self.address));
        let error = match timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&self.address),
        )
        .await
        {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    self.logger.debug(&format!("Failed to set TCP_NODELAY: {}", e));
                }
                self.stream = Some(stream);
                self.buffer.clear();
                return true;
            }
            Ok(Err(e)) => format!("connect failed: {}", e),
            Err(_) => "connect timeout".to_string(),
        };
        self.logger.debug(&error);
        for exchange in self.queue.drain(..) {
            exchange.complete(Err(ModbusError::tcp(error.clone())));
        }
        false
    }

    fn drain_frames(&mut self) {
        while let Some(frame) = take_tcp_frame(&mut self.buffer) {
            let Some(parsed) = parse_tcp_frame(&frame) else {
                self.logger.debug("Dropping malformed frame");
                continue;
            };
            match self.pending.remove(&parsed.transaction_id) {
                Some(in_flight) => {
                    let result = parse_response_pdu(&in_flight.exchange.request, parsed.pdu);
                    in_flight.exchange.complete(result);
                }
                None => self.logger.debug(&format!(
                    "Dropping reply with unknown transaction id {}",
                    parsed.transaction_id
                )),
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(in_flight) = self.pending.remove(&id) {
                self.logger.debug(&format!("Transaction {} timed out", id));
                in_flight.exchange.complete(Err(ModbusError::timeout()));
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        self.logger.debug(&format!("Connection lost: {}", reason));
        self.stream = None;
        self.buffer.clear();
        for (_, in_flight) in self.pending.drain() {
            in_flight
                .exchange
                .complete(Err(ModbusError::tcp(reason.to_string())));
        }
    }

    fn cancel_all(&mut self) {
        for (_, in_flight) in self.pending.drain() {
            in_flight.exchange.complete(Err(ModbusError::cancelled()));
        }
        for exchange in self.queue.drain(..) {
            exchange.complete(Err(ModbusError::cancelled()));
        }
    }
}

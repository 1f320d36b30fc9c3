#![allow(dead_code)]

use helios::modbus::{ModbusError, ModbusException, ModbusResult, ModbusTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const BASE: u16 = 40000;
pub const COMMON_AT: u16 = 40002;
pub const INVERTER_AT: u16 = 40069;
pub const UNKNOWN_AT: u16 = 40121;
pub const NAMEPLATE_AT: u16 = 40133;
pub const CONTROLS_AT: u16 = 40161;
pub const END_AT: u16 = 40187;

/// Registers of a string padded to `len` registers
pub fn string_registers(s: &str, len: usize) -> Vec<u16> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(len * 2, 0);
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

/// Register map of a three-phase Fronius inverter:
/// common model, inverter model 103, an unknown model, nameplate 120,
/// immediate controls 123 and the end marker
pub fn fronius_map() -> HashMap<u16, u16> {
    let mut map = HashMap::new();
    let mut put = |start: u16, values: &[u16]| {
        for (i, v) in values.iter().enumerate() {
            map.insert(start + i as u16, *v);
        }
    };
    put(BASE, &[0x5375, 0x6e53]);

    let mut common = vec![1, 65];
    common.extend(string_registers("Fronius", 16));
    common.extend(string_registers("Symo 8.2-3-M", 16));
    common.extend(string_registers("3.14.1-1", 8));
    common.extend(string_registers("0.3.30.2", 8));
    common.extend(string_registers("28136344", 16));
    put(COMMON_AT, &common);

    let mut inverter = vec![103, 50];
    inverter.resize(52, 0);
    put(INVERTER_AT, &inverter);

    put(UNKNOWN_AT, &[999, 10]);

    let mut nameplate = vec![120, 26, 4, 8200, 0];
    nameplate.resize(28, 0);
    put(NAMEPLATE_AT, &nameplate);

    let mut controls = vec![123, 24];
    controls.resize(26, 0);
    // WMaxLimPct_SF = -2: one unit is 0.01 %
    controls[23] = (-2i16) as u16;
    put(CONTROLS_AT, &controls);

    put(END_AT, &[0xFFFF, 0]);
    map
}

/// In-memory transport over a register map
#[derive(Default)]
pub struct MapTransport {
    pub registers: Mutex<HashMap<u16, u16>>,
    pub reads: Mutex<Vec<(u16, u16)>>,
    pub writes: Mutex<Vec<(u16, Vec<u16>)>>,
    pub failing: AtomicBool,
}

impl MapTransport {
    pub fn new(registers: HashMap<u16, u16>) -> Self {
        Self {
            registers: Mutex::new(registers),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reads(&self) -> Vec<(u16, u16)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.writes.lock().unwrap().clone()
    }

    fn read(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ModbusError::timeout());
        }
        self.reads.lock().unwrap().push((start, count));
        let registers = self.registers.lock().unwrap();
        (start..start.saturating_add(count))
            .map(|r| {
                registers.get(&r).copied().ok_or_else(|| {
                    ModbusError::new(ModbusException::IllegalDataAddress, format!("register {}", r))
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ModbusTransport for MapTransport {
    async fn read_holding_registers(
        &self,
        _unit: u8,
        start: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read(start, count)
    }

    async fn read_input_registers(
        &self,
        _unit: u8,
        start: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read(start, count)
    }

    async fn write_single_register(
        &self,
        _unit: u8,
        register: u16,
        value: u16,
    ) -> ModbusResult<u16> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ModbusError::timeout());
        }
        self.writes.lock().unwrap().push((register, vec![value]));
        Ok(value)
    }

    async fn write_multiple_registers(
        &self,
        _unit: u8,
        start: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ModbusError::timeout());
        }
        self.writes.lock().unwrap().push((start, values.to_vec()));
        Ok(())
    }
}

/// Requests seen by the fake server: (unit, function, start, count)
pub type RequestLog = Arc<Mutex<Vec<(u8, u8, u16, u16)>>>;

/// Modbus TCP server answering FC 3/4 from a register map. Unknown
/// registers yield exception 2. Returns the port and the request log.
pub async fn spawn_modbus_server(registers: HashMap<u16, u16>) -> (u16, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log: RequestLog = Arc::default();
    let registers = Arc::new(registers);
    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let registers = registers.clone();
            let log = server_log.clone();
            tokio::spawn(async move {
                let mut header = [0u8; 7];
                while socket.read_exact(&mut header).await.is_ok() {
                    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
                    let mut pdu = vec![0u8; length.saturating_sub(1)];
                    if socket.read_exact(&mut pdu).await.is_err() {
                        return;
                    }
                    let unit = header[6];
                    let function = pdu[0];
                    let start = u16::from_be_bytes([pdu[1], pdu[2]]);
                    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                    log.lock().unwrap().push((unit, function, start, count));

                    let values: Option<Vec<u16>> = (start..start.saturating_add(count))
                        .map(|r| registers.get(&r).copied())
                        .collect();
                    let reply_pdu = match values {
                        Some(values) if function == 3 || function == 4 => {
                            let mut out = vec![function, (values.len() * 2) as u8];
                            for v in values {
                                out.extend_from_slice(&v.to_be_bytes());
                            }
                            out
                        }
                        _ => vec![function | 0x80, 2],
                    };
                    let mut frame = header[..4].to_vec();
                    frame.extend_from_slice(&((reply_pdu.len() + 1) as u16).to_be_bytes());
                    frame.push(unit);
                    frame.extend_from_slice(&reply_pdu);
                    if socket.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (port, log)
}

/// HTTP server answering every request with a route-dependent JSON body.
/// `route` gets the request line. Returns the port and the request lines.
pub async fn spawn_http_server<F>(route: F) -> (u16, Arc<Mutex<Vec<String>>>)
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = requests.clone();
    let route = Arc::new(route);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let route = route.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut received = Vec::new();
                loop {
                    let Ok(n) = socket.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    received.extend_from_slice(&buf[..n]);
                    if received.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&received).to_string();
                let request_line = text.lines().next().unwrap_or_default().to_string();
                seen.lock().unwrap().push(request_line.clone());
                let body = route(&request_line);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (port, requests)
}

/// Solar API reply with status code 0
pub fn solar_api_reply(data: serde_json::Value) -> String {
    serde_json::json!({
        "Head": { "Status": { "Code": 0, "Reason": "", "UserMessage": "" } },
        "Body": { "Data": data }
    })
    .to_string()
}

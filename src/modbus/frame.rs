//! PDU and MBAP framing shared by the TCP and RTU clients

use super::{MAX_READ_COUNT, MAX_WRITE_COUNT, ModbusError, ModbusException, ModbusResult};

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleRegister = 6,
    WriteMultipleRegisters = 16,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            3 => Some(FunctionCode::ReadHoldingRegisters),
            4 => Some(FunctionCode::ReadInputRegisters),
            6 => Some(FunctionCode::WriteSingleRegister),
            16 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }
}

/// A request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read {
        function: FunctionCode,
        start: u16,
        count: u16,
    },
    WriteSingle {
        register: u16,
        value: u16,
    },
    WriteMultiple {
        start: u16,
        values: Vec<u16>,
    },
}

/// A decoded reply PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    WriteSingle { register: u16, value: u16 },
    WriteMultiple { start: u16, count: u16 },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::Read { function, .. } => *function,
            Request::WriteSingle { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultiple { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Reject requests the protocol cannot carry
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            Request::Read {
                function, count, ..
            } => {
                if !matches!(
                    function,
                    FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
                ) {
                    return Err(ModbusError::new(
                        ModbusException::UnsupportedFunction,
                        format!("{:?} is not a read function", function),
                    ));
                }
                if *count == 0 || *count > MAX_READ_COUNT {
                    return Err(ModbusError::new(
                        ModbusException::IllegalDataValue,
                        format!("read count {} outside 1..={}", count, MAX_READ_COUNT),
                    ));
                }
            }
            Request::WriteSingle { .. } => {}
            Request::WriteMultiple { values, .. } => {
                if values.is_empty() || values.len() > usize::from(MAX_WRITE_COUNT) {
                    return Err(ModbusError::new(
                        ModbusException::IllegalDataValue,
                        format!(
                            "write count {} outside 1..={}",
                            values.len(),
                            MAX_WRITE_COUNT
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Encode the PDU (function code followed by its payload)
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = vec![self.function() as u8];
        match self {
            Request::Read { start, count, .. } => {
                pdu.extend_from_slice(&start.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Request::WriteSingle { register, value } => {
                pdu.extend_from_slice(&register.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteMultiple { start, values } => {
                pdu.extend_from_slice(&start.to_be_bytes());
                pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
                pdu.push((values.len() * 2) as u8);
                for v in values {
                    pdu.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        pdu
    }
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Validate a reply PDU against the request that produced it
pub fn parse_response_pdu(request: &Request, pdu: &[u8]) -> ModbusResult<Response> {
    let Some(&function) = pdu.first() else {
        return Err(ModbusError::parse("empty reply"));
    };
    let expected = request.function() as u8;
    if function & 0x80 != 0 {
        if function & 0x7F != expected {
            return Err(ModbusError::parse(format!(
                "exception for function {} while expecting {}",
                function & 0x7F,
                expected
            )));
        }
        let code = pdu
            .get(1)
            .copied()
            .ok_or_else(|| ModbusError::parse("exception reply without code"))?;
        return Err(ModbusError::new(
            ModbusException::from_code(code),
            format!("device returned exception {}", code),
        ));
    }
    if function != expected {
        return Err(ModbusError::parse(format!(
            "function {} in reply, expected {}",
            function, expected
        )));
    }

    match request {
        Request::Read { count, .. } => {
            let byte_count = pdu
                .get(1)
                .copied()
                .ok_or_else(|| ModbusError::parse("missing byte count"))?;
            let byte_count = usize::from(byte_count);
            if byte_count != usize::from(*count) * 2 || pdu.len() != byte_count + 2 {
                return Err(ModbusError::parse(format!(
                    "byte count {} does not match {} registers ({} bytes received)",
                    byte_count,
                    count,
                    pdu.len()
                )));
            }
            let values = pdu[2..].chunks_exact(2).map(|c| be_u16(c, 0)).collect();
            Ok(Response::Registers(values))
        }
        Request::WriteSingle { .. } => {
            if pdu.len() != 5 {
                return Err(ModbusError::parse("write single reply must be 5 bytes"));
            }
            Ok(Response::WriteSingle {
                register: be_u16(pdu, 1),
                value: be_u16(pdu, 3),
            })
        }
        Request::WriteMultiple { .. } => {
            if pdu.len() != 5 {
                return Err(ModbusError::parse("write multiple reply must be 5 bytes"));
            }
            Ok(Response::WriteMultiple {
                start: be_u16(pdu, 1),
                count: be_u16(pdu, 3),
            })
        }
    }
}

/// MBAP header plus PDU of one TCP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame<'a> {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    pub pdu: &'a [u8],
}

/// Build a TCP frame: MBAP header (length = PDU + unit id) followed by the PDU
pub fn encode_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Remove one complete frame from the front of `buffer`, if one has arrived
pub fn take_tcp_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buffer.len() < 6 {
        return None;
    }
    let total = 6 + usize::from(be_u16(buffer, 4));
    if buffer.len() < total {
        return None;
    }
    Some(buffer.drain(..total).collect())
}

/// Split a complete frame into header fields and PDU
pub fn parse_tcp_frame(frame: &[u8]) -> Option<TcpFrame<'_>> {
    if frame.len() < 8 {
        return None;
    }
    let length = usize::from(be_u16(frame, 4));
    if frame.len() != 6 + length {
        return None;
    }
    Some(TcpFrame {
        transaction_id: be_u16(frame, 0),
        protocol_id: be_u16(frame, 2),
        unit_id: frame[6],
        pdu: &frame[7..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(count: u16) -> Request {
        Request::Read {
            function: FunctionCode::ReadHoldingRegisters,
            start: 40000,
            count,
        }
    }

    #[test]
    fn encodes_read_request() {
        let frame = encode_tcp_frame(7, 1, &read(2).encode_pdu());
        assert_eq!(frame, vec![0, 7, 0, 0, 0, 6, 1, 3, 0x9C, 0x40, 0, 2]);
    }

    #[test]
    fn encodes_write_multiple_with_byte_count() {
        let req = Request::WriteMultiple {
            start: 0xF300,
            values: vec![1, 2],
        };
        assert_eq!(req.encode_pdu(), vec![16, 0xF3, 0x00, 0, 2, 4, 0, 1, 0, 2]);
    }

    #[test]
    fn rejects_oversized_requests() {
        assert!(read(126).validate().is_err());
        assert!(read(0).validate().is_err());
        let write = Request::WriteMultiple {
            start: 0,
            values: vec![0; 124],
        };
        assert!(write.validate().is_err());
    }

    #[test]
    fn parses_register_reply() {
        let pdu = [3, 4, 0x53, 0x75, 0x6e, 0x53];
        let resp = parse_response_pdu(&read(2), &pdu).unwrap();
        assert_eq!(resp, Response::Registers(vec![0x5375, 0x6e53]));
    }

    #[test]
    fn byte_count_mismatch_is_parse_error() {
        let pdu = [3, 2, 0x53, 0x75];
        let err = parse_response_pdu(&read(2), &pdu).unwrap_err();
        assert_eq!(err.exception, ModbusException::ParseError);
    }

    #[test]
    fn exception_reply_maps_code() {
        let err = parse_response_pdu(&read(2), &[0x83, 2]).unwrap_err();
        assert_eq!(err.exception, ModbusException::IllegalDataAddress);
    }

    #[test]
    fn takes_back_to_back_frames() {
        let mut buffer = encode_tcp_frame(1, 1, &[3, 2, 0, 1]);
        buffer.extend(encode_tcp_frame(2, 1, &[3, 2, 0, 2]));
        buffer.extend_from_slice(&[0, 3, 0]);

        let first = take_tcp_frame(&mut buffer).unwrap();
        assert_eq!(parse_tcp_frame(&first).unwrap().transaction_id, 1);
        let second = take_tcp_frame(&mut buffer).unwrap();
        let parsed = parse_tcp_frame(&second).unwrap();
        assert_eq!(parsed.transaction_id, 2);
        assert_eq!(parsed.pdu, &[3, 2, 0, 2]);
        assert!(take_tcp_frame(&mut buffer).is_none());
        assert_eq!(buffer.len(), 3);
    }
}

#![no_main]
use helios::modbus::{FunctionCode, Request, parse_response_pdu, parse_tcp_frame, take_tcp_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let request = Request::Read {
        function: FunctionCode::ReadHoldingRegisters,
        start: 40000,
        count: 2,
    };

    // Split the stream into pipelined frames the way the connection task does
    let mut buffer = data.to_vec();
    while let Some(frame) = take_tcp_frame(&mut buffer) {
        if let Some(parsed) = parse_tcp_frame(&frame) {
            let _ = parse_response_pdu(&request, parsed.pdu);
        }
    }
});

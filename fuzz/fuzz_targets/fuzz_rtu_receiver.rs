#![no_main]
use helios::modbus::{FunctionCode, RtuEvent, RtuFrameReceiver, RtuState};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, bytes)) = data.split_first() else {
        return;
    };
    let function = match selector % 4 {
        0 => FunctionCode::ReadHoldingRegisters,
        1 => FunctionCode::ReadInputRegisters,
        2 => FunctionCode::WriteSingleRegister,
        _ => FunctionCode::WriteMultipleRegisters,
    };

    let mut receiver = RtuFrameReceiver::new();
    receiver.expect(selector >> 2, function);
    for &byte in bytes {
        match receiver.feed(byte) {
            Some(RtuEvent::Frame(pdu)) => {
                assert!(!pdu.is_empty());
                assert_eq!(receiver.state(), RtuState::Idle);
                receiver.expect(selector >> 2, function);
            }
            Some(RtuEvent::Rejected) => assert_eq!(receiver.state(), RtuState::Address),
            None => {}
        }
    }
});

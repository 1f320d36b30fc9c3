mod common;

use common::*;
use helios::modbus::{
    FunctionCode, ModbusException, ModbusRtuClient, ModbusTcpClient, ModbusTransport,
    RtuConnector, RtuEvent, RtuFrameReceiver, TcpClientSettings, encode_rtu_frame,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[tokio::test]
async fn tcp_read_returns_registers() {
    let (port, _log) = spawn_modbus_server(fronius_map()).await;
    let client = ModbusTcpClient::new("127.0.0.1", port, TcpClientSettings::default());
    let values = client.read_holding_registers(1, BASE, 2).await.unwrap();
    assert_eq!(values, vec![0x5375, 0x6e53]);
    client.close();
}

#[tokio::test]
async fn tcp_exception_reply_maps_code() {
    let (port, _log) = spawn_modbus_server(HashMap::new()).await;
    let client = ModbusTcpClient::new("127.0.0.1", port, TcpClientSettings::default());
    let err = client.read_holding_registers(1, 40000, 2).await.unwrap_err();
    assert_eq!(err.exception, ModbusException::IllegalDataAddress);
    client.close();
}

#[tokio::test]
async fn tcp_connection_refused_is_tcp_error() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = ModbusTcpClient::new("127.0.0.1", port, TcpClientSettings::default());
    let err = client.read_holding_registers(1, 40000, 2).await.unwrap_err();
    assert_eq!(err.exception, ModbusException::TcpError);
}

#[tokio::test]
async fn tcp_pipelined_requests_complete_individually() {
    let (port, log) = spawn_modbus_server(fronius_map()).await;
    let settings = TcpClientSettings {
        pipeline_depth: 4,
        ..TcpClientSettings::default()
    };
    let client = Arc::new(ModbusTcpClient::new("127.0.0.1", port, settings));
    let starts = [BASE, COMMON_AT, INVERTER_AT, END_AT];
    let tasks: Vec<_> = starts
        .iter()
        .map(|&start| {
            let client = client.clone();
            tokio::spawn(async move { client.read_holding_registers(1, start, 2).await })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    assert_eq!(results[0], vec![0x5375, 0x6e53]);
    assert_eq!(results[1], vec![1, 65]);
    assert_eq!(results[2], vec![103, 50]);
    assert_eq!(results[3], vec![0xFFFF, 0]);
    assert_eq!(log.lock().unwrap().len(), 4);
    client.close();
}

#[tokio::test]
async fn oversized_read_is_rejected_locally() {
    let (port, log) = spawn_modbus_server(fronius_map()).await;
    let client = ModbusTcpClient::new("127.0.0.1", port, TcpClientSettings::default());
    assert!(client.read_holding_registers(1, 0, 126).await.is_err());
    assert!(log.lock().unwrap().is_empty());
    client.close();
}

#[tokio::test]
async fn tcp_close_cancels_outstanding_requests() {
    // Accepts and reads but never answers
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        socket.read_exact(&mut request).await.unwrap();
        let _ = seen_tx.send(());
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let settings = TcpClientSettings::default().with_request_timeout(Duration::from_secs(30));
    let client = Arc::new(ModbusTcpClient::new("127.0.0.1", port, settings));
    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.read_holding_registers(1, BASE, 2).await })
    };
    seen_rx.await.unwrap();
    // Pipeline depth 1: this one waits in the queue
    let queued = {
        let client = client.clone();
        tokio::spawn(async move { client.read_holding_registers(1, COMMON_AT, 2).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close();
    for task in [in_flight, queued] {
        let err = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("request completed after close")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.exception, ModbusException::Cancelled);
    }
}

/// Reads one request from the slave end and returns it without CRC
async fn read_request(slave: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut request = vec![0u8; len];
    slave.read_exact(&mut request).await.unwrap();
    request
}

#[tokio::test]
async fn rtu_read_over_duplex() {
    let (master, mut slave) = tokio::io::duplex(256);
    let client = ModbusRtuClient::new(master, 9600, Duration::from_millis(500));

    let responder = tokio::spawn(async move {
        // unit + fc + start(2) + count(2) + crc(2)
        let request = read_request(&mut slave, 8).await;
        assert_eq!(request[..6], [2, 3, 0x9C, 0x40, 0x00, 0x02]);
        let reply = encode_rtu_frame(2, &[3, 4, 0x53, 0x75, 0x6e, 0x53]);
        slave.write_all(&reply).await.unwrap();
        slave
    });

    let values = client.read_holding_registers(2, 40000, 2).await.unwrap();
    assert_eq!(values, vec![0x5375, 0x6e53]);
    responder.await.unwrap();
}

#[tokio::test]
async fn rtu_corrupted_crc_times_out_then_recovers() {
    let (master, mut slave) = tokio::io::duplex(256);
    let client = ModbusRtuClient::new(master, 9600, Duration::from_millis(200));

    let responder = tokio::spawn(async move {
        read_request(&mut slave, 8).await;
        let mut reply = encode_rtu_frame(1, &[3, 2, 0x00, 0x2A]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        slave.write_all(&reply).await.unwrap();

        read_request(&mut slave, 8).await;
        slave
            .write_all(&encode_rtu_frame(1, &[3, 2, 0x00, 0x2A]))
            .await
            .unwrap();
        slave
    });

    let err = client.read_holding_registers(1, 100, 1).await.unwrap_err();
    assert_eq!(err.exception, ModbusException::Timeout);
    let values = client.read_holding_registers(1, 100, 1).await.unwrap();
    assert_eq!(values, vec![42]);
    responder.await.unwrap();
}

#[tokio::test]
async fn rtu_write_single_echoes_value() {
    let (master, mut slave) = tokio::io::duplex(256);
    let client = ModbusRtuClient::new(master, 19200, Duration::from_millis(500));

    let responder = tokio::spawn(async move {
        let request = read_request(&mut slave, 8).await;
        // A write-single reply echoes the request
        slave.write_all(&request).await.unwrap();
        slave
    });

    assert_eq!(client.write_single_register(3, 0x0010, 0x00FF).await.unwrap(), 0x00FF);
    responder.await.unwrap();
}

#[tokio::test]
async fn rtu_fixed_stream_stays_closed() {
    let (master, slave) = tokio::io::duplex(64);
    drop(slave);
    let client = ModbusRtuClient::new(master, 9600, Duration::from_millis(200));
    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert_eq!(err.exception, ModbusException::TcpError);
    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert_eq!(err.exception, ModbusException::TcpError);
}

#[tokio::test]
async fn rtu_link_reopens_after_port_failure() {
    let (first, first_slave) = tokio::io::duplex(64);
    drop(first_slave);
    let (second, mut second_slave) = tokio::io::duplex(256);
    let mut ports = vec![second, first];
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let connector: RtuConnector<DuplexStream> = Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        ports
            .pop()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unplugged"))
    });
    let client = ModbusRtuClient::with_connector(connector, 9600, Duration::from_millis(500));

    let responder = tokio::spawn(async move {
        read_request(&mut second_slave, 8).await;
        second_slave
            .write_all(&encode_rtu_frame(1, &[3, 2, 0x00, 0x2A]))
            .await
            .unwrap();
        second_slave
    });

    let err = client.read_holding_registers(1, 100, 1).await.unwrap_err();
    assert_eq!(err.exception, ModbusException::TcpError);
    let values = client.read_holding_registers(1, 100, 1).await.unwrap();
    assert_eq!(values, vec![42]);
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    responder.await.unwrap();
}

#[tokio::test]
async fn rtu_failed_open_backs_off() {
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let connector: RtuConnector<DuplexStream> = Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"))
    });
    let client = ModbusRtuClient::with_connector(connector, 9600, Duration::from_millis(200));

    for _ in 0..3 {
        let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert_eq!(err.exception, ModbusException::TcpError);
        assert!(err.message.contains("no such device"));
    }
    // Requests inside the backoff window fail without touching the port
    assert_eq!(opened.load(Ordering::SeqCst), 1);
}

#[test]
fn receiver_decodes_encoded_frame() {
    let frame = encode_rtu_frame(7, &[4, 4, 0x12, 0x34, 0xAB, 0xCD]);
    let mut receiver = RtuFrameReceiver::new();
    receiver.expect(7, FunctionCode::ReadInputRegisters);
    let events: Vec<_> = frame.iter().filter_map(|&b| receiver.feed(b)).collect();
    assert_eq!(events, vec![RtuEvent::Frame(vec![4, 4, 0x12, 0x34, 0xAB, 0xCD])]);
}

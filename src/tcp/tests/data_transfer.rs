use std::io::{self, ErrorKind};

use bytes::Bytes;
use tcp_types::tcp::TcpPacket;

use super::{TcpTestUnit, WIN_4KB};
use crate::tcp::{stats::Counter, Config, ConnFlags};

#[test]
fn in_order_payload_is_acked_on_fast_tick() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.handshake(1000, 1024);

    test.incoming(TcpPacket::new(1808, 80, 1001, 1, 1024, vec![8; 8]));
    test.assert_outgoing_eq(&[]);
    assert!(test.flags.contains(ConnFlags::DEL_ACK));
    assert_eq!(test.stat(Counter::PredDat), 1);

    test.fast_tick();
    test.assert_outgoing_eq(&[TcpPacket::new(80, 1808, 1, 1009, WIN_4KB - 8, Vec::new())]);

    assert_eq!(test.pull(), Some(Bytes::from(vec![8; 8])));
    assert_eq!(test.pull(), None);
    test.assert_outgoing_eq(&[]);
    Ok(())
}

#[test]
fn send_and_ack() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.connect();
    test.incoming(TcpPacket::syn_ack(
        &TcpPacket::syn(80, 1808, 0, WIN_4KB),
        4000,
        WIN_4KB,
    ));
    test.clear_outgoing();

    test.send(b"hello")?;
    test.assert_outgoing_eq(&[TcpPacket::new(80, 1808, 1, 4001, WIN_4KB, b"hello".to_vec())]);
    assert_eq!(test.in_flight(), 5);

    test.incoming(TcpPacket::new(1808, 80, 4001, 6, WIN_4KB, Vec::new()));
    test.assert_outgoing_eq(&[]);
    assert_eq!(test.in_flight(), 0);
    assert!(test.send_buffer().is_empty());
    assert_eq!(test.rtt.srtt, 7);
    assert_eq!(test.rtt.rttvar, 3);
    assert_eq!(test.cong.wnd, 2000);
    Ok(())
}

#[test]
fn out_of_order_payload_waits_for_the_gap() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.handshake(1000, WIN_4KB);

    test.incoming(TcpPacket::new(1808, 80, 1101, 1, WIN_4KB, vec![2; 100]));
    test.assert_outgoing_eq(&[TcpPacket::new(80, 1808, 1, 1001, WIN_4KB, Vec::new())]);
    assert!(!test.is_pullable());
    assert_eq!(test.pull(), None);

    test.incoming(TcpPacket::new(1808, 80, 1001, 1, WIN_4KB, vec![1; 100]));
    test.assert_outgoing_eq(&[TcpPacket::new(80, 1808, 1, 1201, WIN_4KB - 200, Vec::new())]);
    assert_eq!(test.recv.nxt, 1201);

    assert_eq!(test.pull(), Some(Bytes::from(vec![1; 100])));
    assert_eq!(test.pull(), Some(Bytes::from(vec![2; 100])));
    assert_eq!(test.pull(), None);
    Ok(())
}

#[test]
fn duplicate_payload_is_acked_again() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.handshake(1000, WIN_4KB);

    test.incoming(TcpPacket::new(1808, 80, 1001, 1, WIN_4KB, vec![1; 10]));
    test.fast_tick();
    test.clear_outgoing();

    test.incoming(TcpPacket::new(1808, 80, 1001, 1, WIN_4KB, vec![1; 10]));
    test.assert_outgoing_eq(&[TcpPacket::new(80, 1808, 1, 1011, WIN_4KB - 10, Vec::new())]);
    assert_eq!(test.stat(Counter::RcvDupPack), 1);
    assert_eq!(test.recv_queue().byte_len(), 10);
    Ok(())
}

#[test]
fn partial_overlap_is_trimmed() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.handshake(1000, WIN_4KB);

    test.incoming(TcpPacket::new(1808, 80, 1001, 1, WIN_4KB, vec![1; 10]));
    test.incoming(TcpPacket::new(1808, 80, 1006, 1, WIN_4KB, vec![2; 10]));
    assert_eq!(test.stat(Counter::RcvPartDupPack), 1);
    assert_eq!(test.recv.nxt, 1016);

    let data = test.pull_all();
    assert_eq!(&data[..10], &[1; 10]);
    assert_eq!(&data[10..], &[2; 5]);
    Ok(())
}

#[test]
fn payload_beyond_window_is_cut() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.handshake(1000, WIN_4KB);

    test.incoming(TcpPacket::new(1808, 80, 1001, 1, WIN_4KB, vec![3; 5000]));
    assert_eq!(test.recv.nxt, 1001 + u32::from(WIN_4KB));
    assert_eq!(test.stat(Counter::RcvPackAfterWin), 1);
    assert_eq!(test.stat(Counter::RcvByteAfterWin), 5000 - u64::from(WIN_4KB));
    Ok(())
}

#[test]
fn send_buffer_full() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.cfg(Config {
        send_buffer_units: 2,
        ..super::test_cfg()
    });
    test.handshake(1000, WIN_4KB);

    test.send(b"a")?;
    test.send(b"b")?;
    let err = test.send(b"c").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
    assert_eq!(test.stat(Counter::SndBufFull), 1);
    assert!(!test.accepts_user_data());
    Ok(())
}

#[test]
fn send_after_close_fails() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.handshake(1000, WIN_4KB);

    test.close();
    let err = test.send(b"late").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    Ok(())
}

#[test]
fn bulk_transfer_between_two_connections() -> io::Result<()> {
    let mut client = TcpTestUnit::client();
    let mut server = TcpTestUnit::server();
    client.handshake_pipe(&mut server);

    let mut sent = Vec::new();
    for i in 0..10u8 {
        let chunk = vec![i; 500];
        sent.extend_from_slice(&chunk);
        client.send(&chunk)?;
    }

    let mut received = Vec::new();
    for _ in 0..64 {
        client.pipe_all(&mut server);
        received.extend(server.pull_all());
        server.fast_tick();
        server.pipe_all(&mut client);

        if client.send_buffer().is_empty() && client.tx.is_empty() && server.tx.is_empty() {
            break;
        }
    }

    assert_eq!(received, sent);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(server.recv.nxt, 1 + 5000);
    Ok(())
}

use std::io;

use tcp_types::tcp::{TcpOption, TcpPacket};

use super::{syn_with_mss, TcpTestUnit, MSS, WIN_4KB};
use crate::tcp::{connection::TCP_MIN_MSS, stats::Counter, Config, ConnFlags, State};

#[test]
fn passive_open() -> io::Result<()> {
    let mut test = TcpTestUnit::server();

    let syn = TcpPacket::syn(1808, 80, 1000, 1024);
    test.incoming(syn.clone());
    test.assert_outgoing_eq(&[TcpPacket::syn_ack(&syn, 0, WIN_4KB)
        .with_option(TcpOption::MaximumSegmentSize(MSS))]);
    assert_eq!(test.state, State::SynRcvd);

    test.incoming(TcpPacket::new(1808, 80, 1001, 1, 1024, Vec::new()));
    test.assert_outgoing_eq(&[]);
    assert_eq!(test.state, State::Estab);
    assert_eq!(test.send.una, 1);
    assert_eq!(test.send.wnd, 1024);
    assert_eq!(test.recv.nxt, 1001);
    assert_eq!(test.recv.adv, 1001 + u32::from(WIN_4KB));

    // The handshake doubles as the first RTT sample.
    assert_eq!(test.rtt.srtt, 8);
    assert_eq!(test.rtt.rttvar, 2);
    assert_eq!(test.rtt.rxtcur, 3);

    assert_eq!(test.stat(Counter::Accepts), 1);
    Ok(())
}

#[test]
fn active_open() -> io::Result<()> {
    let mut test = TcpTestUnit::server();

    test.connect();
    let syn = syn_with_mss(80, 1808, 0);
    test.assert_outgoing_eq(&[syn.clone()]);
    assert_eq!(test.state, State::SynSent);

    test.incoming(TcpPacket::syn_ack(&syn, 4000, WIN_4KB));
    test.assert_outgoing_eq(&[TcpPacket::new(80, 1808, 1, 4001, WIN_4KB, Vec::new())]);
    assert_eq!(test.state, State::Estab);
    assert_eq!(test.send.wnd, u32::from(WIN_4KB));
    assert_eq!(test.cong.wnd, u32::from(MSS));

    assert_eq!(test.stat(Counter::Connects), 1);
    Ok(())
}

#[test]
fn simultaneous_open() -> io::Result<()> {
    let mut test = TcpTestUnit::server();

    test.connect();
    test.assert_outgoing_eq(&[syn_with_mss(80, 1808, 0)]);

    // The peer's own SYN crosses ours.
    test.incoming(TcpPacket::syn(1808, 80, 4000, WIN_4KB));
    assert_eq!(test.state, State::SynRcvd);
    let out = test.take_outgoing();
    assert_eq!(out.len(), 1);
    assert!(out[0].flags.syn && out[0].flags.ack);
    assert_eq!(out[0].seq_no, 0);
    assert_eq!(out[0].ack_no, 4001);

    test.incoming(TcpPacket::syn_ack(&TcpPacket::syn(80, 1808, 0, WIN_4KB), 4000, WIN_4KB));
    // The duplicate SYN is trimmed away, its ACK completes the handshake.
    assert_eq!(test.state, State::Estab);
    Ok(())
}

#[test]
fn peer_mss_is_adopted_if_smaller() -> io::Result<()> {
    let mut test = TcpTestUnit::server();

    test.incoming(
        TcpPacket::syn(1808, 80, 1000, WIN_4KB).with_option(TcpOption::MaximumSegmentSize(536)),
    );
    assert_eq!(test.cong.mss, 536);
    assert_eq!(test.cong.wnd, 536);

    let mut test = TcpTestUnit::server();
    test.incoming(
        TcpPacket::syn(1808, 80, 1000, WIN_4KB).with_option(TcpOption::MaximumSegmentSize(9000)),
    );
    assert_eq!(test.cong.mss, MSS);
    Ok(())
}

#[test]
fn segment_size_has_a_floor() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.cfg(Config {
        mss: 0,
        ..super::test_cfg()
    });
    test.connect();
    let syn = test.take_outgoing();
    assert_eq!(syn[0].options, [TcpOption::MaximumSegmentSize(TCP_MIN_MSS)]);
    assert_eq!(test.cong.mss, TCP_MIN_MSS);
    assert_eq!(test.cong.wnd, u32::from(TCP_MIN_MSS));

    let mut test = TcpTestUnit::server();
    test.incoming(
        TcpPacket::syn(1808, 80, 1000, WIN_4KB).with_option(TcpOption::MaximumSegmentSize(1)),
    );
    assert_eq!(test.cong.mss, TCP_MIN_MSS);
    Ok(())
}

#[test]
fn no_options_suppresses_mss() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.cfg.no_options = true;

    test.connect();
    test.assert_outgoing_eq(&[TcpPacket::syn(80, 1808, 0, WIN_4KB)]);
    assert!(test.flags.contains(ConnFlags::NO_OPT));
    Ok(())
}

#[test]
fn window_scale_and_timestamps_negotiated() -> io::Result<()> {
    let cfg = Config {
        window_scale: 2,
        use_timestamps: true,
        ..super::test_cfg()
    };
    let mut client = TcpTestUnit::client();
    let mut server = TcpTestUnit::server();
    client.cfg(cfg.clone());
    server.cfg(cfg);

    client.connect();
    let syn = client.tx[0].clone();
    assert_eq!(
        syn.options,
        [
            TcpOption::MaximumSegmentSize(MSS),
            TcpOption::WindowScaling(2),
            TcpOption::Timestamp(0, 0),
        ]
    );
    client.pipe(&mut server, 1);

    let syn_ack = server.tx[0].clone();
    assert!(syn_ack.options.contains(&TcpOption::WindowScaling(2)));
    // Windows on SYNs are never scaled.
    assert_eq!(syn_ack.window, WIN_4KB);
    server.pipe(&mut client, 1);

    let ack = client.tx[0].clone();
    assert_eq!(ack.window, WIN_4KB >> 2);
    client.pipe(&mut server, 1);

    for side in [&client, &server] {
        assert_eq!(side.state, State::Estab);
        assert_eq!(side.scale.snd, 2);
        assert_eq!(side.scale.rcv, 2);
        assert!(side.flags.contains(ConnFlags::RCVD_TSTMP));
    }
    assert_eq!(server.send.wnd, u32::from(WIN_4KB));
    Ok(())
}

#[test]
fn scaling_needs_both_sides() -> io::Result<()> {
    let mut client = TcpTestUnit::client();
    let mut server = TcpTestUnit::server();
    client.cfg(Config {
        window_scale: 3,
        ..super::test_cfg()
    });

    client.handshake_pipe(&mut server);
    assert_eq!(client.scale.snd, 0);
    assert_eq!(client.scale.rcv, 0);
    assert_eq!(server.scale.snd, 0);
    Ok(())
}

#[test]
fn summary_describes_the_connection() -> io::Result<()> {
    let mut test = TcpTestUnit::server();
    test.handshake(1000, WIN_4KB);

    let summary = test.summary();
    assert_eq!(summary.state, State::Estab);
    assert_eq!(summary.rcv_nxt, 1001);
    let printed = summary.to_string();
    assert!(printed.contains("ESTABLISHED"));
    assert!(printed.contains("KEEP"));
    Ok(())
}

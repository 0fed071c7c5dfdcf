use std::io::{self, ErrorKind};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use super::{TcpTestUnit, WIN_4KB};
use crate::tcp::seq::{seq_diff, seq_geq, seq_leq};

fn assert_sequence_spaces(test: &TcpTestUnit, prev_rcv_nxt: u32) {
    assert!(
        seq_leq(test.send.una, test.send.nxt) && seq_leq(test.send.nxt, test.send.max),
        "una {} nxt {} max {}",
        test.send.una,
        test.send.nxt,
        test.send.max
    );
    assert!(
        seq_geq(test.recv.nxt, prev_rcv_nxt),
        "rcv_nxt went back from {prev_rcv_nxt} to {}",
        test.recv.nxt
    );
}

fn random_window(rng: &mut StdRng) -> u16 {
    if rng.gen_bool(0.1) {
        0
    } else {
        rng.gen_range(1..=WIN_4KB)
    }
}

fn random_ack(rng: &mut StdRng, test: &TcpTestUnit) -> u32 {
    let span = seq_diff(test.send.max, test.send.una);
    test.send.una.wrapping_add_signed(rng.gen_range(-100..span + 100))
}

#[test]
fn sequence_spaces_hold_under_random_events() -> io::Result<()> {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut test = TcpTestUnit::server();
        test.handshake(1000, WIN_4KB);
        let mut rcv_nxt = test.recv.nxt;

        for _ in 0..300 {
            match rng.gen_range(0..7) {
                0 => {
                    let len = rng.gen_range(1..1500);
                    if let Err(e) = test.send(&vec![7u8; len]) {
                        assert_eq!(e.kind(), ErrorKind::WouldBlock);
                    }
                }
                1 | 2 => {
                    let seq = test.recv.nxt.wrapping_add_signed(rng.gen_range(-1500..5000));
                    let len = rng.gen_range(0..1200);
                    let ack = random_ack(&mut rng, &test);
                    let win = random_window(&mut rng);
                    let pkt = test.from_peer(seq, ack, win, &vec![1u8; len]);
                    test.incoming(pkt);
                }
                3 => {
                    let ack = random_ack(&mut rng, &test);
                    let win = random_window(&mut rng);
                    let pkt = test.from_peer(test.recv.nxt, ack, win, &[]);
                    test.incoming(pkt);
                }
                4 => {
                    test.pull();
                }
                5 => test.fast_tick(),
                _ => test.slow_tick(),
            }
            test.clear_outgoing();

            if test.is_closed() {
                break;
            }
            assert_sequence_spaces(&test, rcv_nxt);
            rcv_nxt = test.recv.nxt;
        }
    }
    Ok(())
}

/// Delivers what `from` sent, dropping about 15% and reordering the rest.
fn lossy_pipe(rng: &mut StdRng, from: &mut TcpTestUnit, to: &mut TcpTestUnit) {
    let mut pkts = from.take_outgoing();
    pkts.retain(|_| !rng.gen_bool(0.15));
    pkts.shuffle(rng);
    for pkt in pkts {
        to.incoming(pkt);
    }
}

#[test]
fn transfer_survives_loss_and_reordering() -> io::Result<()> {
    for seed in 0..16 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut client = TcpTestUnit::client();
        let mut server = TcpTestUnit::server();
        client.handshake_pipe(&mut server);

        let mut sent = Vec::new();
        for i in 0..20u8 {
            let chunk = vec![i; 700];
            sent.extend_from_slice(&chunk);
            client.send(&chunk)?;
        }

        let mut received = Vec::new();
        for _ in 0..20_000 {
            lossy_pipe(&mut rng, &mut client, &mut server);
            received.extend(server.pull_all());
            server.fast_tick();
            lossy_pipe(&mut rng, &mut server, &mut client);

            if received.len() == sent.len() && client.in_flight() == 0 {
                break;
            }
            client.slow_tick();
            server.slow_tick();
        }

        assert_eq!(received, sent, "seed {seed}");
        assert!(client.send_buffer().is_empty());
        assert_eq!(server.recv.nxt, 1 + sent.len() as u32);
    }
    Ok(())
}

mod common;

use std::net::{SocketAddr, TcpListener};
use std::thread;

use common::*;
use rrp2p::config::ClusterConfig;
use rrp2p::*;

fn free_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect::<Vec<_>>();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

fn tcp_config(peers: &[SocketAddr], rank: usize) -> Config {
    Config {
        io_timeout_ms: 10_000,
        cluster: Some(ClusterConfig {
            rank,
            peers: peers.to_vec(),
        }),
        ..config()
    }
}

#[test]
fn exchanges_over_tcp() {
    const WORLD: usize = 3;
    let peers = free_addrs(WORLD);

    // Every rank sends its rank number to every other rank, then receives
    // one message from each of them.
    let ranks = (0..WORLD)
        .map(|rank| {
            let cfg = tcp_config(&peers, rank);
            thread::spawn(move || {
                let s = Session::over_tcp(cfg).unwrap();
                s.initialize().unwrap();
                assert_eq!(s.world_size(), WORLD);

                let mut src = Registered::new(&s, vec![rank as u8; 4096]);
                let mut dst = Registered::zeroed(&s, 4096 * WORLD);
                let (sr, dr) = (src.region(), dst.region());

                for peer in (0..WORLD).filter(|&p| p != rank) {
                    let region = dr.slice(peer * 4096, 4096).unwrap();
                    s.recv(peer, region, dst.handle, 4096, 11, TransferContext(peer as u64), TransferFlags::EMPTY)
                        .unwrap();
                    s.send(peer, sr, src.handle, 4096, 11, TransferContext(peer as u64), TransferFlags::EMPTY)
                        .unwrap();
                }
                for _ in 1..WORLD {
                    assert!(pop_send(&s).is_success());
                    let e = pop_recv(&s);
                    assert_eq!(e.ok(), Ok(4096));
                    assert_eq!(e.context.0, e.peer_rank as u64);
                }
                for peer in (0..WORLD).filter(|&p| p != rank) {
                    let chunk = &dst.buf[peer * 4096..(peer + 1) * 4096];
                    assert!(chunk.iter().all(|&b| b == peer as u8));
                }
                s.deregister_memory(src.handle).unwrap();
                s.deregister_memory(dst.handle).unwrap();
                s
            })
        })
        .collect::<Vec<_>>();

    // Shut down only after every rank is done, so no one sees a lost peer.
    let sessions = ranks
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();
    for s in &sessions {
        s.shutdown().unwrap();
    }
}

#[test]
fn send_beyond_message_limit_fails() {
    let peers = free_addrs(2);
    let ranks = (0..2)
        .map(|rank| {
            let cfg = Config {
                max_message_bytes: 64,
                ..tcp_config(&peers, rank)
            };
            thread::spawn(move || {
                let s = Session::over_tcp(cfg).unwrap();
                s.initialize().unwrap();
                s
            })
        })
        .collect::<Vec<_>>();
    let mut ss = ranks.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
    let s1 = ss.pop().unwrap();
    let s0 = ss.pop().unwrap();

    let mut src = Registered::zeroed(&s0, 128);
    let mut dst = Registered::zeroed(&s1, 128);
    let (sr, dr) = (src.region(), dst.region());

    s0.send(1, sr, src.handle, 128, 4, TransferContext(1), TransferFlags::EMPTY)
        .unwrap();
    assert_eq!(pop_send(&s0).status(), Some(CompletionStatus::LengthMismatch));

    // The connection survives the rejected send.
    s1.recv(0, dr, dst.handle, 128, 4, TransferContext(2), TransferFlags::EMPTY)
        .unwrap();
    s0.send(1, sr, src.handle, 64, 4, TransferContext(3), TransferFlags::EMPTY)
        .unwrap();
    assert!(pop_send(&s0).is_success());
    let e = pop_recv(&s1);
    assert_eq!((e.context, e.ok()), (TransferContext(2), Ok(64)));

    s0.shutdown().unwrap();
    s1.shutdown().unwrap();
}

#[test]
fn missing_cluster_table() {
    assert!(matches!(
        Session::over_tcp(config()),
        Err(SessionError::NoCluster)
    ));
}

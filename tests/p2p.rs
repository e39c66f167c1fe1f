mod common;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use common::*;
use rrp2p::*;

const NO_FLAGS: TransferFlags = TransferFlags::EMPTY;

#[test]
fn transfers_integer_between_two_ranks() {
    let ss = loopback(2);
    let (s0, s1) = (ss[0].clone(), ss[1].clone());

    let receiver = thread::spawn(move || {
        let mut mem = Registered::new(&s1, vec![0xff; 1024]);
        let region = mem.region();
        s1.recv(0, region, mem.handle, 1024, 9876, TransferContext(0x4567), NO_FLAGS)
            .unwrap();
        let entry = pop_recv(&s1);
        assert_eq!(entry.context, TransferContext(0x4567));
        assert_eq!(entry.peer_rank, 0);
        assert_eq!(entry.tensor_id, 9876);
        assert_eq!(entry.error_code, 0);
        assert_eq!(entry.bytes, 1024);
        i32::from_ne_bytes(mem.buf[..4].try_into().unwrap())
    });

    let mut mem = Registered::zeroed(&s0, 1024);
    mem.buf[..4].copy_from_slice(&0i32.to_ne_bytes());
    let region = mem.region();
    s0.send(1, region, mem.handle, 1024, 9876, TransferContext(0x1234), NO_FLAGS)
        .unwrap();
    let entry = pop_send(&s0);
    assert_eq!(entry.context, TransferContext(0x1234));
    assert_eq!(entry.peer_rank, 1);
    assert_eq!(entry.tensor_id, 9876);
    assert_eq!(entry.error_code, 0);

    assert_eq!(receiver.join().unwrap(), 0);
}

#[test]
fn rejects_out_of_range_rank() {
    let ss = loopback(2);
    let mut mem = Registered::zeroed(&ss[0], 64);
    let region = mem.region();

    for dst in [2, 100, 0] {
        assert!(matches!(
            ss[0].send(dst, region, mem.handle, 64, 1, TransferContext(1), NO_FLAGS),
            Err(TransferError::InvalidRank { world_size: 2, .. })
        ));
    }
    assert!(matches!(
        ss[0].recv(2, region, mem.handle, 64, 1, TransferContext(1), NO_FLAGS),
        Err(TransferError::InvalidRank { rank: 2, world_size: 2 })
    ));
    assert_eq!(ss[0].outstanding(), 0);
    assert_eq!(ss[0].try_pop_send_completion(), Ok(None));
    assert_eq!(ss[0].try_pop_recv_completion(), Ok(None));
}

#[test]
fn deregistered_handle_is_unusable() {
    let ss = loopback(2);
    let s = &ss[0];
    let mut mem = Registered::zeroed(s, 256);
    let region = mem.region();

    s.deregister_memory(mem.handle).unwrap();
    assert!(matches!(
        s.deregister_memory(mem.handle),
        Err(RegError::InvalidHandle)
    ));
    assert!(matches!(
        s.send(1, region, mem.handle, 256, 3, TransferContext(3), NO_FLAGS),
        Err(TransferError::InvalidHandle)
    ));
    assert!(matches!(
        s.recv(1, region, mem.handle, 256, 3, TransferContext(3), NO_FLAGS),
        Err(TransferError::InvalidHandle)
    ));

    // A handle of another region does not cover this one.
    let other = Registered::zeroed(s, 256);
    assert!(matches!(
        s.send(1, region, other.handle, 256, 3, TransferContext(3), NO_FLAGS),
        Err(TransferError::InvalidHandle)
    ));

    assert_eq!(s.try_pop_send_completion(), Ok(None));
    assert_eq!(s.try_pop_recv_completion(), Ok(None));
}

#[test]
fn rejects_length_beyond_region() {
    let ss = loopback(2);
    let mut mem = Registered::zeroed(&ss[0], 128);
    let region = mem.region().slice(0, 64).unwrap();
    assert!(matches!(
        ss[0].send(1, region, mem.handle, 65, 0, TransferContext(0), NO_FLAGS),
        Err(TransferError::LengthExceedsRegion { length: 65, region: 64 })
    ));
    assert_eq!(ss[0].try_pop_send_completion(), Ok(None));
}

#[test]
fn same_tag_completes_in_issue_order() {
    const N: usize = 64;
    const CHUNK: usize = 16;

    let ss = loopback(2);
    let (s0, s1) = (ss[0].clone(), ss[1].clone());

    let mut src = Registered::new(
        &s0,
        (0..N).flat_map(|i| [i as u8; CHUNK]).collect::<Vec<_>>(),
    );
    let mut dst = Registered::zeroed(&s1, N * CHUNK);
    let (src_region, dst_region) = (src.region(), dst.region());

    for i in 0..N {
        let region = src_region.slice(i * CHUNK, CHUNK).unwrap();
        s0.send(1, region, src.handle, CHUNK, 5, TransferContext(i as u64), NO_FLAGS)
            .unwrap();
    }
    for i in 0..N {
        let region = dst_region.slice(i * CHUNK, CHUNK).unwrap();
        s1.recv(0, region, dst.handle, CHUNK, 5, TransferContext(i as u64), NO_FLAGS)
            .unwrap();
    }

    let sent = (0..N).map(|_| pop_send(&s0).context.0).collect::<Vec<_>>();
    let recvd = (0..N).map(|_| pop_recv(&s1).context.0).collect::<Vec<_>>();
    let expected = (0..N as u64).collect::<Vec<_>>();
    assert_eq!(sent, expected);
    assert_eq!(recvd, expected);
    assert_eq!(dst.buf, src.buf);
}

#[test]
fn posted_receives_match_in_issue_order() {
    const N: usize = 16;
    const CHUNK: usize = 32;

    let ss = loopback(2);
    let (s0, s1) = (ss[0].clone(), ss[1].clone());
    let mut src = Registered::new(
        &s0,
        (0..N).flat_map(|i| [i as u8 + 1; CHUNK]).collect::<Vec<_>>(),
    );
    let mut dst = Registered::zeroed(&s1, N * CHUNK);
    let (src_region, dst_region) = (src.region(), dst.region());

    // Receive `i` lands in slot `N - 1 - i`, so a mix-up shows in the buffer
    // as well as in the completion order.
    for i in 0..N {
        let region = dst_region.slice((N - 1 - i) * CHUNK, CHUNK).unwrap();
        s1.recv(0, region, dst.handle, CHUNK, 21, TransferContext(i as u64), NO_FLAGS)
            .unwrap();
    }
    assert_eq!(s1.outstanding(), N);
    assert_eq!(s1.try_pop_recv_completion(), Ok(None));

    for i in 0..N {
        let region = src_region.slice(i * CHUNK, CHUNK).unwrap();
        s0.send(1, region, src.handle, CHUNK, 21, TransferContext(i as u64), NO_FLAGS)
            .unwrap();
        assert_eq!(pop_send(&s0).context, TransferContext(i as u64));
    }

    let recvd = (0..N)
        .map(|_| {
            let e = pop_recv(&s1);
            assert_eq!(e.ok(), Ok(CHUNK));
            e.context.0
        })
        .collect::<Vec<_>>();
    assert_eq!(recvd, (0..N as u64).collect::<Vec<_>>());
    for i in 0..N {
        let slot = &dst.buf[(N - 1 - i) * CHUNK..(N - i) * CHUNK];
        assert!(slot.iter().all(|&b| b == i as u8 + 1), "receive {i} got {slot:?}");
    }
    assert_eq!(s1.outstanding(), 0);
}

#[test]
fn every_admitted_request_completes_once() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 50;

    let ss = loopback(2);
    let mut src = Registered::new(&ss[0], vec![7; 8]);
    let mut dst = Registered::zeroed(&ss[1], THREADS * PER_THREAD * 8);
    let (src_region, dst_region) = (src.region(), dst.region());
    let (src_handle, dst_handle) = (src.handle, dst.handle);

    let workers = (0..THREADS)
        .flat_map(|t| {
            let s0 = ss[0].clone();
            let s1 = ss[1].clone();
            let sender = thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let id = (t * PER_THREAD + i) as i32;
                    s0.send(1, src_region, src_handle, 8, id, TransferContext(id as u64), NO_FLAGS)
                        .unwrap();
                }
            });
            let receiver = thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let id = t * PER_THREAD + i;
                    let region = dst_region.slice(id * 8, 8).unwrap();
                    s1.recv(0, region, dst_handle, 8, id as i32, TransferContext(id as u64), NO_FLAGS)
                        .unwrap();
                }
            });
            [sender, receiver]
        })
        .collect::<Vec<_>>();
    for w in workers {
        w.join().unwrap();
    }

    let mut sent = HashSet::new();
    let mut recvd = HashSet::new();
    for _ in 0..THREADS * PER_THREAD {
        let e = pop_send(&ss[0]);
        assert!(e.is_success());
        assert_eq!(e.context.0, e.tensor_id as u64);
        assert!(sent.insert(e.context));

        let e = pop_recv(&ss[1]);
        assert!(e.is_success());
        assert_eq!(e.context.0, e.tensor_id as u64);
        assert!(recvd.insert(e.context));
    }
    assert_eq!(ss[0].try_pop_send_completion(), Ok(None));
    assert_eq!(ss[1].try_pop_recv_completion(), Ok(None));
    assert!(dst.buf.iter().all(|&b| b == 7));
}

#[test]
fn shutdown_wakes_blocked_pop() {
    let ss = loopback(2);
    let s1 = ss[1].clone();
    let mut mem = Registered::zeroed(&s1, 64);
    let region = mem.region();
    s1.recv(0, region, mem.handle, 64, 42, TransferContext(0xdead), NO_FLAGS)
        .unwrap();

    let waiter = {
        let s1 = s1.clone();
        thread::spawn(move || {
            let first = s1.pop_recv_completion();
            let second = s1.pop_recv_completion();
            (first, second)
        })
    };
    thread::sleep(Duration::from_millis(100));
    s1.shutdown().unwrap();

    let (first, second) = waiter.join().unwrap();
    let entry = first.unwrap();
    assert_eq!(entry.context, TransferContext(0xdead));
    assert_eq!(entry.status(), Some(CompletionStatus::Cancelled));
    assert_ne!(entry.error_code, 0);
    assert_eq!(second, Err(CompletionError::Shutdown));
    assert_eq!(s1.pop_send_completion(), Err(CompletionError::Shutdown));
    assert_eq!(s1.state(), SessionState::Terminated);
}

#[test]
fn shutdown_finishes_admitted_sends() {
    let ss = loopback(2);
    let mut src = Registered::new(&ss[0], vec![9; 32]);
    let region = src.region();
    for i in 0..8 {
        ss[0]
            .send(1, region, src.handle, 32, i, TransferContext(i as u64), NO_FLAGS)
            .unwrap();
    }
    ss[0].shutdown().unwrap();
    for i in 0..8 {
        let e = ss[0].pop_send_completion().unwrap();
        assert_eq!(e.tensor_id, i);
        assert!(e.is_success());
    }
    assert_eq!(ss[0].pop_send_completion(), Err(CompletionError::Shutdown));

    // Data sent before the sender went away is still delivered.
    let mut dst = Registered::zeroed(&ss[1], 32);
    let region = dst.region();
    for i in 0..8 {
        ss[1]
            .recv(0, region, dst.handle, 32, i, TransferContext(0), NO_FLAGS)
            .unwrap();
        assert!(pop_recv(&ss[1]).is_success());
    }
    assert_eq!(dst.buf, vec![9; 32]);

    // Anything more from the departed rank fails.
    ss[1]
        .recv(0, region, dst.handle, 32, 0, TransferContext(1), NO_FLAGS)
        .unwrap();
    let e = pop_recv(&ss[1]);
    assert_eq!(e.status(), Some(CompletionStatus::PeerUnreachable));
}

#[test]
fn oversized_message_fails_receive() {
    let ss = loopback(2);
    let mut src = Registered::new(&ss[0], vec![1; 128]);
    let mut dst = Registered::new(&ss[1], vec![2; 64]);
    let (sr, dr) = (src.region(), dst.region());

    ss[0].send(1, sr, src.handle, 128, 8, TransferContext(1), NO_FLAGS).unwrap();
    ss[1].recv(0, dr, dst.handle, 64, 8, TransferContext(2), NO_FLAGS).unwrap();

    assert!(pop_send(&ss[0]).is_success());
    let e = pop_recv(&ss[1]);
    assert_eq!(e.status(), Some(CompletionStatus::LengthMismatch));
    assert_eq!(dst.buf, vec![2; 64]);
}

#[test]
fn shorter_message_reports_bytes() {
    let ss = loopback(2);
    let mut src = Registered::new(&ss[0], vec![1; 16]);
    let mut dst = Registered::zeroed(&ss[1], 64);
    let (sr, dr) = (src.region(), dst.region());

    ss[1].recv(0, dr, dst.handle, 64, 8, TransferContext(2), NO_FLAGS).unwrap();
    ss[0].send(1, sr, src.handle, 16, 8, TransferContext(1), NO_FLAGS).unwrap();

    let e = pop_recv(&ss[1]);
    assert_eq!(e.ok(), Ok(16));
    assert_eq!(&dst.buf[..16], &[1; 16]);
    assert_eq!(&dst.buf[16..], &[0; 48]);
}

#[test]
fn region_in_use_cannot_be_deregistered() {
    let ss = loopback(2);
    let mut dst = Registered::zeroed(&ss[1], 32);
    let region = dst.region();
    ss[1].recv(0, region, dst.handle, 32, 1, TransferContext(0), NO_FLAGS).unwrap();

    assert!(matches!(
        ss[1].deregister_memory(dst.handle),
        Err(RegError::RegionInUse(1))
    ));

    let mut src = Registered::new(&ss[0], vec![4; 32]);
    let sr = src.region();
    ss[0].send(1, sr, src.handle, 32, 1, TransferContext(0), NO_FLAGS).unwrap();
    assert!(pop_recv(&ss[1]).is_success());
    ss[1].deregister_memory(dst.handle).unwrap();
}

#[test]
fn device_listing_is_stable() {
    let ss = loopback(2);
    let first = ss[0].list_devices().unwrap();
    let second = ss[0].list_devices().unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.iter().map(Device::name).collect::<Vec<_>>(),
        ["mlx5_0", "mlx5_1"]
    );
    assert!(first.contains(&ss[0].local_device().unwrap()));
}

#[test]
fn lifecycle_errors() {
    let ep = LoopbackFabric::endpoints(1).remove(0);
    let s = Session::new(config(), ep);
    let mut buf = vec![0u8; 8];

    assert!(matches!(s.list_devices(), Err(SessionError::NotInitialized)));
    assert!(matches!(
        unsafe { s.register_memory(buf.as_mut_ptr(), 8) },
        Err(RegError::Session(SessionError::NotInitialized))
    ));
    assert_eq!(s.pop_recv_completion(), Err(CompletionError::NotInitialized));

    s.initialize().unwrap();
    assert!(matches!(s.initialize(), Err(SessionError::AlreadyInitialized)));
    let h = unsafe { s.register_memory(buf.as_mut_ptr(), 8) }.unwrap();

    s.shutdown().unwrap();
    assert!(matches!(s.initialize(), Err(SessionError::SessionTerminated)));
    assert!(matches!(s.shutdown(), Err(SessionError::NotInitialized)));
    assert_eq!(s.state(), SessionState::Terminated);
    assert!(matches!(
        s.deregister_memory(h),
        Err(RegError::Session(SessionError::NotInitialized))
    ));
    assert!(matches!(
        s.send(0, MemoryRegion::from_slice(&mut buf), h, 8, 0, TransferContext(0), NO_FLAGS),
        Err(TransferError::Session(SessionError::NotInitialized))
    ));
}

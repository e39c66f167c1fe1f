//! Even ranks send a 1024-byte buffer to the next odd rank.
//!
//! ```text
//! cargo run --example p2p_demo                 # two ranks as threads
//! cargo run --example p2p_demo -- p2p.toml     # one rank of a TCP cluster
//! ```

use std::thread;

use anyhow::Result;
use rrp2p::prelude::*;

const LENGTH: usize = 1024;
const TENSOR_ID: TensorId = 9876;

fn run(session: Session) -> Result<()> {
    let (world_size, world_rank) = (session.world_size(), session.rank());
    println!("Hello from P2P Demo");
    println!("world_size {world_size} world_rank {world_rank}");

    session.initialize()?;
    println!("Local Device (GPU Index): ");
    println!("{}", session.local_gpu()?);

    println!("RDMA Devices:");
    for device in session.list_devices()? {
        println!("{device}");
    }

    // Registered memory must outlive every transfer through it.
    let mut buf = vec![0u8; LENGTH];
    buf[..4].copy_from_slice(&(world_rank as i32).to_ne_bytes());
    let region = MemoryRegion::from_slice(&mut buf);
    let mr = unsafe { session.register_memory(region.addr(), region.len())? };

    if world_rank % 2 == 0 {
        let rank = world_rank + 1;
        let context = TransferContext(0x1234);
        println!(
            "Sending... rank is {rank} buf is {:p} mr is {mr} length is {LENGTH} tensor_id is {TENSOR_ID} context is {context}",
            region.addr()
        );
        session.send(rank, region, mr, LENGTH, TENSOR_ID, context, TransferFlags::EMPTY)?;
        let entry = session.pop_send_completion()?;
        println!(
            "Send is done context is {} dst_rank is {} tensor_id is {} error_code is {}",
            entry.context, entry.peer_rank, entry.tensor_id, entry.error_code
        );
    } else {
        let rank = world_rank - 1;
        let context = TransferContext(0x4567);
        println!(
            "Receiving... rank is {rank} buf is {:p} mr is {mr} length is {LENGTH} tensor_id is {TENSOR_ID} context is {context}",
            region.addr()
        );
        session.recv(rank, region, mr, LENGTH, TENSOR_ID, context, TransferFlags::EMPTY)?;
        let entry = session.pop_recv_completion()?;
        println!(
            "Recv is done context is {} dst_rank is {} tensor_id is {} error_code is {}",
            entry.context, entry.peer_rank, entry.tensor_id, entry.error_code
        );
    }

    let data = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    println!("Rank {world_rank} has data {data}");

    session.shutdown()?;
    Ok(())
}

fn main() -> Result<()> {
    if let Some(path) = std::env::args().nth(1) {
        return run(Session::over_tcp(Config::load_toml(path)?)?);
    }

    let config = Config::with_devices(["lo_0"]);
    let ranks = LoopbackFabric::endpoints(2)
        .into_iter()
        .map(|ep| {
            let session = Session::new(config.clone(), ep);
            thread::spawn(move || run(session))
        })
        .collect::<Vec<_>>();
    for rank in ranks {
        rank.join().map_err(|_| anyhow::anyhow!("rank panicked"))??;
    }
    Ok(())
}

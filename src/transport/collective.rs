//! Wire algorithms over a connected context.
//!
//! Every function takes the per-invocation tag allocated by the engine;
//! frames between one peer pair under one tag are delivered in order,
//! which is what the step-matched loops below rely on. Sends drain into
//! the peer's reader thread, so send-all-then-receive patterns cannot
//! deadlock.

use crate::error::{PlexusError, Result};
use crate::reduce::ReduceFn;
use crate::transport::context::{Context, LANE_COLLECTIVE};
use crate::types::{Rank, Tag};

/// Per-rank chunk layout for the ring all-reduce: `count` elements split
/// into `world` chunks, the first `count % world` chunks one element
/// longer.
struct ChunkLayout {
    offsets: Vec<usize>,
    counts: Vec<usize>,
}

impl ChunkLayout {
    fn new(count: usize, world: usize) -> Self {
        let base = count / world;
        let extra = count % world;
        let mut offsets = Vec::with_capacity(world);
        let mut counts = Vec::with_capacity(world);
        let mut off = 0;
        for chunk in 0..world {
            let len = base + usize::from(chunk < extra);
            offsets.push(off);
            counts.push(len);
            off += len;
        }
        Self { offsets, counts }
    }
}

fn expect_len(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(PlexusError::SizeMismatch {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Root sends its buffer to every peer; non-roots receive into theirs.
pub fn broadcast(ctx: &Context, tag: Tag, buf: &mut [u8], root: Rank) -> Result<()> {
    if ctx.size() == 1 {
        return Ok(());
    }
    if ctx.rank() == root {
        for peer in 0..ctx.size() {
            if peer != root {
                ctx.send(peer, LANE_COLLECTIVE, tag, buf)?;
            }
        }
    } else {
        let payload = ctx.recv(root, LANE_COLLECTIVE, tag)?;
        expect_len(&payload, buf.len())?;
        buf.copy_from_slice(&payload);
    }
    Ok(())
}

/// In-place ring all-reduce: a scatter-reduce phase followed by an
/// all-gather phase, `world - 1` rounds each. `buf` holds `count`
/// elements; after return it contains the reduction of all ranks'
/// buffers.
pub fn allreduce(
    ctx: &Context,
    tag: Tag,
    buf: &mut [u8],
    count: usize,
    reduce: ReduceFn,
) -> Result<()> {
    let world = ctx.size() as usize;
    if world == 1 || count == 0 {
        return Ok(());
    }
    let rank = ctx.rank() as usize;
    let elem_size = buf.len() / count;
    let layout = ChunkLayout::new(count, world);
    let range = |chunk: usize| {
        let start = layout.offsets[chunk] * elem_size;
        start..start + layout.counts[chunk] * elem_size
    };

    let next = ((rank + 1) % world) as Rank;
    let prev = ((rank + world - 1) % world) as Rank;

    // Phase 1: scatter-reduce. After round `step`, chunk `recv_idx` holds
    // the partial reduction of `step + 2` ranks.
    for step in 0..world - 1 {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;

        ctx.send(next, LANE_COLLECTIVE, tag, &buf[range(send_idx)])?;
        let received = ctx.recv(prev, LANE_COLLECTIVE, tag)?;
        let recv_range = range(recv_idx);
        expect_len(&received, recv_range.len())?;
        reduce(&mut buf[recv_range], &received, layout.counts[recv_idx]);
    }

    // Phase 2: all-gather the fully reduced chunks around the ring.
    for step in 0..world - 1 {
        let send_idx = (rank + world + 1 - step) % world;
        let recv_idx = (rank + world - step) % world;

        ctx.send(next, LANE_COLLECTIVE, tag, &buf[range(send_idx)])?;
        let received = ctx.recv(prev, LANE_COLLECTIVE, tag)?;
        let recv_range = range(recv_idx);
        expect_len(&received, recv_range.len())?;
        buf[recv_range].copy_from_slice(&received);
    }

    Ok(())
}

/// Reduce every rank's buffer into the root's, in rank order.
pub fn reduce(
    ctx: &Context,
    tag: Tag,
    buf: &mut [u8],
    count: usize,
    root: Rank,
    reduce: ReduceFn,
) -> Result<()> {
    if ctx.size() == 1 {
        return Ok(());
    }
    if ctx.rank() == root {
        for peer in 0..ctx.size() {
            if peer == root {
                continue;
            }
            let received = ctx.recv(peer, LANE_COLLECTIVE, tag)?;
            expect_len(&received, buf.len())?;
            reduce(buf, &received, count);
        }
    } else {
        ctx.send(root, LANE_COLLECTIVE, tag, buf)?;
    }
    Ok(())
}

/// Every rank contributes `input`; `output` receives the rank-ordered
/// concatenation of all contributions.
pub fn allgather(ctx: &Context, tag: Tag, input: &[u8], output: &mut [u8]) -> Result<()> {
    let world = ctx.size() as usize;
    let chunk = input.len();
    expect_len(output, chunk * world)?;
    let rank = ctx.rank() as usize;
    output[rank * chunk..(rank + 1) * chunk].copy_from_slice(input);
    for peer in 0..ctx.size() {
        if peer != ctx.rank() {
            ctx.send(peer, LANE_COLLECTIVE, tag, input)?;
        }
    }
    for peer in 0..ctx.size() {
        if peer == ctx.rank() {
            continue;
        }
        let received = ctx.recv(peer, LANE_COLLECTIVE, tag)?;
        expect_len(&received, chunk)?;
        let peer = peer as usize;
        output[peer * chunk..(peer + 1) * chunk].copy_from_slice(&received);
    }
    Ok(())
}

/// Collect every rank's `input` into the root's `output`, rank-ordered.
/// Non-roots pass `None`.
pub fn gather(
    ctx: &Context,
    tag: Tag,
    root: Rank,
    input: &[u8],
    output: Option<&mut [u8]>,
) -> Result<()> {
    let world = ctx.size() as usize;
    let chunk = input.len();
    if ctx.rank() == root {
        let output = output.ok_or_else(|| {
            PlexusError::transport("gather root called without an output buffer")
        })?;
        expect_len(output, chunk * world)?;
        let rank = ctx.rank() as usize;
        output[rank * chunk..(rank + 1) * chunk].copy_from_slice(input);
        for peer in 0..ctx.size() {
            if peer == root {
                continue;
            }
            let received = ctx.recv(peer, LANE_COLLECTIVE, tag)?;
            expect_len(&received, chunk)?;
            let peer = peer as usize;
            output[peer * chunk..(peer + 1) * chunk].copy_from_slice(&received);
        }
    } else {
        ctx.send(root, LANE_COLLECTIVE, tag, input)?;
    }
    Ok(())
}

/// The root distributes one slice per rank; every rank receives its slice
/// into `output`. Non-roots pass `None` for `inputs`.
pub fn scatter(
    ctx: &Context,
    tag: Tag,
    root: Rank,
    inputs: Option<&[&[u8]]>,
    output: &mut [u8],
) -> Result<()> {
    if ctx.rank() == root {
        let inputs = inputs.ok_or_else(|| {
            PlexusError::transport("scatter root called without input buffers")
        })?;
        if inputs.len() != ctx.size() as usize {
            return Err(PlexusError::SizeMismatch {
                expected: ctx.size() as usize,
                actual: inputs.len(),
            });
        }
        for peer in 0..ctx.size() {
            if peer == root {
                continue;
            }
            ctx.send(peer, LANE_COLLECTIVE, tag, inputs[peer as usize])?;
        }
        let own = inputs[root as usize];
        expect_len(output, own.len())?;
        output.copy_from_slice(own);
    } else {
        let received = ctx.recv(root, LANE_COLLECTIVE, tag)?;
        expect_len(&received, output.len())?;
        output.copy_from_slice(&received);
    }
    Ok(())
}

/// Dissemination barrier: `ceil(log2(world))` rounds, each rank signalling
/// `rank + 2^round` and waiting on `rank - 2^round`. Each ordered pair
/// exchanges at most one frame per barrier, so rounds cannot be confused.
pub fn barrier(ctx: &Context, tag: Tag) -> Result<()> {
    let world = ctx.size();
    if world == 1 {
        return Ok(());
    }
    let rank = ctx.rank();
    let mut distance = 1u32;
    while distance < world {
        let to = (rank + distance) % world;
        let from = (rank + world - distance) % world;
        ctx.send(to, LANE_COLLECTIVE, tag, &[])?;
        let _ = ctx.recv(from, LANE_COLLECTIVE, tag)?;
        distance <<= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce;
    use crate::store::{HashStore, Store, StoreAdapter};
    use crate::transport::TcpDevice;
    use crate::types::{DataType, ReduceOp};
    use std::sync::Arc;
    use std::time::Duration;

    /// Run `f` on every rank of a fresh mesh, one thread per rank.
    fn run_mesh<F>(world: u32, f: F)
    where
        F: Fn(Arc<Context>) + Send + Sync + 'static,
    {
        let store: Arc<dyn Store> = Arc::new(HashStore::new());
        let f = Arc::new(f);
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let adapter = StoreAdapter::new(Arc::clone(&store));
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    let ctx = Arc::new(
                        Context::connect_full_mesh(
                            rank,
                            world,
                            Duration::from_secs(10),
                            &adapter,
                            &TcpDevice::loopback(),
                            0,
                        )
                        .unwrap(),
                    );
                    f(ctx);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f32_from(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_broadcast_three_ranks() {
        run_mesh(3, |ctx| {
            let mut buf = if ctx.rank() == 1 {
                f32_bytes(&[1.0, 2.0])
            } else {
                f32_bytes(&[0.0, 0.0])
            };
            broadcast(&ctx, 0, &mut buf, 1).unwrap();
            assert_eq!(f32_from(&buf), vec![1.0, 2.0]);
        });
    }

    #[test]
    fn test_ring_allreduce_sum_uneven_count() {
        run_mesh(3, |ctx| {
            let rank = ctx.rank();
            let vals: Vec<f32> = (0..7).map(|i| (i * (rank + 1)) as f32).collect();
            let mut buf = f32_bytes(&vals);
            let f = reduce::resolve(DataType::F32, ReduceOp::Sum).unwrap();
            allreduce(&ctx, 0, &mut buf, 7, f).unwrap();
            let expected: Vec<f32> = (0..7).map(|i| (i * 6) as f32).collect();
            assert_eq!(f32_from(&buf), expected, "rank {rank}");
        });
    }

    #[test]
    fn test_ring_allreduce_fewer_elements_than_ranks() {
        run_mesh(4, |ctx| {
            let mut buf = f32_bytes(&[(ctx.rank() + 1) as f32]);
            let f = reduce::resolve(DataType::F32, ReduceOp::Max).unwrap();
            allreduce(&ctx, 0, &mut buf, 1, f).unwrap();
            assert_eq!(f32_from(&buf), vec![4.0]);
        });
    }

    #[test]
    fn test_reduce_to_root() {
        run_mesh(3, |ctx| {
            let mut buf = f32_bytes(&[(ctx.rank() + 1) as f32, 1.0]);
            let f = reduce::resolve(DataType::F32, ReduceOp::Product).unwrap();
            reduce(&ctx, 0, &mut buf, 2, 2, f).unwrap();
            if ctx.rank() == 2 {
                assert_eq!(f32_from(&buf), vec![6.0, 1.0]);
            }
        });
    }

    #[test]
    fn test_allgather_rank_order() {
        run_mesh(4, |ctx| {
            let input = f32_bytes(&[ctx.rank() as f32]);
            let mut output = vec![0u8; 16];
            allgather(&ctx, 0, &input, &mut output).unwrap();
            assert_eq!(f32_from(&output), vec![0.0, 1.0, 2.0, 3.0]);
        });
    }

    #[test]
    fn test_gather_and_scatter() {
        run_mesh(3, |ctx| {
            let rank = ctx.rank();

            let input = f32_bytes(&[rank as f32 * 10.0]);
            if rank == 1 {
                let mut out = vec![0u8; 12];
                gather(&ctx, 0, 1, &input, Some(&mut out)).unwrap();
                assert_eq!(f32_from(&out), vec![0.0, 10.0, 20.0]);
            } else {
                gather(&ctx, 0, 1, &input, None).unwrap();
            }

            let mut slot = vec![0u8; 4];
            if rank == 1 {
                let parts = [f32_bytes(&[5.0]), f32_bytes(&[6.0]), f32_bytes(&[7.0])];
                let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                scatter(&ctx, 1, 1, Some(&refs), &mut slot).unwrap();
            } else {
                scatter(&ctx, 1, 1, None, &mut slot).unwrap();
            }
            assert_eq!(f32_from(&slot), vec![5.0 + rank as f32]);
        });
    }

    #[test]
    fn test_barrier_all_sizes() {
        for world in [2u32, 3, 4, 5] {
            run_mesh(world, |ctx| {
                for round in 0..3u32 {
                    barrier(&ctx, round).unwrap();
                }
            });
        }
    }
}

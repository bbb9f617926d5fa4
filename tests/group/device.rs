use super::helpers::run_group;
use plexus::{ReduceOp, Tensor, Work};

// Device collectives stage through pinned host memory on dedicated
// streams; `wait()` + `synchronize()` orders the caller's default stream
// after the copied-back results. These tests need a CUDA-visible device.

#[test]
#[ignore = "requires a CUDA device"]
fn test_device_allreduce_sum() {
    run_group(2, |group| {
        let rank = group.rank();
        let host = Tensor::from_slice(&[rank as f32, rank as f32]);
        let input = host.to_cuda(0).unwrap();

        let work = group.allreduce(std::slice::from_ref(&input), ReduceOp::Sum).unwrap();
        work.wait().unwrap();
        work.synchronize().unwrap();

        let out = input.to_host().unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![1.0, 1.0], "rank {rank}");
    });
}

#[test]
#[ignore = "requires a CUDA device"]
fn test_device_broadcast() {
    run_group(2, |group| {
        let rank = group.rank();
        let host = Tensor::from_slice(&[rank as f32 + 1.0]);
        let input = host.to_cuda(0).unwrap();

        let work = group.broadcast(std::slice::from_ref(&input), 1, 0).unwrap();
        work.wait().unwrap();
        work.synchronize().unwrap();

        let out = input.to_host().unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![2.0]);
    });
}

#[test]
#[ignore = "requires a CUDA device"]
fn test_mixed_placements_rejected() {
    run_group(1, |group| {
        let host = Tensor::from_slice(&[1.0f32]);
        let device = host.to_cuda(0).unwrap();
        let err = group.allreduce(&[host, device], ReduceOp::Sum).unwrap_err();
        assert!(matches!(err, plexus::PlexusError::InvalidArgument { .. }));
    });
}

use super::helpers::run_group;
use plexus::{ReduceOp, Tensor, Work};

#[test]
fn test_reduce_sum_to_root() {
    run_group(3, |group| {
        let rank = group.rank();
        let t = Tensor::from_slice(&[rank as f32, 1.0]);
        let work = group.reduce(std::slice::from_ref(&t), 2, 0, ReduceOp::Sum).unwrap();
        work.wait().unwrap();
        if rank == 2 {
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![3.0, 3.0]);
        } else {
            // Non-root buffers are contributed but not overwritten.
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![rank as f32, 1.0]);
        }
    });
}

#[test]
fn test_reduce_max_i64() {
    run_group(4, |group| {
        let rank = group.rank();
        let t = Tensor::from_slice(&[(rank as i64) * 10 - 5]);
        group
            .reduce(std::slice::from_ref(&t), 0, 0, ReduceOp::Max)
            .unwrap()
            .wait()
            .unwrap();
        if rank == 0 {
            assert_eq!(t.to_vec::<i64>().unwrap(), vec![25]);
        }
    });
}

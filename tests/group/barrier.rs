use super::helpers::{run_group, run_group_with};
use plexus::{GroupOptions, ReduceOp, Tensor, Work};

#[test]
fn test_barrier_repeated_rounds() {
    run_group(3, |group| {
        for _ in 0..5 {
            group.barrier().unwrap().wait().unwrap();
        }
    });
}

#[test]
fn test_barrier_fences_prior_work() {
    run_group(2, |group| {
        // A collective large enough to still be in flight when the
        // barrier is submitted.
        let big = Tensor::zeros(plexus::DataType::F32, &[1 << 18]);
        let first = group
            .allreduce(std::slice::from_ref(&big), ReduceOp::Sum)
            .unwrap();
        let fence = group.barrier().unwrap();
        fence.wait().unwrap();
        // The barrier completes only after everything submitted before it.
        assert!(first.is_completed());
        first.wait().unwrap();
    });
}

#[test]
fn test_barrier_orders_collectives_on_single_worker() {
    let options = GroupOptions {
        threads: 1,
        ..GroupOptions::loopback()
    };
    run_group_with(2, options, |group| {
        let rank = group.rank();
        let a = Tensor::from_slice(&[(rank + 1) as f32]);
        let b = Tensor::from_slice(&[(rank + 1) as f32 * 100.0]);

        let first = group.allreduce(std::slice::from_ref(&a), ReduceOp::Sum).unwrap();
        let fence = group.barrier().unwrap();
        let second = group.allreduce(std::slice::from_ref(&b), ReduceOp::Sum).unwrap();

        second.wait().unwrap();
        assert!(first.is_completed());
        assert!(fence.is_completed());
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![3.0]);
        assert_eq!(b.to_vec::<f32>().unwrap(), vec![300.0]);
    });
}

#[test]
fn test_barrier_does_not_block_later_submissions() {
    run_group(2, |group| {
        let fence = group.barrier().unwrap();
        let t = Tensor::from_slice(&[1.0f32]);
        let after = group.allreduce(std::slice::from_ref(&t), ReduceOp::Sum).unwrap();
        after.wait().unwrap();
        fence.wait().unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![2.0]);
    });
}

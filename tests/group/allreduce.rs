use super::helpers::run_group;
use plexus::{ReduceOp, Tensor, Work};

#[test]
fn test_allreduce_sum_4_ranks() {
    run_group(4, |group| {
        let rank = group.rank();
        let t = Tensor::from_slice(&[rank as f32]);
        let work = group.allreduce(std::slice::from_ref(&t), ReduceOp::Sum).unwrap();
        work.wait().unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![6.0], "rank {rank}");
    });
}

#[test]
fn test_allreduce_sum_multiple_inputs_per_rank() {
    run_group(2, |group| {
        let rank = group.rank();
        let a = Tensor::from_slice(&[(rank + 1) as f32, 0.0]);
        let b = Tensor::from_slice(&[(rank + 1) as f32 * 10.0, 1.0]);
        let work = group.allreduce(&[a.clone(), b.clone()], ReduceOp::Sum).unwrap();
        work.wait().unwrap();
        // Reduction spans every input of every rank: 1 + 2 + 10 + 20.
        for t in [&a, &b] {
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![33.0, 2.0], "rank {rank}");
        }
    });
}

#[test]
fn test_allreduce_min_and_max() {
    run_group(3, |group| {
        let rank = group.rank();

        let lo = Tensor::from_slice(&[(rank + 1) as i32, -(rank as i32)]);
        group
            .allreduce(std::slice::from_ref(&lo), ReduceOp::Min)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(lo.to_vec::<i32>().unwrap(), vec![1, -2]);

        let hi = Tensor::from_slice(&[(rank + 1) as i32]);
        group
            .allreduce(std::slice::from_ref(&hi), ReduceOp::Max)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(hi.to_vec::<i32>().unwrap(), vec![3]);
    });
}

#[test]
fn test_allreduce_product_f64() {
    run_group(3, |group| {
        let rank = group.rank();
        let t = Tensor::from_slice(&[(rank + 1) as f64, 2.0]);
        group
            .allreduce(std::slice::from_ref(&t), ReduceOp::Product)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(t.to_vec::<f64>().unwrap(), vec![6.0, 8.0]);
    });
}

#[test]
fn test_allreduce_uneven_element_count() {
    run_group(3, |group| {
        let rank = group.rank();
        let vals: Vec<f32> = (0..7).map(|i| (i * (rank + 1)) as f32).collect();
        let t = Tensor::from_slice(&vals);
        group
            .allreduce(std::slice::from_ref(&t), ReduceOp::Sum)
            .unwrap()
            .wait()
            .unwrap();
        let expected: Vec<f32> = (0..7).map(|i| (i * 6) as f32).collect();
        assert_eq!(t.to_vec::<f32>().unwrap(), expected);
    });
}

#[test]
fn test_wait_is_idempotent_after_success() {
    run_group(2, |group| {
        let t = Tensor::from_slice(&[1.0f32]);
        let work = group.allreduce(std::slice::from_ref(&t), ReduceOp::Sum).unwrap();
        work.wait().unwrap();
        work.wait().unwrap();
        assert!(work.is_completed());
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![2.0]);
    });
}

#[test]
fn test_drop_drains_submitted_work() {
    run_group(2, |group| {
        let tensors: Vec<Tensor> = (0..4)
            .map(|_| Tensor::from_slice(&[(group.rank() + 1) as f32]))
            .collect();
        let works: Vec<_> = tensors
            .iter()
            .map(|t| group.allreduce(std::slice::from_ref(t), ReduceOp::Sum).unwrap())
            .collect();
        // Dropping the group drains the queue before joining workers.
        drop(group);
        for (work, t) in works.iter().zip(&tensors) {
            assert!(work.is_completed());
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![3.0]);
        }
    });
}

use super::helpers::run_group;
use plexus::{Tensor, Work};

#[test]
fn test_broadcast_from_middle_rank() {
    run_group(3, |group| {
        let rank = group.rank();
        let t = Tensor::from_slice(&[rank as f32, (rank + 1) as f32]);
        let work = group.broadcast(std::slice::from_ref(&t), 1, 0).unwrap();
        work.wait().unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0], "rank {rank}");
    });
}

#[test]
fn test_broadcast_root_keeps_own_values() {
    run_group(2, |group| {
        let rank = group.rank();
        let t = Tensor::from_slice(&[if rank == 0 { 42.0f32 } else { 0.0 }]);
        group
            .broadcast(std::slice::from_ref(&t), 0, 0)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![42.0]);
    });
}

#[test]
fn test_broadcast_fans_out_to_all_local_inputs() {
    run_group(2, |group| {
        let rank = group.rank();
        let a = Tensor::from_slice(&[rank as i64, rank as i64]);
        let b = Tensor::from_slice(&[-1i64, -1]);
        let work = group.broadcast(&[a.clone(), b.clone()], 1, 0).unwrap();
        work.wait().unwrap();
        assert_eq!(a.to_vec::<i64>().unwrap(), vec![1, 1]);
        assert_eq!(b.to_vec::<i64>().unwrap(), vec![1, 1]);
    });
}

#[test]
fn test_broadcast_result_returns_inputs() {
    run_group(2, |group| {
        let t = Tensor::from_slice(&[group.rank() as f32]);
        let work = group.broadcast(std::slice::from_ref(&t), 0, 0).unwrap();
        work.wait().unwrap();
        let outputs = work.result();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![0.0]);
    });
}

use super::helpers::run_group;
use plexus::{DataType, PlexusError, ReduceOp, Tensor};

// Validation failures raise synchronously on the submitting rank and
// enqueue nothing, so every rank makes the same invalid call and nobody
// is left waiting on the wire.

#[test]
fn test_allgather_empty_input_list() {
    run_group(2, |group| {
        let err = group.allgather(&[], &[]).unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument { .. }));
    });
}

#[test]
fn test_allgather_wrong_output_length() {
    run_group(2, |group| {
        let input = Tensor::from_slice(&[1.0f32]);
        let outputs: Vec<Tensor> = (0..3).map(|_| Tensor::zeros(DataType::F32, &[1])).collect();
        let err = group
            .allgather(&[outputs], std::slice::from_ref(&input))
            .unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument { .. }));
    });
}

#[test]
fn test_gather_wrong_side_lists() {
    run_group(2, |group| {
        let input = Tensor::from_slice(&[1.0f32]);
        // Root passes no outputs, non-root passes some: invalid on every
        // rank, symmetric across the group.
        let outputs: Vec<Vec<Tensor>> = if group.rank() == 0 {
            Vec::new()
        } else {
            vec![(0..2).map(|_| Tensor::zeros(DataType::F32, &[1])).collect()]
        };
        let err = group
            .gather(&outputs, std::slice::from_ref(&input), 0)
            .unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument { .. }));
    });
}

#[test]
fn test_scatter_wrong_side_lists() {
    run_group(2, |group| {
        let output = Tensor::zeros(DataType::F32, &[1]);
        let inputs: Vec<Vec<Tensor>> = if group.rank() == 0 {
            Vec::new()
        } else {
            vec![vec![
                Tensor::from_slice(&[1.0f32]),
                Tensor::from_slice(&[2.0f32]),
            ]]
        };
        let err = group
            .scatter(std::slice::from_ref(&output), &inputs, 0)
            .unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument { .. }));
    });
}

#[test]
fn test_reduce_requires_single_input() {
    run_group(2, |group| {
        let a = Tensor::from_slice(&[1.0f32]);
        let b = Tensor::from_slice(&[2.0f32]);
        let err = group.reduce(&[a, b], 0, 0, ReduceOp::Sum).unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument { .. }));
    });
}

#[test]
fn test_send_to_out_of_range_rank() {
    run_group(2, |group| {
        let t = Tensor::from_slice(&[1.0f32]);
        let err = group.send(&t, 5, 0).unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument { .. }));
    });
}

#[test]
fn test_mixed_dtypes_rejected() {
    run_group(2, |group| {
        let a = Tensor::from_slice(&[1.0f32]);
        let b = Tensor::from_slice(&[1i32]);
        let err = group.allreduce(&[a, b], ReduceOp::Sum).unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument { .. }));
    });
}

use super::helpers::run_group;
use plexus::{DataType, Tensor, Work};

#[test]
fn test_allgather_i64_4_ranks() {
    run_group(4, |group| {
        let rank = group.rank();
        let input = Tensor::from_slice(&[rank as i64]);
        let outputs: Vec<Tensor> = (0..4).map(|_| Tensor::zeros(DataType::I64, &[1])).collect();
        let work = group
            .allgather(&[outputs.clone()], std::slice::from_ref(&input))
            .unwrap();
        work.wait().unwrap();
        for (peer, output) in outputs.iter().enumerate() {
            assert_eq!(
                output.to_vec::<i64>().unwrap(),
                vec![peer as i64],
                "rank {rank}, slot {peer}"
            );
        }
    });
}

#[test]
fn test_allgather_multiple_inputs_rank_major_order() {
    run_group(2, |group| {
        let rank = group.rank();
        let inputs = vec![
            Tensor::from_slice(&[rank as f32 * 10.0]),
            Tensor::from_slice(&[rank as f32 * 10.0 + 1.0]),
        ];
        let outputs: Vec<Tensor> = (0..4).map(|_| Tensor::zeros(DataType::F32, &[1])).collect();
        group
            .allgather(&[outputs.clone()], &inputs)
            .unwrap()
            .wait()
            .unwrap();
        let got: Vec<f32> = outputs
            .iter()
            .map(|t| t.to_vec::<f32>().unwrap()[0])
            .collect();
        assert_eq!(got, vec![0.0, 1.0, 10.0, 11.0]);
    });
}

#[test]
fn test_allgather_multidimensional() {
    run_group(2, |group| {
        let rank = group.rank();
        let vals: Vec<f32> = (0..6).map(|i| (rank * 100 + i) as f32).collect();
        let input = Tensor::from_slice(&vals).reshape(&[2, 3]).unwrap();
        let outputs: Vec<Tensor> = (0..2).map(|_| Tensor::zeros(DataType::F32, &[2, 3])).collect();
        group
            .allgather(&[outputs.clone()], std::slice::from_ref(&input))
            .unwrap()
            .wait()
            .unwrap();
        for peer in 0..2u32 {
            let expected: Vec<f32> = (0..6).map(|i| (peer * 100 + i) as f32).collect();
            assert_eq!(outputs[peer as usize].to_vec::<f32>().unwrap(), expected);
        }
    });
}

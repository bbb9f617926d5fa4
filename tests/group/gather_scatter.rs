use super::helpers::run_group;
use plexus::{DataType, Tensor, Work};

#[test]
fn test_gather_to_root() {
    run_group(3, |group| {
        let rank = group.rank();
        let input = Tensor::from_slice(&[rank as f32 * 10.0]);
        if rank == 1 {
            let outputs: Vec<Tensor> =
                (0..3).map(|_| Tensor::zeros(DataType::F32, &[1])).collect();
            let work = group
                .gather(&[outputs.clone()], std::slice::from_ref(&input), 1)
                .unwrap();
            work.wait().unwrap();
            let got: Vec<f32> = outputs
                .iter()
                .map(|t| t.to_vec::<f32>().unwrap()[0])
                .collect();
            assert_eq!(got, vec![0.0, 10.0, 20.0]);
        } else {
            group
                .gather(&[], std::slice::from_ref(&input), 1)
                .unwrap()
                .wait()
                .unwrap();
        }
    });
}

#[test]
fn test_scatter_from_root() {
    run_group(3, |group| {
        let rank = group.rank();
        let output = Tensor::zeros(DataType::F32, &[2]);
        if rank == 0 {
            let inputs: Vec<Tensor> = (0..3)
                .map(|peer| Tensor::from_slice(&[peer as f32, peer as f32 + 0.5]))
                .collect();
            group
                .scatter(std::slice::from_ref(&output), &[inputs], 0)
                .unwrap()
                .wait()
                .unwrap();
        } else {
            group
                .scatter(std::slice::from_ref(&output), &[], 0)
                .unwrap()
                .wait()
                .unwrap();
        }
        assert_eq!(
            output.to_vec::<f32>().unwrap(),
            vec![rank as f32, rank as f32 + 0.5]
        );
    });
}

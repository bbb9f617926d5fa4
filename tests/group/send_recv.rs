use super::helpers::{run_group, run_group_with};
use plexus::{DataType, GroupOptions, PlexusError, Tensor, Work};
use std::time::Duration;

#[test]
fn test_send_recv_with_tag() {
    run_group(2, |group| {
        if group.rank() == 0 {
            let t = Tensor::from_slice(&[7.0f32, 8.0]);
            let work = group.send(&t, 1, 42).unwrap();
            work.wait().unwrap();
            assert!(work.is_completed());
        } else {
            let t = Tensor::zeros(DataType::F32, &[2]);
            let work = group.recv(&t, 0, 42).unwrap();
            work.wait().unwrap();
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![7.0, 8.0]);
            assert_eq!(work.source_rank(), Some(0));
        }
    });
}

#[test]
fn test_recv_anysource_reports_sender() {
    run_group(3, |group| {
        match group.rank() {
            2 => {
                let t = Tensor::from_slice(&[5i32]);
                group.send(&t, 0, 9).unwrap().wait().unwrap();
            }
            0 => {
                let t = Tensor::zeros(DataType::I32, &[1]);
                let work = group.recv_anysource(&t, 9).unwrap();
                work.wait().unwrap();
                assert_eq!(t.to_vec::<i32>().unwrap(), vec![5]);
                assert_eq!(work.source_rank(), Some(2));
            }
            _ => {}
        }
    });
}

#[test]
fn test_tags_demultiplex_out_of_order() {
    run_group(2, |group| {
        if group.rank() == 0 {
            let a = Tensor::from_slice(&[1i32]);
            let b = Tensor::from_slice(&[2i32]);
            group.send(&a, 1, 10).unwrap().wait().unwrap();
            group.send(&b, 1, 20).unwrap().wait().unwrap();
        } else {
            // Wait for the later tag first; frames are mailboxed per tag.
            let b = Tensor::zeros(DataType::I32, &[1]);
            group.recv(&b, 0, 20).unwrap().wait().unwrap();
            assert_eq!(b.to_vec::<i32>().unwrap(), vec![2]);

            let a = Tensor::zeros(DataType::I32, &[1]);
            group.recv(&a, 0, 10).unwrap().wait().unwrap();
            assert_eq!(a.to_vec::<i32>().unwrap(), vec![1]);
        }
    });
}

#[test]
fn test_recv_without_sender_times_out() {
    let options = GroupOptions {
        timeout: Duration::from_millis(300),
        ..GroupOptions::loopback()
    };
    run_group_with(2, options, |group| {
        if group.rank() == 1 {
            let t = Tensor::zeros(DataType::F32, &[1]);
            let work = group.recv(&t, 0, 77).unwrap();
            let err = work.wait().unwrap_err();
            assert!(
                matches!(err, PlexusError::Timeout { .. } | PlexusError::PeerDisconnected { .. }),
                "got {err:?}"
            );
            // The captured failure is re-raised on every wait.
            let again = work.wait().unwrap_err();
            assert_eq!(err.to_string(), again.to_string());
        } else {
            // Keep rank 0 alive past rank 1's recv timeout.
            std::thread::sleep(Duration::from_millis(700));
        }
    });
}

#[test]
fn test_recv_anysource_fails_fast_when_peers_leave() {
    let options = GroupOptions {
        timeout: Duration::from_secs(10),
        ..GroupOptions::loopback()
    };
    run_group_with(2, options, |group| {
        if group.rank() == 1 {
            let t = Tensor::zeros(DataType::F32, &[1]);
            let work = group.recv_anysource(&t, 31).unwrap();
            let start = std::time::Instant::now();
            // Rank 0 left without sending; the receive reports the
            // disconnect instead of sitting out the configured timeout.
            let err = work.wait().unwrap_err();
            assert!(
                matches!(err, PlexusError::PeerDisconnected { .. }),
                "got {err:?}"
            );
            assert!(start.elapsed() < Duration::from_secs(5), "did not fail fast");
        }
    });
}

#[test]
fn test_send_result_holds_tensor() {
    run_group(2, |group| {
        if group.rank() == 0 {
            let t = Tensor::from_slice(&[3i64]);
            let work = group.send(&t, 1, 1).unwrap();
            work.wait().unwrap();
            assert_eq!(work.result()[0].to_vec::<i64>().unwrap(), vec![3]);
        } else {
            let t = Tensor::zeros(DataType::I64, &[1]);
            group.recv(&t, 0, 1).unwrap().wait().unwrap();
        }
    });
}

use dlrm_embedding::{QrOperation, SparseBatch, UniformTableInit};
use dlrm_engine::{
    launch_local, DlrmModel, EngineError, ErrorKind, ExecutionConfig, ExecutionStrategy, MdConfig,
    ModelConfig, QrConfig,
};
use dlrm_layers::{InteractionOp, Tensor, VarianceScaledNormal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TOLERANCE: f32 = 1e-5;

fn dot_config(rows: Vec<usize>, dim: usize, dense: usize) -> ModelConfig {
    let f = rows.len() + 1;
    ModelConfig::new(dim, rows, vec![dense, 8, dim], vec![dim + f * (f - 1) / 2, 6, 1])
}

fn random_inputs(config: &ModelConfig, batch: usize, seed: u64) -> (Tensor, SparseBatch) {
    let mut rng = StdRng::seed_from_u64(seed);
    let m_den = config.dense_features();
    let dense = Tensor::from_data(
        &[batch, m_den],
        (0..batch * m_den).map(|_| rng.gen_range(0.0..1.0)).collect(),
    );
    let mut indices = Vec::new();
    let mut offsets = Vec::new();
    for &rows in &config.embedding_rows {
        let mut idx = Vec::new();
        let mut off = Vec::new();
        for _ in 0..batch {
            off.push(idx.len());
            let n = rng.gen_range(0..=3);
            idx.extend((0..n).map(|_| rng.gen_range(0..rows)));
        }
        indices.push(idx);
        offsets.push(off);
    }
    (dense, SparseBatch::new(indices, offsets).unwrap())
}

fn sequential(config: &ModelConfig, dense: &Tensor, sparse: &SparseBatch) -> Tensor {
    DlrmModel::build(config.clone())
        .unwrap()
        .forward(dense, sparse)
        .unwrap()
}

fn device_parallel(config: &ModelConfig, devices: usize, dense: &Tensor, sparse: &SparseBatch) -> Tensor {
    let model = DlrmModel::build(config.clone()).unwrap();
    let mut strategy = ExecutionStrategy::new(model, &ExecutionConfig::devices(devices)).unwrap();
    strategy.forward(dense, sparse).unwrap()
}

fn distributed(config: &ModelConfig, ranks: usize, dense: &Tensor, sparse: &SparseBatch) -> Vec<Tensor> {
    launch_local(config, ranks, &UniformTableInit, &VarianceScaledNormal, |s| {
        s.forward(dense, sparse)
    })
    .unwrap()
}

fn assert_close(a: &Tensor, b: &Tensor) {
    assert_eq!(a.shape(), b.shape());
    assert!(a.max_abs_diff(b) < TOLERANCE, "max diff {}", a.max_abs_diff(b));
}

fn variants() -> Vec<ModelConfig> {
    let base = dot_config(vec![10, 20, 30, 40, 50], 4, 3);

    let mut self_dot = base.clone();
    self_dot.self_interaction = true;
    self_dot.top_mlp[0] = 4 + 6 * 7 / 2;

    let mut cat = base.clone();
    cat.interaction_op = InteractionOp::Cat;
    cat.top_mlp[0] = 6 * 4;

    let mut projected = base.clone();
    projected.projection_size = 2;
    projected.top_mlp[0] = 4 + 6 * 2;

    let mut qr = base.clone();
    qr.qr = Some(QrConfig {
        collisions: 4,
        operation: QrOperation::Mult,
        threshold: 25,
    });

    let mut md = base.clone();
    md.md = Some(MdConfig {
        threshold: 15,
        temperature: 0.5,
        round_dims: false,
    });

    let mut int4 = base.clone();
    int4.embedding_bits = 4;
    int4.mlp_bits = 8;

    let mut clamped = base.clone();
    clamped.loss_threshold = 0.45;

    vec![base, self_dot, cat, projected, qr, md, int4, clamped]
}

#[test]
fn test_device_parallel_matches_sequential() {
    for (i, config) in variants().iter().enumerate() {
        let (dense, sparse) = random_inputs(config, 9, i as u64);
        let expected = sequential(config, &dense, &sparse);
        for devices in [2, 3, 8] {
            assert_close(&device_parallel(config, devices, &dense, &sparse), &expected);
        }
    }
}

#[test]
fn test_distributed_matches_sequential() {
    for (i, config) in variants().iter().enumerate() {
        let (dense, sparse) = random_inputs(config, 12, 100 + i as u64);
        let expected = sequential(config, &dense, &sparse);
        for ranks in [2, 3, 4] {
            for scores in distributed(config, ranks, &dense, &sparse) {
                assert_close(&scores, &expected);
            }
        }
    }
}

#[test]
fn test_shuffle_then_gather_keeps_row_order() {
    // More ranks than some tables, uneven table split, one row per rank.
    let config = dot_config(vec![7, 3, 9, 4, 11], 3, 2);
    let (dense, sparse) = random_inputs(&config, 6, 42);
    let expected = sequential(&config, &dense, &sparse);
    for ranks in [1, 2, 3, 6] {
        for scores in distributed(&config, ranks, &dense, &sparse) {
            assert_close(&scores, &expected);
        }
    }

    // Permuting the input rows permutes the scores the same way.
    let order = [5, 0, 3, 1, 4, 2];
    let dense_perm = Tensor::concat_rows(
        &order
            .iter()
            .map(|&r| dense.slice_rows(r, r + 1))
            .collect::<Vec<_>>(),
    )
    .unwrap();
    let mut indices = Vec::new();
    let mut offsets = Vec::new();
    for t in 0..sparse.num_tables() {
        let mut idx = Vec::new();
        let mut off = Vec::new();
        for &r in &order {
            off.push(idx.len());
            idx.extend_from_slice(sparse.segment(t, r));
        }
        indices.push(idx);
        offsets.push(off);
    }
    let sparse_perm = SparseBatch::new(indices, offsets).unwrap();
    let permuted = &distributed(&config, 3, &dense_perm, &sparse_perm)[0];
    for (i, &r) in order.iter().enumerate() {
        assert!((permuted.data()[i] - expected.data()[r]).abs() < TOLERANCE);
    }
}

#[test]
fn test_batch_not_divisible_by_ranks() {
    let config = dot_config(vec![5, 5, 5], 4, 4);
    let (dense, sparse) = random_inputs(&config, 10, 1);
    let err = launch_local(&config, 3, &UniformTableInit, &VarianceScaledNormal, |s| {
        s.forward(&dense, &sparse)
    })
    .unwrap_err();
    assert!(matches!(
        err,
        EngineError::BatchNotDivisible {
            batch_size: 10,
            ranks: 3
        }
    ));
    assert_eq!(err.kind(), ErrorKind::InputCorruption);
}

#[test]
fn test_batch_smaller_than_ranks() {
    let config = dot_config(vec![5, 5, 5], 4, 4);
    let (dense, sparse) = random_inputs(&config, 2, 1);
    let err = launch_local(&config, 4, &UniformTableInit, &VarianceScaledNormal, |s| {
        s.forward(&dense, &sparse)
    })
    .unwrap_err();
    assert!(matches!(err, EngineError::BatchSmallerThanRanks { .. }));
}

#[test]
fn test_out_of_range_index_fails_every_strategy() {
    let config = dot_config(vec![5, 5], 4, 4);
    let dense = Tensor::ones(&[2, 4]);
    let sparse = SparseBatch::fixed(vec![vec![0, 1, 2, 3], vec![4, 5, 0, 1]], 2).unwrap();

    let model = DlrmModel::build(config.clone()).unwrap();
    let err = model.forward(&dense, &sparse).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputCorruption);

    let mut dp = ExecutionStrategy::new(model, &ExecutionConfig::devices(2)).unwrap();
    assert_eq!(dp.forward(&dense, &sparse).unwrap_err().kind(), ErrorKind::InputCorruption);

    let err = launch_local(&config, 2, &UniformTableInit, &VarianceScaledNormal, |s| {
        s.forward(&dense, &sparse)
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputCorruption);
}

#[test]
fn test_end_to_end_two_tables() {
    let config = ModelConfig::new(4, vec![5, 5], vec![4, 3, 4], vec![7, 4, 1]);
    assert_eq!(config.validate().unwrap(), 7);
    let dense = Tensor::from_data(&[2, 4], vec![0.5, 0.1, 0.9, 0.3, 0.2, 0.8, 0.4, 0.6]);
    let sparse = SparseBatch::fixed(vec![vec![1, 4, 0, 2], vec![3, 3, 2, 0]], 2).unwrap();

    let scores = sequential(&config, &dense, &sparse);
    assert_eq!(scores.numel(), 2);
    assert!(scores.data().iter().all(|&p| (0.0..=1.0).contains(&p)));

    assert_close(&device_parallel(&config, 2, &dense, &sparse), &scores);
    for s in distributed(&config, 2, &dense, &sparse) {
        assert_close(&s, &scores);
    }
}

#[test]
fn test_repeated_calls_with_changing_batch_sizes() {
    let config = dot_config(vec![8, 8, 8, 8], 4, 3);
    let model = DlrmModel::build(config.clone()).unwrap();
    let mut strategy = ExecutionStrategy::new(
        model.clone(),
        &ExecutionConfig {
            devices: 3,
            ranks: 1,
            sync_dense_params: true,
        },
    )
    .unwrap();
    for (i, batch) in [6, 6, 2, 1, 7].into_iter().enumerate() {
        let (dense, sparse) = random_inputs(&config, batch, i as u64);
        let expected = model.forward(&dense, &sparse).unwrap();
        assert_close(&strategy.forward(&dense, &sparse).unwrap(), &expected);
    }

    let (dense, sparse) = random_inputs(&config, 8, 9);
    let expected = model.forward(&dense, &sparse).unwrap();
    let all = launch_local(&config, 2, &UniformTableInit, &VarianceScaledNormal, |s| {
        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(s.forward(&dense, &sparse)?);
        }
        Ok(out)
    })
    .unwrap();
    for per_rank in all {
        for scores in per_rank {
            assert_close(&scores, &expected);
        }
    }
}

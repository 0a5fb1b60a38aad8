//! End-to-end runs of the task loop on synthetic task sequences.

use subspace_gpm::config::ORTHONORMAL_TOLERANCE;
use subspace_gpm::core::mlp::{HeadLayout, Mlp};
use subspace_gpm::core::model::Model;
use subspace_gpm::data::synthetic::{generate, SyntheticConfig};
use subspace_gpm::data::task::Task;
use subspace_gpm::learning::optimizer::LrPolicy;
use subspace_gpm::runtime::orchestrator::{ExperimentConfig, Orchestrator, Phase, ThresholdSchedule};
use subspace_gpm::runtime::trainer::TrainingConfig;
use subspace_gpm::similarity::discriminator::SimilarityConfig;
use subspace_gpm::similarity::distance::DistanceKind;

fn tasks(n: usize, seed: u64) -> Vec<Task> {
    generate(&SyntheticConfig {
        n_tasks: n,
        classes_per_task: 2,
        input_dim: 10,
        train_per_class: 20,
        valid_per_class: 5,
        test_per_class: 15,
        cluster_std: 0.2,
        seed,
        ..Default::default()
    })
    .unwrap()
}

fn training(epochs: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        batch_size: 16,
        lr: 0.1,
        lr_policy: LrPolicy::Constant,
        seed: 9,
        ..Default::default()
    }
}

#[test]
fn test_per_task_heads_wasserstein() {
    let tasks = tasks(4, 21);
    let mlp = Mlp::new(10, &[16, 12], HeadLayout::PerTask(vec![2; 4]), true, 1);
    let config = ExperimentConfig {
        training: training(20),
        ..Default::default()
    };
    let mut orch = Orchestrator::new(mlp, config).unwrap();
    let report = orch.run(&tasks).unwrap();

    assert_eq!(orch.phase(), Phase::Done);
    assert_eq!(report.accuracy.n_tasks(), 4);
    for i in 0..4 {
        for j in 0..=i {
            let acc = report.accuracy.get(i, j);
            assert!((0.0..=100.0).contains(&acc));
        }
    }
    // Well separated clusters: the first task is learnt.
    assert!(report.accuracy.get(0, 0) > 70.0, "{}", report.accuracy);
    assert!(report.backward_transfer.unwrap().is_finite());

    // Layer 0 sees raw inputs, layer 1 the first hidden activations.
    assert_eq!(orch.memory().n_layers(), 2);
    assert_eq!(orch.memory().dim(0), 10);
    assert_eq!(orch.memory().dim(1), 16);
    assert!(orch.memory().max_orthonormality_error() < ORTHONORMAL_TOLERANCE);

    for (t, record) in report.tasks.iter().enumerate() {
        assert_eq!(record.outcome.task, t);
        assert_eq!(record.similar.per_layer.len(), 2);
        for layer in &record.similar.per_layer {
            assert!(layer.len() <= 2);
            assert!(layer.iter().all(|&s| s < t));
        }
    }
    // Biases are frozen from the second task on.
    assert!(report.tasks[1].projection.zeroed_vectors > 0);
    assert_eq!(report.tasks[1].projection.corrected_layers, 2);
}

#[test]
fn test_shared_head_euclidean_cosine() {
    let tasks = tasks(3, 5);
    let mlp = Mlp::new(10, &[8], HeadLayout::Shared(2), false, 2);
    assert_eq!(mlp.projectable_layers(), 2);

    let config = ExperimentConfig {
        training: TrainingConfig {
            momentum: 0.9,
            lr: 0.02,
            lr_policy: LrPolicy::Cosine { t_max: 6 },
            ..training(6)
        },
        thresholds: ThresholdSchedule {
            base: vec![0.95, 0.97],
            per_task_step: 0.01,
        },
        similarity: SimilarityConfig {
            distance: DistanceKind::Euclidean,
            threshold: 0.5,
            keep: None,
        },
        ..Default::default()
    };
    let mut orch = Orchestrator::new(mlp, config).unwrap();
    let report = orch.run(&tasks).unwrap();

    assert_eq!(report.memory_stats.updates, 3);
    for record in &report.tasks {
        for l in &record.memory.layers {
            assert!(l.total_rank <= l.dim);
        }
    }
    // The shared head is projectable: its input space has width 8.
    assert_eq!(orch.memory().dim(1), 8);
    assert!(orch.memory().max_orthonormality_error() < ORTHONORMAL_TOLERANCE);
}

#[test]
fn test_runs_are_reproducible() {
    let run = || {
        let tasks = tasks(3, 8);
        let mlp = Mlp::new(10, &[12], HeadLayout::PerTask(vec![2; 3]), true, 4);
        let config = ExperimentConfig {
            training: training(5),
            ..Default::default()
        };
        Orchestrator::new(mlp, config).unwrap().run(&tasks).unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.accuracy, b.accuracy);
    assert_eq!(a.backward_transfer, b.backward_transfer);
}

#[test]
fn test_invalid_threshold_schedule_is_rejected() {
    let mlp = Mlp::new(10, &[12, 6], HeadLayout::PerTask(vec![2; 2]), true, 4);
    let config = ExperimentConfig {
        thresholds: ThresholdSchedule {
            base: vec![0.9, 0.9, 0.9],
            per_task_step: 0.0,
        },
        ..Default::default()
    };
    assert!(Orchestrator::new(mlp, config).is_err());
}

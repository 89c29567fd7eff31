//! End-to-end checks across the model, loss and training loop.

use candle_core::{DType, Device, Tensor};
use sketch_rnn_rs::prelude::*;
use sketch_rnn_rs::{RecordingSink, Stroke3};
use tempfile::TempDir;

/// Start token followed by end tokens, `[seq_len, batch, 5]`.
fn zero_sequence(seq_len: usize, batch: usize) -> StrokeBatch {
    let device = Device::Cpu;
    let mut rows = Vec::with_capacity(seq_len * batch * 5);
    for t in 0..seq_len {
        for _ in 0..batch {
            let row = if t == 0 {
                [0.0f32, 0.0, 1.0, 0.0, 0.0]
            } else {
                [0.0f32, 0.0, 0.0, 0.0, 1.0]
            };
            rows.extend_from_slice(&row);
        }
    }
    let data = Tensor::from_vec(rows, (seq_len, batch, 5), &device).unwrap();
    let mask = Tensor::ones((seq_len, batch), DType::F32, &device).unwrap();
    StrokeBatch::new(data, mask).unwrap()
}

fn loss_for_seed(seed: u64) -> f32 {
    let config = SketchRnnConfig::test();
    let model = SketchRnn::new(&config.model, &Device::Cpu, seed).unwrap();
    let mut step = TrainingStep::new(model, &config.training, seed).unwrap();
    step.step(&zero_sequence(8, 3), false).unwrap().loss
}

#[test]
fn test_fixed_seed_loss_is_reproducible() {
    let a = loss_for_seed(1234);
    let b = loss_for_seed(1234);
    assert!(a.is_finite());
    assert_eq!(a.to_bits(), b.to_bits());
}

#[test]
fn test_different_seeds_differ() {
    assert_ne!(loss_for_seed(1).to_bits(), loss_for_seed(2).to_bits());
}

#[test]
fn test_default_sized_model_step() {
    let config = SketchRnnConfig::default();
    let model = SketchRnn::new(&config.model, &Device::Cpu, config.seed).unwrap();
    let mut step = TrainingStep::new(model, &config.training, config.seed).unwrap();
    let out = step.step(&zero_sequence(4, 2), true).unwrap();
    assert!(out.loss.is_finite());
    assert_eq!(out.batch_size, 2);
}

#[test]
fn test_short_training_run() {
    let dir = TempDir::new().unwrap();
    let sketch = |len: usize, phase: f32| -> Vec<Stroke3> {
        (0..len)
            .map(|i| {
                let t = i as f32 * 0.5 + phase;
                [20.0 * t.cos(), 20.0 * t.sin(), if i % 6 == 5 { 1.0 } else { 0.0 }]
            })
            .collect()
    };
    let splits = StrokeSplits {
        train: (0..12).map(|i| sketch(8 + i % 5, i as f32)).collect(),
        valid: (0..4).map(|i| sketch(8 + i, 0.3 * i as f32)).collect(),
        test: Vec::new(),
    };

    let mut config = SketchRnnConfig::test();
    config.output_dir = dir.path().to_string_lossy().into_owned();
    config.run_id = Some("0000777".into());
    config.training.epochs = 3;
    config.training.save_every_n_epochs = 2;
    config.training.learning_rate = 5e-3;

    let mut trainer = Trainer::from_splits(config, &splits, Device::Cpu)
        .unwrap()
        .with_sink(RecordingSink::default());
    let history = trainer.train().unwrap();

    assert_eq!(history.len(), 3);
    for m in &history {
        assert!(m.get("val_avg_loss").unwrap().is_finite());
    }
    // saved at epochs 0 and 2 only
    let store = trainer.store();
    assert!(store.encoder_path(0).exists());
    assert!(!store.encoder_path(1).exists());
    assert!(store.encoder_path(2).exists());
    assert_eq!(store.latest_epoch().unwrap(), Some(2));
    assert_eq!(trainer.start_epoch(), 3);
}

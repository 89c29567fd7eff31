//! Train Sketch-RNN on procedurally generated spirals and sample from it.
//!
//! Usage:
//!   cargo run --example train_synthetic --release [epochs]
//!
//! With CUDA:
//!   cargo run --example train_synthetic --release --features cuda

use std::time::Instant;

use candle_core::Device;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use sketch_rnn_rs::{SketchRnnConfig, Stroke3, StrokeSplits, Trainer};

fn spiral<R: Rng>(rng: &mut R) -> Vec<Stroke3> {
    let len = rng.gen_range(20..60);
    let turn = rng.gen_range(0.2f32..0.6);
    let growth = rng.gen_range(0.5f32..2.0);
    (0..len)
        .map(|i| {
            let t = i as f32 * turn;
            let r = growth * (1.0 + i as f32 * 0.1);
            let lift = if i % 15 == 14 { 1.0 } else { 0.0 };
            [r * t.cos(), r * t.sin(), lift]
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    println!("=== Sketch-RNN synthetic training ===\n");

    #[cfg(feature = "cuda")]
    let device = Device::new_cuda(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;
    println!("Device: {:?}", device);

    let epochs = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let splits = StrokeSplits {
        train: (0..256).map(|_| spiral(&mut rng)).collect(),
        valid: (0..32).map(|_| spiral(&mut rng)).collect(),
        test: Vec::new(),
    };

    let mut config = SketchRnnConfig::test();
    config.model.enc_hidden_size = 64;
    config.model.dec_hidden_size = 128;
    config.model.d_z = 16;
    config.model.n_distributions = 5;
    config.training.epochs = epochs;
    config.training.batch_size = 32;
    config.training.save_every_n_epochs = epochs.max(1);
    config.training.show_progress = true;
    config.dataset.max_seq_length = 80;
    config.dataset.min_seq_length = 10;
    config.output_dir = std::env::temp_dir()
        .join("sketch-rnn-synthetic")
        .to_string_lossy()
        .into_owned();

    let mut trainer = Trainer::from_splits(config, &splits, device)?;
    println!(
        "Run {}: {} parameters, {} training sketches\n",
        trainer.run_id(),
        trainer.model().parameter_count(),
        trainer.train_data().len()
    );

    let start = Instant::now();
    let history = trainer.train()?;
    for (epoch, metrics) in history.iter().enumerate() {
        println!(
            "epoch {:>3}: val loss {:.4} (recon {:.4}, kl {:.4})",
            epoch,
            metrics.get("val_avg_loss").unwrap_or(f64::NAN),
            metrics.get("val_avg_reconstruction_loss").unwrap_or(f64::NAN),
            metrics.get("val_avg_kl_loss").unwrap_or(f64::NAN),
        );
    }
    println!("\nTrained in {:.1}s", start.elapsed().as_secs_f64());

    let (orig, decoded) = trainer.sample_one(0, 0.4)?;
    println!(
        "Sample: {} strokes in, {} strokes out",
        orig.len(),
        decoded.len()
    );
    println!("Run directory: {}", trainer.store().run_dir().display());
    Ok(())
}

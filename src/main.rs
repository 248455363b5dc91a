use std::{env, sync::Arc, thread};

use anyhow::Context;
use log::info;
use optimizer_orchestration::{
    optimization::{self, Parameter},
    ExecutionContext, ManagedOptimizer, StepInvocation, TrainerConfig, TrainerContext,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

const BATCH_SIZE: usize = 4;

/// Mean squared error of `y = w * x + b` over `batch`, with its gradients.
///
/// # Returns
/// `(loss, dloss/dw, dloss/db)`.
fn mse(w: f32, b: f32, batch: &[(f32, f32)]) -> (f32, f32, f32) {
    let n = batch.len() as f32;

    batch
        .iter()
        .fold((0., 0., 0.), |(loss, dw, db), &(x, y)| {
            let err = w * x + b - y;
            (
                loss + err * err / n,
                dw + 2. * err * x / n,
                db + 2. * err / n,
            )
        })
}

/// Runs every epoch on one replica and returns its fitted `(w, b)`.
fn train(
    rank: usize,
    ctx: Arc<TrainerContext>,
    config: &TrainerConfig,
    mut rng: StdRng,
) -> anyhow::Result<(f32, f32)> {
    let mut samples: Vec<(f32, f32)> = (0..config.num_training_batches * BATCH_SIZE)
        .map(|_| {
            let x: f32 = rng.random_range(-1.0..1.0);
            (x, 2. * x + 1.)
        })
        .collect();

    let w = Parameter::new(vec![0.]);
    let b = Parameter::new(vec![0.]);
    let optimizer = config.optimizer.build(vec![w.clone(), b.clone()]);

    let mut optimizer = ManagedOptimizer::new(optimizer, None)?;
    optimizer.attach_context(&ctx);
    info!(rank = rank; "training with {optimizer}");

    for epoch in 0..config.max_epochs {
        ctx.on_epoch_start(epoch);
        samples.shuffle(&mut rng);

        let mut epoch_loss = 0.;
        let mut stepped = 0;

        for (batch_idx, batch) in samples.chunks(BATCH_SIZE).enumerate() {
            ctx.on_batch_start(batch_idx);

            // Gradients are summed over the window, so each batch contributes its share.
            let window = ctx.accumulate_grad_batches().get() as f32;
            // Only the precision path unscales, and the accelerator takes precedence over it.
            let scale = match ctx.precision() {
                Some(precision) if !ctx.on_native_accelerator() => precision.loss_scale(),
                _ => 1.,
            };

            let mut batch_loss = 0.;
            let closure = || -> optimization::Result<Option<f32>> {
                let (loss, dw, db) = mse(w.value()[0], b.value()[0], batch);
                w.accumulate_grad(&[dw * scale / window])?;
                b.accumulate_grad(&[db * scale / window])?;
                batch_loss = loss;
                Ok(Some(loss))
            };

            let outcome = optimizer
                .step(StepInvocation::new().closure(closure))
                .with_context(|| format!("step failed at epoch {epoch}, batch {batch_idx}"))?;

            epoch_loss += batch_loss;
            stepped += usize::from(outcome.is_stepped());
        }

        let mean_loss = epoch_loss / config.num_training_batches as f32;
        info!(rank = rank, epoch = epoch, steps = stepped; "mean loss {mean_loss:.6}");
    }

    Ok((w.value()[0], b.value()[0]))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => TrainerConfig::load(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => TrainerConfig::default(),
    };

    let replicas: Vec<Arc<TrainerContext>> = TrainerContext::replicas(&config)
        .context("invalid trainer config")?
        .into_iter()
        .map(Arc::new)
        .collect();

    // Each replica samples its own data; they only share averaged gradients.
    let fitted = thread::scope(|s| {
        let handles: Vec<_> = replicas
            .iter()
            .enumerate()
            .map(|(rank, ctx)| {
                let rng = match config.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
                    None => StdRng::from_os_rng(),
                };
                let ctx = Arc::clone(ctx);
                let config = &config;
                s.spawn(move || train(rank, ctx, config, rng))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("a replica panicked"))?
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })?;

    for (rank, (w, b)) in fitted.iter().enumerate() {
        println!("replica {rank}: fitted y = {w:.4}x + {b:.4} (expected y = 2x + 1)");
    }

    for (rank, ctx) in replicas.iter().enumerate() {
        let summary = ctx.shared_profiler().summary();
        if !summary.is_empty() {
            println!("\nreplica {rank}\n{summary}");
        }
    }

    Ok(())
}

use std::{fs, sync::Arc, thread};

use optimizer_orchestration::{
    config::{AcceleratorConfig, OptimizerConfig, PrecisionConfig, ProfilerConfig},
    optimization::Parameter,
    Error, ExecutionContext, ManagedOptimizer, StepInvocation, TrainerConfig, TrainerContext,
};
use tempfile::tempdir;

#[test]
fn loads_a_full_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trainer.json");
    fs::write(
        &path,
        r#"{
            "max_epochs": 3,
            "num_training_batches": 5,
            "accumulation_schedule": { "0": 1, "2": 4 },
            "precision": { "native": { "init_scale": 256.0, "growth_interval": 100 } },
            "accelerator": { "replicated": { "world_size": 2 } },
            "profiler": "passthrough",
            "optimizer": { "adam": { "lr": 0.01, "b1": 0.8 } },
            "seed": 42
        }"#,
    )
    .unwrap();

    let config = TrainerConfig::load(&path).unwrap();

    assert_eq!(config.max_epochs, 3);
    assert_eq!(
        config.precision,
        PrecisionConfig::Native {
            init_scale: 256.,
            growth_interval: 100
        }
    );
    assert_eq!(
        config.accelerator,
        AcceleratorConfig::Replicated { world_size: 2 }
    );
    assert_eq!(config.profiler, ProfilerConfig::Passthrough);
    assert_eq!(
        config.optimizer,
        OptimizerConfig::Adam {
            lr: 0.01,
            b1: 0.8,
            b2: 0.999,
            eps: 1e-8
        }
    );
    assert_eq!(config.seed, Some(42));

    let replicas = TrainerContext::replicas(&config).unwrap();
    assert_eq!(replicas.len(), 2);

    let ctx = &replicas[0];
    assert_eq!(ctx.accumulate_grad_batches().get(), 1);
    ctx.on_epoch_start(2);
    assert_eq!(ctx.accumulate_grad_batches().get(), 4);
    assert!(ctx.on_native_accelerator());
    assert_eq!(ctx.precision_backend_name(), Some("native_amp"));
}

#[test]
fn non_integer_accumulation_is_a_config_error() {
    let err = TrainerConfig::from_json(r#"{ "accumulate_grad_batches": 2.5 }"#).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn zero_accumulation_names_the_value() {
    let err = TrainerConfig::from_json(r#"{ "accumulate_grad_batches": 0 }"#).unwrap_err();

    assert!(matches!(err, Error::InvalidAccumulation { value: 0 }));
    assert_eq!(
        err.to_string(),
        "accumulate_grad_batches parameter 0 should be >= 1"
    );
}

#[test]
fn bad_schedule_factor_is_rejected() {
    let err =
        TrainerConfig::from_json(r#"{ "accumulation_schedule": { "0": 2, "3": -1 } }"#)
            .unwrap_err();
    assert!(matches!(err, Error::InvalidAccumulation { value: -1 }));
}

#[test]
fn unknown_fields_are_rejected() {
    let err = TrainerConfig::from_json(r#"{ "max_epoch": 3 }"#).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn zero_world_size_is_a_misconfiguration() {
    let err =
        TrainerConfig::from_json(r#"{ "accelerator": { "replicated": { "world_size": 0 } } }"#)
            .unwrap_err();
    assert!(matches!(err, Error::Misconfiguration { .. }));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempdir().unwrap();
    let err = TrainerConfig::load(dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn configured_optimizer_trains_through_the_wrapper() {
    let config = TrainerConfig::from_json(
        r#"{ "num_training_batches": 2, "accumulate_grad_batches": 2,
             "optimizer": { "gradient_descent": { "lr": 0.5 } } }"#,
    )
    .unwrap();

    let ctx = Arc::new(TrainerContext::from_config(&config).unwrap());
    let param = optimizer_orchestration::optimization::Parameter::new(vec![1.]);
    let optimizer = config.optimizer.build(vec![param.clone()]);

    let mut opt = ManagedOptimizer::new(optimizer, None).unwrap();
    opt.attach_context(&ctx);
    assert!(opt.to_string().starts_with("ManagedOptimizer(optim=GradientDescent"));

    for batch_idx in 0..2 {
        ctx.on_batch_start(batch_idx);
        let p = param.clone();
        let invocation = StepInvocation::new().closure(move || {
            p.accumulate_grad(&[1.])?;
            Ok(None)
        });
        opt.step(invocation).unwrap();
    }

    assert_eq!(param.value(), vec![0.]);
}

/// Trains one parameter per replica, each replica feeding `rank + 1` as its gradient.
///
/// # Returns
/// Every replica's final value and the sync state its closure saw on each batch.
fn train_replicas(config: &TrainerConfig) -> Vec<(Vec<f32>, Vec<bool>)> {
    let replicas = TrainerContext::replicas(config).unwrap();

    thread::scope(|s| {
        let handles: Vec<_> = replicas
            .into_iter()
            .enumerate()
            .map(|(rank, ctx)| {
                s.spawn(move || {
                    let ctx = Arc::new(ctx);
                    let param = Parameter::new(vec![0.]);
                    let optimizer = config.optimizer.build(vec![param.clone()]);
                    let mut opt = ManagedOptimizer::new(optimizer, None).unwrap();
                    opt.attach_context(&ctx);

                    let mut synced = vec![];
                    for batch_idx in 0..config.num_training_batches {
                        ctx.on_batch_start(batch_idx);

                        let (p, c) = (param.clone(), Arc::clone(&ctx));
                        let mut sync_enabled = None;
                        let invocation = StepInvocation::new().closure(|| {
                            sync_enabled = Some(c.is_sync_enabled());
                            p.accumulate_grad(&[rank as f32 + 1.])?;
                            Ok(None)
                        });
                        opt.step(invocation).unwrap();
                        synced.extend(sync_enabled);
                    }

                    (param.value(), synced)
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn replicated_config_averages_gradients_once_per_window() {
    let raw = r#"{ "num_training_batches": 4, "accumulate_grad_batches": 2,
                   "optimizer": { "gradient_descent": { "lr": 1.0 } } }"#;

    let local = TrainerConfig::from_json(raw).unwrap();
    let replicated = TrainerConfig {
        accelerator: AcceleratorConfig::Replicated { world_size: 2 },
        ..local.clone()
    };

    // One replica sums 1 per batch over two windows of two batches.
    let local = train_replicas(&local);
    assert_eq!(local, [(vec![-4.], vec![true; 4])]);

    // Window sums of 2 and 4 average to 3; closures see sync withheld while accumulating.
    let replicated = train_replicas(&replicated);
    let expected = (vec![-6.], vec![false, true, false, true]);
    assert_eq!(replicated, [expected.clone(), expected]);
}

use std::sync::Arc;

use optimizer_orchestration::{
    optimization::{
        self, Closure, GradientDescent, LocalReducer, Optimizer, ParamGroup, Parameter, StepArgs,
    },
    AcceleratorBackend, ExecutionContext, GradScaler, ManagedOptimizer, NativeAmp,
    PrecisionBackend, ReplicatedAccelerator, SimpleProfiler, StepInvocation, StepStrategy,
    TrainerContext,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Accelerator(StepArgs),
    Precision(StepArgs),
    Step(StepArgs),
}

type Calls = Arc<Mutex<Vec<Call>>>;

struct RecordingAccelerator {
    calls: Calls,
}

impl AcceleratorBackend for RecordingAccelerator {
    fn name(&self) -> &str {
        "recording_accelerator"
    }

    fn optimizer_step(
        &self,
        optimizer: &mut dyn Optimizer,
        closure: &mut Closure<'_>,
        kwargs: &StepArgs,
    ) -> optimizer_orchestration::Result<Option<f32>> {
        self.calls.lock().push(Call::Accelerator(kwargs.clone()));
        Ok(optimizer.step(closure, kwargs)?)
    }
}

struct RecordingPrecision {
    calls: Calls,
}

impl PrecisionBackend for RecordingPrecision {
    fn name(&self) -> &str {
        "recording_precision"
    }

    fn optimizer_step(
        &self,
        optimizer: &mut dyn Optimizer,
        closure: &mut Closure<'_>,
        args: &StepArgs,
    ) -> optimizer_orchestration::Result<Option<f32>> {
        self.calls.lock().push(Call::Precision(args.clone()));
        Ok(optimizer.step(closure, args)?)
    }
}

struct RecordingOptimizer {
    groups: Vec<ParamGroup>,
    calls: Calls,
}

impl Optimizer for RecordingOptimizer {
    fn name(&self) -> &str {
        "RecordingOptimizer"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(
        &mut self,
        closure: &mut Closure<'_>,
        args: &StepArgs,
    ) -> optimization::Result<Option<f32>> {
        self.calls.lock().push(Call::Step(args.clone()));
        closure()
    }
}

fn recording_optimizer(calls: &Calls) -> ManagedOptimizer<RecordingOptimizer> {
    let opt = RecordingOptimizer {
        groups: vec![],
        calls: Arc::clone(calls),
    };
    ManagedOptimizer::new(opt, Some(1)).unwrap()
}

fn step_args() -> StepArgs {
    StepArgs::new().arg(7.).kwarg("clip", 0.5)
}

#[test]
fn accelerator_wins_over_precision() {
    let calls = Calls::default();
    let ctx = TrainerContext::builder()
        .accelerator(RecordingAccelerator {
            calls: Arc::clone(&calls),
        })
        .precision(RecordingPrecision {
            calls: Arc::clone(&calls),
        })
        .build();

    let strategy = StepStrategy::select(&ctx);
    assert!(matches!(strategy, StepStrategy::Accelerator(_)));
    assert_eq!(strategy.name(), "recording_accelerator");

    let ctx = Arc::new(ctx);
    let mut opt = recording_optimizer(&calls);
    opt.attach_context(&ctx);
    opt.step(StepInvocation::new().args(step_args())).unwrap();

    let keyword_only = StepArgs::new().kwarg("clip", 0.5);
    assert_eq!(
        *calls.lock(),
        [
            Call::Accelerator(keyword_only.clone()),
            Call::Step(keyword_only)
        ]
    );
}

#[test]
fn precision_receives_every_argument() {
    let calls = Calls::default();
    let ctx = Arc::new(
        TrainerContext::builder()
            .precision(RecordingPrecision {
                calls: Arc::clone(&calls),
            })
            .build(),
    );
    assert!(matches!(
        StepStrategy::select(&*ctx),
        StepStrategy::Precision(_)
    ));

    let mut opt = recording_optimizer(&calls);
    opt.attach_context(&ctx);
    opt.step(StepInvocation::new().args(step_args())).unwrap();

    assert_eq!(
        *calls.lock(),
        [Call::Precision(step_args()), Call::Step(step_args())]
    );
}

#[test]
fn local_step_receives_every_argument() {
    let calls = Calls::default();
    let ctx = Arc::new(TrainerContext::builder().build());
    assert!(matches!(StepStrategy::select(&*ctx), StepStrategy::Local));
    assert!(!ctx.on_native_accelerator());
    assert_eq!(ctx.precision_backend_name(), None);

    let mut opt = recording_optimizer(&calls);
    opt.attach_context(&ctx);
    opt.step(StepInvocation::new().args(step_args())).unwrap();

    assert_eq!(*calls.lock(), [Call::Step(step_args())]);
}

#[test]
fn native_amp_step_resets_gradients() {
    let profiler = Arc::new(SimpleProfiler::new());
    let ctx = Arc::new(
        TrainerContext::builder()
            .precision(NativeAmp::new(GradScaler::with_scale(8.)))
            .profiler(profiler.clone())
            .build(),
    );

    let p = Parameter::new(vec![1.]);
    let sgd = GradientDescent::new(vec![p.clone()], 1.);
    let mut opt = ManagedOptimizer::new(sgd, Some(1)).unwrap();
    opt.attach_context(&ctx);

    let scale = ctx.precision().map_or(1., |backend| backend.loss_scale());
    assert_eq!(scale, 8.);

    let param = p.clone();
    let invocation = StepInvocation::new().closure(move || {
        param.accumulate_grad(&[0.5 * scale])?;
        Ok(Some(2.))
    });

    let outcome = opt.step(invocation).unwrap();

    assert_eq!(outcome.loss(), Some(2.));
    assert_eq!(p.value(), vec![0.5]);
    assert_eq!(p.grad(), Some(vec![0.]));
    assert_eq!(profiler.calls("optimizer_step_and_closure"), 1);
}

#[test]
fn overflowed_amp_step_still_resets_gradients() {
    let ctx = Arc::new(
        TrainerContext::builder()
            .precision(NativeAmp::new(GradScaler::with_scale(8.)))
            .build(),
    );

    let p = Parameter::new(vec![1.]);
    let sgd = GradientDescent::new(vec![p.clone()], 1.);
    let mut opt = ManagedOptimizer::new(sgd, Some(1)).unwrap();
    opt.attach_context(&ctx);

    let param = p.clone();
    let invocation = StepInvocation::new().closure(move || {
        param.accumulate_grad(&[f32::INFINITY])?;
        Ok(None)
    });
    opt.step(invocation).unwrap();

    assert_eq!(p.value(), vec![1.]);
    assert_eq!(p.grad(), Some(vec![0.]));
    assert_eq!(ctx.precision().map(|backend| backend.loss_scale()), Some(4.));
}

#[test]
fn replicated_accelerator_steps_with_reduced_gradients() {
    let ctx = Arc::new(
        TrainerContext::builder()
            .accelerator(ReplicatedAccelerator::new(LocalReducer))
            .build(),
    );

    let p = Parameter::new(vec![0., 0.]);
    let sgd = GradientDescent::new(vec![p.clone()], 0.5);
    let mut opt = ManagedOptimizer::new(sgd, None).unwrap();
    opt.attach_context(&ctx);

    let param = p.clone();
    let invocation = StepInvocation::new().closure(move || {
        param.accumulate_grad(&[2., -4.])?;
        Ok(None)
    });
    assert!(opt.step(invocation).unwrap().is_stepped());

    assert_eq!(p.value(), vec![-1., 2.]);
    assert_eq!(p.grad(), Some(vec![0., 0.]));
}

// Optimizer construction and per-step learning rates.
//
// burn optimizers are distinct types, so the configured kind is turned into a concrete
// optimizer once and handed to an `OptimizerVisitor`, which runs the whole phase with
// it. Learning rates come from burn's `LrScheduler`s and are passed to
// `Optimizer::step` explicitly. Scheduler state goes into the checkpoint as a record.

use crate::config::{OptimizerKind, OptimizerSettings, SchedulerKind};
use burn::{
    grad_clipping::GradientClippingConfig,
    lr_scheduler::{
        constant::ConstantLr,
        exponential::{ExponentialLrScheduler, ExponentialLrSchedulerConfig},
        noam::{NoamLrScheduler, NoamLrSchedulerConfig},
        LrScheduler,
    },
    module::AutodiffModule,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, AdamWConfig, Optimizer,
        SgdConfig,
    },
    tensor::backend::{AutodiffBackend, Backend},
    LearningRate,
};

/// Receives the optimizer selected by `OptimizerSettings::visit`.
pub trait OptimizerVisitor<B: AutodiffBackend, M: AutodiffModule<B>> {
    type Output;

    fn visit<O: Optimizer<M, B>>(self, optim: O) -> Self::Output;
}

impl OptimizerSettings {
    pub fn visit<B, M, V>(&self, visitor: V) -> V::Output
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        V: OptimizerVisitor<B, M>,
    {
        let clipping = self.clip_grad_norm.map(|norm| GradientClippingConfig::Norm(norm as _));
        match self.kind {
            OptimizerKind::AdamW => visitor.visit(
                AdamWConfig::new()
                    .with_weight_decay(self.weight_decay as _)
                    .with_epsilon(1e-8)
                    .with_grad_clipping(clipping)
                    .init::<B, M>(),
            ),
            OptimizerKind::Adam => visitor.visit(
                AdamConfig::new()
                    .with_weight_decay(
                        (self.weight_decay > 0.0)
                            .then(|| WeightDecayConfig::new(self.weight_decay as _)),
                    )
                    .with_epsilon(1e-8)
                    .with_grad_clipping(clipping)
                    .init::<B, M>(),
            ),
            OptimizerKind::Sgd => visitor.visit(
                SgdConfig::new()
                    .with_weight_decay(
                        (self.weight_decay > 0.0)
                            .then(|| WeightDecayConfig::new(self.weight_decay as _)),
                    )
                    .with_momentum(Some(MomentumConfig::new().with_momentum(0.9)))
                    .with_gradient_clipping(clipping)
                    .init::<B, M>(),
            ),
        }
    }
}

/// Linear warmup over `warmup_steps`, then linear decay reaching zero after
/// `total_steps`.
#[derive(Debug, Clone)]
pub struct WarmupDecayLr {
    base_lr: LearningRate,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl WarmupDecayLr {
    pub fn new(base_lr: LearningRate, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }
}

impl<B: Backend> LrScheduler<B> for WarmupDecayLr {
    type Record = usize;

    fn step(&mut self) -> LearningRate {
        self.step += 1;

        if self.step <= self.warmup_steps {
            return self.base_lr * self.step as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = (self.total_steps + 1).saturating_sub(self.step);
        self.base_lr * remaining as f64 / decay_steps as f64
    }

    fn to_record(&self) -> Self::Record {
        self.step
    }

    fn load_record(mut self, record: Self::Record) -> Self {
        self.step = record;
        self
    }
}

/// Scheduler of one training phase, selected by `SchedulerKind`.
#[derive(Debug, Clone)]
pub enum PhaseLrScheduler {
    Constant(ConstantLr),
    Warmup(WarmupDecayLr),
    /// Multiplies the rate by `lr_lambda` over every epoch.
    Lambda(ExponentialLrScheduler),
    Noam(NoamLrScheduler),
}

impl PhaseLrScheduler {
    pub fn new(
        settings: &OptimizerSettings,
        steps_per_epoch: usize,
        num_epochs: usize,
        d_model: usize,
    ) -> Self {
        let steps_per_epoch = steps_per_epoch.max(1);
        match settings.scheduler {
            SchedulerKind::Constant => Self::Constant(ConstantLr::new(settings.lr)),
            SchedulerKind::Warmup => Self::Warmup(WarmupDecayLr::new(
                settings.lr,
                (settings.n_warmup_epochs * steps_per_epoch as f64).round() as usize,
                steps_per_epoch * num_epochs,
            )),
            SchedulerKind::Lambda => Self::Lambda(
                ExponentialLrSchedulerConfig::new(
                    settings.lr,
                    settings.lr_lambda.powf(1.0 / steps_per_epoch as f64),
                )
                .init(),
            ),
            SchedulerKind::Noam => Self::Noam(
                NoamLrSchedulerConfig::new(settings.lr)
                    .with_warmup_steps(settings.noam_warmup_steps)
                    .with_model_size(d_model)
                    .init(),
            ),
        }
    }
}

impl<B: Backend> LrScheduler<B> for PhaseLrScheduler {
    /// Step count for the step based schedulers, last rate for the exponential one.
    type Record = (usize, LearningRate);

    fn step(&mut self) -> LearningRate {
        match self {
            Self::Constant(scheduler) => LrScheduler::<B>::step(scheduler),
            Self::Warmup(scheduler) => LrScheduler::<B>::step(scheduler),
            Self::Lambda(scheduler) => LrScheduler::<B>::step(scheduler),
            Self::Noam(scheduler) => LrScheduler::<B>::step(scheduler),
        }
    }

    fn to_record(&self) -> Self::Record {
        match self {
            Self::Constant(_) => (0, 0.0),
            Self::Warmup(scheduler) => (LrScheduler::<B>::to_record(scheduler), 0.0),
            Self::Lambda(scheduler) => (0, LrScheduler::<B>::to_record(scheduler).0),
            Self::Noam(scheduler) => (LrScheduler::<B>::to_record(scheduler), 0.0),
        }
    }

    fn load_record(self, (step, lr): Self::Record) -> Self {
        match self {
            Self::Constant(scheduler) => Self::Constant(scheduler),
            Self::Warmup(scheduler) => {
                Self::Warmup(LrScheduler::<B>::load_record(scheduler, step))
            }
            Self::Lambda(scheduler) => {
                let (_, gamma) = LrScheduler::<B>::to_record(&scheduler);
                Self::Lambda(LrScheduler::<B>::load_record(scheduler, (lr, gamma)))
            }
            Self::Noam(scheduler) => Self::Noam(LrScheduler::<B>::load_record(scheduler, step)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn settings(scheduler: SchedulerKind) -> OptimizerSettings {
        OptimizerSettings::new()
            .with_lr(1.0)
            .with_scheduler(scheduler)
            .with_n_warmup_epochs(1.0)
            .with_lr_lambda(0.5)
    }

    fn steps(scheduler: &mut PhaseLrScheduler, n: usize) -> Vec<f64> {
        (0..n)
            .map(|_| LrScheduler::<TestBackend>::step(scheduler))
            .collect()
    }

    #[test]
    fn constant_schedule_never_changes() {
        let mut scheduler = PhaseLrScheduler::new(&settings(SchedulerKind::Constant), 4, 3, 8);
        assert!(steps(&mut scheduler, 12).iter().all(|lr| *lr == 1.0));
    }

    #[test]
    fn warmup_rises_then_decays_to_zero() {
        let mut scheduler = PhaseLrScheduler::new(&settings(SchedulerKind::Warmup), 4, 2, 8);
        let lrs = steps(&mut scheduler, 9);
        assert_eq!(&lrs[..4], &[0.25, 0.5, 0.75, 1.0]);
        assert_eq!(&lrs[4..], &[1.0, 0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn lambda_multiplies_the_rate_once_per_epoch() {
        let mut scheduler = PhaseLrScheduler::new(&settings(SchedulerKind::Lambda), 2, 3, 8);
        let lrs = steps(&mut scheduler, 6);
        for (epoch, lr) in lrs.chunks(2).map(|epoch| epoch[1]).enumerate() {
            assert!((lr - 0.5f64.powi(epoch as i32 + 1)).abs() < 1e-9);
        }
        assert!(lrs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn noam_peaks_at_the_end_of_warmup() {
        let settings = settings(SchedulerKind::Noam).with_noam_warmup_steps(10);
        let mut scheduler = PhaseLrScheduler::new(&settings, 100, 1, 16);
        let peak = steps(&mut scheduler, 30)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(9));
    }

    #[test]
    fn record_restores_every_scheduler_mid_phase() {
        for kind in [
            SchedulerKind::Constant,
            SchedulerKind::Warmup,
            SchedulerKind::Lambda,
            SchedulerKind::Noam,
        ] {
            let mut running = PhaseLrScheduler::new(&settings(kind), 4, 3, 8);
            steps(&mut running, 5);

            let record = LrScheduler::<TestBackend>::to_record(&running);
            let mut restored = LrScheduler::<TestBackend>::load_record(
                PhaseLrScheduler::new(&settings(kind), 4, 3, 8),
                record,
            );
            assert_eq!(steps(&mut restored, 4), steps(&mut running, 4), "{kind}");
        }
    }
}

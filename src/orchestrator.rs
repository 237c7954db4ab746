use std::path::Path;

use crate::{
    checkpoint::{Checkpointer, InitialState},
    data::BatchSource,
    dist::ProcessGroup,
    metrics::TrainingMetrics,
    model::SeqModel,
    optimizer::{ApplyOutcome, OptimizerPipeline},
    params::RunConfig,
    selector::{self, apply_flags},
    summary::SummaryWriter,
    TrainError,
};

/// Progress counters. `step` counts optimizer updates, not micro-batches;
/// `epoch` counts dataset exhaustions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingState {
    pub step: usize,
    pub epoch: usize,
}

/// Why the training loop returned. The driver decides how to exit; the loop
/// never terminates the process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The configured step budget was reached.
    Finished { step: usize },
    /// A shutdown was requested; the last state was checkpointed.
    Interrupted { step: usize },
}

/// Validation hook invoked on the evaluation cadence and once more before
/// the final checkpoint.
pub trait Evaluator {
    fn evaluate(
        &mut self,
        model: &dyn SeqModel,
        output_dir: &Path,
        step: usize,
    ) -> Result<(), TrainError>;
}

/// Drives the training loop: feeds batches through the model, routes
/// gradients into the optimizer pipeline, and fires evaluation and
/// checkpoint actions on their step cadences.
pub struct Orchestrator {
    train_steps: usize,
    eval_steps: usize,
    save_checkpoint_steps: usize,
    initial_step: usize,
    update_cycle: usize,
    group: ProcessGroup,
    model: Box<dyn SeqModel>,
    evaluator: Option<Box<dyn Evaluator>>,
    pipeline: OptimizerPipeline,
    flags: Vec<bool>,
    checkpointer: Checkpointer,
    summary: SummaryWriter,
    metrics: TrainingMetrics,
    state: TrainingState,
    micro_batches: usize,
}

impl Orchestrator {
    pub fn new(
        config: &RunConfig,
        group: ProcessGroup,
        model: Box<dyn SeqModel>,
        evaluator: Option<Box<dyn Evaluator>>,
    ) -> Result<Self, TrainError> {
        let train_steps = config.get_usize("train_steps")?;
        let eval_steps = config.get_usize("eval_steps")?;
        let save_checkpoint_steps = config.get_usize("save_checkpoint_steps")?;
        for (name, value) in [
            ("train_steps", train_steps),
            ("eval_steps", eval_steps),
            ("save_checkpoint_steps", save_checkpoint_steps),
        ] {
            if value == 0 {
                return Err(TrainError::config(format!("{} must be at least 1", name)));
            }
        }

        let pipeline = OptimizerPipeline::from_config(config, group.world_size(), group.device())?;
        let update_cycle = pipeline.update_cycle();

        let named = model.named_parameters();
        let names: Vec<String> = named.iter().map(|(name, _)| name.clone()).collect();
        let flags = selector::trainable_flags(&names, config.get_str("pattern")?)?;
        selector::describe_variables(&group, &named, &flags);

        let checkpointer = Checkpointer::from_config(config)?;
        let summary_enabled = group.is_coordinator() && config.get_bool("save_summary")?;
        let summary = SummaryWriter::init(checkpointer.output_dir(), summary_enabled)?;

        Ok(Self {
            train_steps,
            eval_steps,
            save_checkpoint_steps,
            initial_step: config.get_usize("initial_step")?,
            update_cycle,
            group,
            model,
            evaluator,
            pipeline,
            flags,
            checkpointer,
            summary,
            metrics: TrainingMetrics::new(),
            state: TrainingState::default(),
            micro_batches: 0,
        })
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Restore or initialize the starting state. Must run before `run`.
    pub fn resolve_initial(&mut self, explicit: Option<&Path>) -> Result<InitialState, TrainError> {
        if let Some(path) = explicit {
            self.checkpointer.protect(path);
        }
        let initial = self.checkpointer.resolve_initial(
            explicit,
            self.initial_step,
            self.model.as_ref(),
            &mut self.pipeline,
            &self.group,
        )?;
        self.state.step = initial.step;
        self.state.epoch = initial.epoch;
        // A checkpoint taken mid-cycle restores pending gradients; the loop
        // counter must resume at the same phase or steps outrun updates.
        self.micro_batches = self.pipeline.micro_batches();
        Ok(initial)
    }

    pub fn run(&mut self, source: &mut dyn BatchSource) -> Result<Termination, TrainError> {
        self.run_with_shutdown(source, &|| false)
    }

    /// Train until the step budget is reached or `should_stop` turns true.
    /// The step counter advances once per update cycle, at the first
    /// micro-batch of the cycle; cadence actions fire after the cycle
    /// completes, termination checked first, then evaluation, then saving.
    pub fn run_with_shutdown(
        &mut self,
        source: &mut dyn BatchSource,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<Termination, TrainError> {
        loop {
            if should_stop() {
                self.save()?;
                self.summary.close();
                return Ok(Termination::Interrupted {
                    step: self.state.step,
                });
            }

            let batch = match source.next_batch()? {
                Some(batch) => batch,
                None => {
                    self.state.epoch += 1;
                    source.rewind();
                    match source.next_batch()? {
                        Some(batch) => batch,
                        None => {
                            return Err(TrainError::config(
                                "batch source produced no batches after a rewind",
                            ))
                        }
                    }
                }
            };

            if self.micro_batches % self.update_cycle == 0 {
                self.state.step += 1;
            }
            self.micro_batches += 1;

            let named = self.model.named_parameters();
            let loss = self.model.loss(&batch.features, &batch.labels)?;
            let loss_value = loss
                .to_dtype(candle_core::DType::F32)
                .and_then(|t| t.to_vec0::<f32>())
                .map_err(|err| TrainError::runtime(err.to_string()))? as f64;

            let grads = self.pipeline.compute_gradients(&loss, &named)?;
            let pairs: Vec<_> = grads.into_iter().zip(named).collect();
            let kept = apply_flags(&self.flags, pairs)?;
            let outcome = self.pipeline.apply_gradients(self.state.step, kept)?;

            let snapshot = self.metrics.record(loss_value);
            self.summary.scalar("loss", loss_value, self.state.step, 1);
            self.summary
                .scalar("global_step/sec", snapshot.steps_per_sec, self.state.step, 1);
            if let ApplyOutcome::Applied {
                learning_rate,
                grad_norm,
            } = outcome
            {
                self.summary
                    .scalar("learning_rate", learning_rate, self.state.step, 1);
                self.summary
                    .scalar("global_norm/gradient_norm", grad_norm, self.state.step, 1);
            }

            if self.group.is_coordinator() {
                println!(
                    "epoch = {}, step = {}, loss = {:.3} ({:.3} sec)",
                    self.state.epoch + 1,
                    self.state.step,
                    loss_value,
                    snapshot.step_duration.as_secs_f64()
                );
            }

            if self.micro_batches % self.update_cycle != 0 {
                continue;
            }

            if self.state.step >= self.train_steps {
                self.evaluate()?;
                self.save()?;
                self.summary.close();
                return Ok(Termination::Finished {
                    step: self.state.step,
                });
            } else if self.state.step % self.eval_steps == 0 {
                self.evaluate()?;
            } else if self.state.step % self.save_checkpoint_steps == 0 {
                self.save()?;
            }
        }
    }

    fn evaluate(&mut self) -> Result<(), TrainError> {
        if let Some(evaluator) = self.evaluator.as_mut() {
            evaluator.evaluate(
                self.model.as_ref(),
                self.checkpointer.output_dir(),
                self.state.step,
            )?;
        }
        Ok(())
    }

    fn save(&mut self) -> Result<(), TrainError> {
        self.checkpointer.save(
            &self.group,
            self.state.step,
            self.state.epoch,
            self.model.as_ref(),
            &self.pipeline,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Batch, InMemorySource},
        dist::LocalGroup,
        model::{get_model, model_defaults},
    };
    use candle_core::{Device, Tensor};
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_config(output: &Path, pairs: &[(&str, serde_json::Value)]) -> RunConfig {
        let mut config = RunConfig::merge(
            &RunConfig::defaults(),
            &model_defaults("linear").unwrap(),
        );
        config.set("output", json!(output.to_string_lossy()));
        config.set("hidden_size", json!(2));
        config.set("learning_rate_schedule", json!("constant"));
        config.set("learning_rate", json!(0.01));
        config.set("save_summary", json!(false));
        for (key, value) in pairs {
            config.set(key, value.clone());
        }
        config
    }

    fn source_with(batches: usize) -> InMemorySource {
        let mut out = Vec::new();
        for i in 0..batches {
            let features = Tensor::from_slice(
                &[i as f32, 1.0, 2.0, i as f32],
                (2, 2),
                &Device::Cpu,
            )
            .unwrap();
            let labels = Tensor::from_slice(&[1.0f32, -1.0], (2, 1), &Device::Cpu).unwrap();
            out.push(Batch { features, labels });
        }
        InMemorySource::new(out)
    }

    fn orchestrator(config: &RunConfig) -> Orchestrator {
        let group = ProcessGroup::with_collective(Box::new(LocalGroup), Device::Cpu);
        let model = get_model("linear", config, group.device()).unwrap();
        Orchestrator::new(config, group, model, None).unwrap()
    }

    #[test]
    fn finishes_at_the_step_budget() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &[("train_steps", json!(3)), ("save_checkpoint_steps", json!(100))],
        );
        let mut orchestrator = orchestrator(&config);
        orchestrator.resolve_initial(None).unwrap();

        let outcome = orchestrator.run(&mut source_with(2)).unwrap();
        assert_eq!(outcome, Termination::Finished { step: 3 });
        // 2 batches per epoch, 3 steps: the source rewound at least once
        assert!(orchestrator.state().epoch >= 1);
    }

    #[test]
    fn step_advances_once_per_update_cycle() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &[
                ("train_steps", json!(2)),
                ("update_cycle", json!(3)),
                ("save_checkpoint_steps", json!(100)),
            ],
        );
        let mut orchestrator = orchestrator(&config);
        orchestrator.resolve_initial(None).unwrap();

        let outcome = orchestrator.run(&mut source_with(4)).unwrap();
        // 2 steps of 3 micro-batches each
        assert_eq!(outcome, Termination::Finished { step: 2 });
    }

    #[test]
    fn shutdown_checkpoints_and_reports_interruption() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), &[("train_steps", json!(1000))]);
        let mut orchestrator = orchestrator(&config);
        orchestrator.resolve_initial(None).unwrap();

        let outcome = orchestrator
            .run_with_shutdown(&mut source_with(2), &|| true)
            .unwrap();
        assert_eq!(outcome, Termination::Interrupted { step: 0 });
        assert!(dir.path().join("step_00000000").exists());
    }

    #[test]
    fn frozen_parameters_do_not_move() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &[
                ("train_steps", json!(2)),
                ("pattern", json!("weight")),
                ("save_checkpoint_steps", json!(100)),
            ],
        );
        let mut orchestrator = orchestrator(&config);
        orchestrator.resolve_initial(None).unwrap();
        orchestrator.run(&mut source_with(2)).unwrap();

        let params = orchestrator.model.named_parameters();
        let bias = params
            .iter()
            .find(|(name, _)| name.ends_with("bias"))
            .map(|(_, var)| var.as_tensor().to_vec1::<f32>().unwrap())
            .expect("bias present");
        assert_eq!(bias, vec![0.0]);
    }

    #[test]
    fn mid_cycle_interrupt_resumes_the_accumulation_phase() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &[
                ("train_steps", json!(2)),
                ("update_cycle", json!(2)),
                ("save_checkpoint_steps", json!(100)),
            ],
        );
        let mut first = orchestrator(&config);
        first.resolve_initial(None).unwrap();

        // stop on the second loop iteration, after exactly one micro-batch
        let iterations = std::cell::Cell::new(0usize);
        let outcome = first
            .run_with_shutdown(&mut source_with(4), &|| {
                iterations.set(iterations.get() + 1);
                iterations.get() > 1
            })
            .unwrap();
        assert_eq!(outcome, Termination::Interrupted { step: 1 });
        assert_eq!(first.pipeline.micro_batches(), 1);

        let mut second = orchestrator(&config);
        let initial = second.resolve_initial(None).unwrap();
        assert_eq!(initial.step, 1);
        assert_eq!(second.micro_batches, 1);

        let outcome = second.run(&mut source_with(4)).unwrap();
        assert_eq!(outcome, Termination::Finished { step: 2 });
        // two reported steps, two applied updates: the restored cycle
        // finished before the counter advanced again
        assert_eq!(second.pipeline.updates(), 2);
    }

    #[test]
    fn resume_continues_from_the_saved_step() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &[("train_steps", json!(2)), ("save_checkpoint_steps", json!(1))],
        );
        let mut first = orchestrator(&config);
        first.resolve_initial(None).unwrap();
        first.run(&mut source_with(2)).unwrap();

        let config = test_config(
            dir.path(),
            &[("train_steps", json!(4)), ("save_checkpoint_steps", json!(1))],
        );
        let mut second = orchestrator(&config);
        let initial = second.resolve_initial(None).unwrap();
        assert_eq!(initial.step, 2);

        let outcome = second.run(&mut source_with(2)).unwrap();
        assert_eq!(outcome, Termination::Finished { step: 4 });
    }

    #[test]
    fn empty_batch_source_is_rejected_instead_of_spinning() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), &[("train_steps", json!(2))]);
        let mut orchestrator = orchestrator(&config);
        orchestrator.resolve_initial(None).unwrap();

        let err = orchestrator.run(&mut source_with(0)).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn zero_cadence_knob_is_rejected() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), &[("eval_steps", json!(0))]);
        let group = ProcessGroup::with_collective(Box::new(LocalGroup), Device::Cpu);
        let model = get_model("linear", &config, group.device()).unwrap();
        assert!(Orchestrator::new(&config, group, model, None).is_err());
    }

    #[test]
    fn evaluator_fires_on_cadence() {
        struct CountingEvaluator {
            calls: std::rc::Rc<std::cell::Cell<usize>>,
        }
        impl Evaluator for CountingEvaluator {
            fn evaluate(
                &mut self,
                _model: &dyn SeqModel,
                _output_dir: &Path,
                _step: usize,
            ) -> Result<(), TrainError> {
                self.calls.set(self.calls.get() + 1);
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &[
                ("train_steps", json!(4)),
                ("eval_steps", json!(2)),
                ("save_checkpoint_steps", json!(100)),
            ],
        );
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let group = ProcessGroup::with_collective(Box::new(LocalGroup), Device::Cpu);
        let model = get_model("linear", &config, group.device()).unwrap();
        let evaluator = Box::new(CountingEvaluator {
            calls: calls.clone(),
        });
        let mut orchestrator = Orchestrator::new(&config, group, model, Some(evaluator)).unwrap();
        orchestrator.resolve_initial(None).unwrap();
        orchestrator.run(&mut source_with(2)).unwrap();

        // step 2 on cadence, step 4 as the final evaluation
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn explicit_checkpoint_starts_fine_tuning_at_step_zero() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &[("train_steps", json!(2)), ("save_checkpoint_steps", json!(1))],
        );
        let mut first = orchestrator(&config);
        first.resolve_initial(None).unwrap();
        first.run(&mut source_with(2)).unwrap();
        let saved: PathBuf = dir.path().join("step_00000002");
        assert!(saved.exists());

        let fresh_dir = tempdir().unwrap();
        let config = test_config(fresh_dir.path(), &[("train_steps", json!(2))]);
        let mut second = orchestrator(&config);
        let initial = second.resolve_initial(Some(&saved)).unwrap();
        assert_eq!(initial.step, 0);
        assert_eq!(initial.epoch, 0);
    }
}

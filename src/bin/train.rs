use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use seqtrain::{
    get_model, model_defaults, CliOverrides, Evaluator, FileSource, Orchestrator, ProcessGroup,
    RunConfig, SeqModel, Termination, TrainError,
};

fn main() {
    match run() {
        Ok(termination) => {
            match termination {
                Termination::Finished { step } => println!("training finished at step {}", step),
                Termination::Interrupted { step } => {
                    println!("training interrupted at step {}", step)
                }
            }
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(err.exit_code());
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Sequence model training CLI", long_about = None)]
struct Args {
    #[arg(long, help = "Model architecture name")]
    model: String,

    #[arg(long, num_args = 2, value_name = "PATH", help = "Source and target training files")]
    input: Vec<String>,

    #[arg(long, help = "Output directory for checkpoints and summaries")]
    output: Option<String>,

    #[arg(long, num_args = 2, value_name = "PATH", help = "Source and target vocabulary files")]
    vocabulary: Vec<String>,

    #[arg(long, help = "Validation data file")]
    validation: Option<String>,

    #[arg(long, help = "Reference translation files")]
    references: Option<String>,

    #[arg(long, value_name = "PATH", help = "Fine-tune from this checkpoint")]
    checkpoint: Option<PathBuf>,

    #[arg(long, help = "Launch multi-process distributed training")]
    distributed: bool,

    #[arg(long, default_value_t = 0, help = "Rank of this replica")]
    local_rank: usize,

    #[arg(long, help = "Enable half-precision training")]
    half: bool,

    #[arg(
        long,
        default_value = "",
        value_name = "KEY=VALUE,...",
        help = "Free-form hyper-parameter overrides"
    )]
    parameters: String,
}

fn run() -> Result<Termination, TrainError> {
    let args = Args::parse();

    let mut config = RunConfig::merge(&RunConfig::defaults(), &model_defaults(&args.model)?);
    let output = args.output.clone().unwrap_or_else(|| "train".to_string());
    config.import_from(Path::new(&output), &args.model)?;
    config.override_with(&CliOverrides {
        model: Some(args.model.clone()),
        input: args.input.clone(),
        output: args.output.clone(),
        vocabulary: args.vocabulary.clone(),
        validation: args.validation.clone(),
        references: args.references.clone(),
        half: args.half,
        parameters: args.parameters.clone(),
    })?;

    if args.distributed {
        return Err(TrainError::collective(
            "multi-process launch is not supported by this build",
        ));
    }

    let device_list = config.get_usize_list("device_list")?;
    let group = ProcessGroup::init(&device_list, args.local_rank, None)?;

    let output_dir = PathBuf::from(config.get_str("output")?);
    if group.is_coordinator() {
        config.export(&output_dir, "params.json")?;
        let model_subset = config.collect_subset(&model_defaults(&args.model)?);
        model_subset.export(&output_dir, &format!("{}.json", args.model))?;
    }

    let model = get_model(&args.model, &config, group.device())?;

    let evaluator: Option<Box<dyn Evaluator>> = match config.get_str("validation")? {
        "" => None,
        path => Some(Box::new(LossEvaluator::open(
            Path::new(path),
            config.get_usize("hidden_size")?,
            config.get_usize("batch_size")?,
            group.device().clone(),
        )?)),
    };

    let train_path = config
        .get_str_list("input")?
        .into_iter()
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| TrainError::config("an input training file is required"))?;
    let mut source = FileSource::open(
        Path::new(&train_path),
        config.get_usize("hidden_size")?,
        config.get_usize("batch_size")?,
        group.device(),
    )?;
    if source.is_empty() {
        return Err(TrainError::config(format!(
            "training file {} holds no rows",
            train_path
        )));
    }

    let mut orchestrator = Orchestrator::new(&config, group, model, evaluator)?;
    let initial = orchestrator.resolve_initial(args.checkpoint.as_deref())?;
    println!(
        "starting at step {} (epoch {}, {:?})",
        initial.step, initial.epoch, initial.mode
    );

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainError::runtime(format!("failed to install signal handler: {}", err)))?;

    orchestrator.run_with_shutdown(&mut source, &|| shutdown_flag.load(Ordering::Relaxed))
}

/// Held-out loss evaluation. Results append to `eval.txt` under the output
/// directory so the history of a run survives restarts.
struct LossEvaluator {
    source: FileSource,
}

impl LossEvaluator {
    fn open(
        path: &Path,
        feature_dim: usize,
        batch_size: usize,
        device: candle_core::Device,
    ) -> Result<Self, TrainError> {
        let source = FileSource::open(path, feature_dim, batch_size, &device)?;
        if source.is_empty() {
            return Err(TrainError::config(format!(
                "validation file {} holds no rows",
                path.display()
            )));
        }
        Ok(Self { source })
    }
}

impl Evaluator for LossEvaluator {
    fn evaluate(
        &mut self,
        model: &dyn SeqModel,
        output_dir: &Path,
        step: usize,
    ) -> Result<(), TrainError> {
        use seqtrain::BatchSource;

        self.source.rewind();
        let mut total = 0.0f64;
        let mut batches = 0usize;
        while let Some(batch) = self.source.next_batch()? {
            let loss = model.loss(&batch.features, &batch.labels)?;
            total += loss
                .to_vec0::<f32>()
                .map_err(|err| TrainError::runtime(err.to_string()))? as f64;
            batches += 1;
        }
        let mean = total / batches.max(1) as f64;
        println!("validation: step = {}, loss = {:.6}", step, mean);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_dir.join("eval.txt"))?;
        writeln!(file, "step = {}, loss = {:.6}", step, mean)?;
        Ok(())
    }
}

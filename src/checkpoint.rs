use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    dist::ProcessGroup,
    model::SeqModel,
    optimizer::{OptimizerPipeline, PipelineState},
    params::RunConfig,
    TrainError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub step: usize,
    pub epoch: usize,
    pub model: FileRecord,
    pub optimizer: Option<FileRecord>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// How the initial state was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Weights loaded from an explicitly given checkpoint, counters reset.
    FineTune,
    /// Weights and progress restored from the newest checkpoint under the
    /// output directory.
    Resumed,
    Fresh,
}

#[derive(Debug, Clone, Copy)]
pub struct InitialState {
    pub step: usize,
    pub epoch: usize,
    pub mode: StartMode,
}

/// Saves, rotates, and restores training checkpoints under the run's output
/// directory. Only the coordinator replica writes; every replica restores.
pub struct Checkpointer {
    output_dir: PathBuf,
    keep_max: usize,
    protected: HashSet<PathBuf>,
}

impl Checkpointer {
    pub fn new(output_dir: impl Into<PathBuf>, keep_max: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            keep_max,
            protected: HashSet::new(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, TrainError> {
        Ok(Self::new(
            config.get_str("output")?,
            config.get_usize("keep_checkpoint_max")?,
        ))
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Exempt a checkpoint directory from rotation.
    pub fn protect(&mut self, directory: &Path) {
        self.protected.insert(directory.to_path_buf());
    }

    /// Persist weights, optimizer state, and the manifest, then rotate old
    /// checkpoints. Replicas other than the coordinator return Ok(None)
    /// without touching the filesystem.
    pub fn save(
        &self,
        group: &ProcessGroup,
        step: usize,
        epoch: usize,
        model: &dyn SeqModel,
        pipeline: &OptimizerPipeline,
    ) -> Result<Option<CheckpointDescriptor>, TrainError> {
        if !group.is_coordinator() {
            return Ok(None);
        }

        fs::create_dir_all(&self.output_dir)?;
        let checkpoint_dir = self.output_dir.join(format!("step_{:08}", step));
        if checkpoint_dir.exists() {
            fs::remove_dir_all(&checkpoint_dir)?;
        }
        fs::create_dir(&checkpoint_dir)?;

        let model_path = checkpoint_dir.join(MODEL_FILENAME);
        save_model_weights(model, &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &pipeline.state()?)?;
        let optimizer_record = file_record(&optimizer_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            step,
            epoch,
            model: model_record,
            optimizer: Some(optimizer_record),
        };
        write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

        println!("saved checkpoint {}", checkpoint_dir.display());
        self.prune();

        Ok(Some(CheckpointDescriptor {
            directory: checkpoint_dir,
            manifest,
        }))
    }

    /// Newest checkpoint under the output directory, by step number.
    pub fn latest(&self) -> Result<Option<CheckpointDescriptor>, TrainError> {
        let dirs = checkpoint_directories(&self.output_dir)?;
        let Some(path) = dirs.into_iter().max() else {
            return Ok(None);
        };
        let manifest = load_manifest(&path)?;
        Ok(Some(CheckpointDescriptor {
            directory: path,
            manifest,
        }))
    }

    /// Decide where training starts from. An explicit checkpoint path means
    /// fine-tuning: only weights load and counters reset to `initial_step`.
    /// Otherwise the newest checkpoint under the output directory resumes
    /// weights, counters, and (best effort) optimizer state. With neither,
    /// training starts fresh. Fine-tune and fresh starts broadcast the
    /// coordinator's weights so every replica begins identical.
    pub fn resolve_initial(
        &self,
        explicit: Option<&Path>,
        initial_step: usize,
        model: &dyn SeqModel,
        pipeline: &mut OptimizerPipeline,
        group: &ProcessGroup,
    ) -> Result<InitialState, TrainError> {
        if let Some(path) = explicit {
            let manifest = load_manifest(path)?;
            ensure_version_supported(manifest.version)?;
            restore_weights(path, &manifest, model)?;
            group.broadcast_model(model)?;
            return Ok(InitialState {
                step: initial_step,
                epoch: 0,
                mode: StartMode::FineTune,
            });
        }

        if let Some(descriptor) = self.latest()? {
            ensure_version_supported(descriptor.manifest.version)?;
            restore_weights(&descriptor.directory, &descriptor.manifest, model)?;
            match self.restore_optimizer(&descriptor) {
                Ok(state) => pipeline.load_state(state)?,
                Err(err) => {
                    eprintln!(
                        "warning: optimizer state in {} not restored: {}",
                        descriptor.directory.display(),
                        err
                    );
                }
            }
            return Ok(InitialState {
                step: descriptor.manifest.step,
                epoch: descriptor.manifest.epoch,
                mode: StartMode::Resumed,
            });
        }

        group.broadcast_model(model)?;
        Ok(InitialState {
            step: 0,
            epoch: 0,
            mode: StartMode::Fresh,
        })
    }

    fn restore_optimizer(
        &self,
        descriptor: &CheckpointDescriptor,
    ) -> Result<PipelineState, TrainError> {
        let record = descriptor.manifest.optimizer.as_ref().ok_or_else(|| {
            TrainError::restore("checkpoint carries no optimizer state".to_string())
        })?;
        let path = descriptor.directory.join(&record.filename);
        validate_file(&path, &record.sha256)?;
        read_json(&path)
    }

    /// Delete the oldest checkpoints beyond `keep_max`, skipping protected
    /// directories. Rotation failures are tolerated.
    fn prune(&self) {
        if self.keep_max == 0 {
            return;
        }
        let Ok(mut dirs) = checkpoint_directories(&self.output_dir) else {
            return;
        };
        dirs.retain(|dir| !self.protected.contains(dir));
        dirs.sort();
        while dirs.len() > self.keep_max {
            let victim = dirs.remove(0);
            let _ = fs::remove_dir_all(&victim);
        }
    }
}

fn restore_weights(
    directory: &Path,
    manifest: &CheckpointManifest,
    model: &dyn SeqModel,
) -> Result<(), TrainError> {
    let path = directory.join(&manifest.model.filename);
    validate_file(&path, &manifest.model.sha256)?;

    let named = model.named_parameters();
    let device = match named.first() {
        Some((_, var)) => var.as_tensor().device().clone(),
        None => candle_core::Device::Cpu,
    };
    let tensors = load_safetensors(&path, &device)
        .map_err(|err| TrainError::restore(format!("failed to load {}: {}", path.display(), err)))?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in named {
        let tensor = by_name.remove(&name).ok_or_else(|| {
            TrainError::restore(format!("checkpoint missing parameter '{}'", name))
        })?;
        let dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == dtype {
            tensor
        } else {
            tensor
                .to_dtype(dtype)
                .map_err(|err| TrainError::restore(err.to_string()))?
        };
        var.set(&tensor)
            .map_err(|err| TrainError::restore(err.to_string()))?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainError::restore(format!(
            "checkpoint contains unknown parameters: {}",
            extra
        )));
    }
    Ok(())
}

fn save_model_weights(model: &dyn SeqModel, path: &Path) -> Result<(), TrainError> {
    let named = model.named_parameters();
    if named.is_empty() {
        return Err(TrainError::runtime("model has no parameters to save"));
    }
    let mut tensors = HashMap::with_capacity(named.len());
    for (name, var) in named {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainError::runtime(format!(
            "failed to write model weights to {}: {}",
            path.display(),
            err
        ))
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, TrainError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("step_") {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainError::restore(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainError::restore(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainError::restore(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn file_record(path: &Path) -> Result<FileRecord, TrainError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: fs::metadata(path)?.len(),
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainError> {
    let mut file = File::create(path)?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainError::runtime(format!("failed to serialize JSON: {}", err)))?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainError> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(|err| {
        TrainError::restore(format!("failed to parse {}: {}", path.display(), err))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dist::{LocalGroup, ProcessGroup},
        model::{get_model, SeqModel},
        optimizer::OptimizerPipeline,
        params::RunConfig,
    };
    use candle_core::Device;
    use tempfile::tempdir;

    fn test_setup(output: &Path) -> (RunConfig, ProcessGroup, Box<dyn SeqModel>, OptimizerPipeline)
    {
        let mut config = RunConfig::merge(
            &RunConfig::defaults(),
            &crate::model::model_defaults("linear").unwrap(),
        );
        config.set("output", serde_json::json!(output.to_string_lossy()));
        let group = ProcessGroup::with_collective(Box::new(LocalGroup), Device::Cpu);
        let model = get_model("linear", &config, group.device()).unwrap();
        let pipeline = OptimizerPipeline::from_config(&config, 1, group.device()).unwrap();
        (config, group, model, pipeline)
    }

    fn weights_of(model: &dyn SeqModel) -> Vec<Vec<f32>> {
        model
            .named_parameters()
            .iter()
            .map(|(_, var)| {
                var.as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn save_then_resume_restores_progress() {
        let dir = tempdir().unwrap();
        let (config, group, model, pipeline) = test_setup(dir.path());
        let checkpointer = Checkpointer::from_config(&config).unwrap();

        let descriptor = checkpointer
            .save(&group, 42, 3, model.as_ref(), &pipeline)
            .unwrap()
            .expect("coordinator saves");
        assert!(descriptor.directory.ends_with("step_00000042"));
        assert_eq!(descriptor.manifest.model.filename, MODEL_FILENAME);
        assert!(descriptor.manifest.model.bytes > 0);
        let optimizer_record = descriptor.manifest.optimizer.as_ref().expect("record");
        assert_eq!(optimizer_record.filename, OPTIMIZER_FILENAME);
        assert_eq!(optimizer_record.sha256.len(), 64);
        let saved = weights_of(model.as_ref());

        let (config2, group2, model2, mut pipeline2) = test_setup(dir.path());
        let checkpointer2 = Checkpointer::from_config(&config2).unwrap();
        let initial = checkpointer2
            .resolve_initial(None, 0, model2.as_ref(), &mut pipeline2, &group2)
            .unwrap();
        assert_eq!(initial.step, 42);
        assert_eq!(initial.epoch, 3);
        assert_eq!(initial.mode, StartMode::Resumed);
        assert_eq!(weights_of(model2.as_ref()), saved);
    }

    #[test]
    fn explicit_checkpoint_resets_counters() {
        let dir = tempdir().unwrap();
        let (config, group, model, pipeline) = test_setup(dir.path());
        let checkpointer = Checkpointer::from_config(&config).unwrap();
        let descriptor = checkpointer
            .save(&group, 99, 7, model.as_ref(), &pipeline)
            .unwrap()
            .expect("coordinator saves");

        let other = tempdir().unwrap();
        let (config2, group2, model2, mut pipeline2) = test_setup(other.path());
        let checkpointer2 = Checkpointer::from_config(&config2).unwrap();
        let initial = checkpointer2
            .resolve_initial(
                Some(&descriptor.directory),
                5,
                model2.as_ref(),
                &mut pipeline2,
                &group2,
            )
            .unwrap();
        assert_eq!(initial.step, 5);
        assert_eq!(initial.epoch, 0);
        assert_eq!(initial.mode, StartMode::FineTune);
    }

    #[test]
    fn explicit_path_wins_over_on_disk_latest() {
        let donor = tempdir().unwrap();
        let (config, group, model, pipeline) = test_setup(donor.path());
        let checkpointer = Checkpointer::from_config(&config).unwrap();
        let explicit = checkpointer
            .save(&group, 77, 4, model.as_ref(), &pipeline)
            .unwrap()
            .expect("coordinator saves");

        // the run's own output dir already holds a newer checkpoint
        let output = tempdir().unwrap();
        let (config2, group2, model2, mut pipeline2) = test_setup(output.path());
        let checkpointer2 = Checkpointer::from_config(&config2).unwrap();
        checkpointer2
            .save(&group2, 300, 9, model2.as_ref(), &pipeline2)
            .unwrap()
            .expect("coordinator saves");

        let initial = checkpointer2
            .resolve_initial(
                Some(&explicit.directory),
                11,
                model2.as_ref(),
                &mut pipeline2,
                &group2,
            )
            .unwrap();
        assert_eq!(initial.mode, StartMode::FineTune);
        assert_eq!(initial.step, 11);
        assert_eq!(initial.epoch, 0);
    }

    #[test]
    fn fresh_start_when_nothing_exists() {
        let dir = tempdir().unwrap();
        let (_, group, model, mut pipeline) = test_setup(dir.path());
        let checkpointer = Checkpointer::new(dir.path().join("empty"), 5);
        let initial = checkpointer
            .resolve_initial(None, 0, model.as_ref(), &mut pipeline, &group)
            .unwrap();
        assert_eq!(initial.mode, StartMode::Fresh);
        assert_eq!(initial.step, 0);
    }

    #[test]
    fn corrupt_weights_are_a_restore_error() {
        let dir = tempdir().unwrap();
        let (config, group, model, pipeline) = test_setup(dir.path());
        let checkpointer = Checkpointer::from_config(&config).unwrap();
        let descriptor = checkpointer
            .save(&group, 1, 0, model.as_ref(), &pipeline)
            .unwrap()
            .expect("coordinator saves");

        fs::write(descriptor.directory.join(MODEL_FILENAME), b"garbage").unwrap();

        let (config2, group2, model2, mut pipeline2) = test_setup(dir.path());
        let checkpointer2 = Checkpointer::from_config(&config2).unwrap();
        let err = checkpointer2
            .resolve_initial(None, 0, model2.as_ref(), &mut pipeline2, &group2)
            .unwrap_err();
        assert!(matches!(err, TrainError::Restore(_)));
    }

    #[test]
    fn rotation_keeps_only_the_newest() {
        let dir = tempdir().unwrap();
        let (_config, group, model, pipeline) = test_setup(dir.path());
        let checkpointer = Checkpointer::new(dir.path(), 2);

        for step in 1..=5 {
            checkpointer
                .save(&group, step, 0, model.as_ref(), &pipeline)
                .unwrap();
        }

        let mut remaining = checkpoint_directories(dir.path()).unwrap();
        remaining.sort();
        let names: Vec<_> = remaining
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(names, vec!["step_00000004", "step_00000005"]);
    }

    #[test]
    fn protected_checkpoints_survive_rotation() {
        let dir = tempdir().unwrap();
        let (_, group, model, pipeline) = test_setup(dir.path());
        let mut checkpointer = Checkpointer::new(dir.path(), 1);

        let first = checkpointer
            .save(&group, 1, 0, model.as_ref(), &pipeline)
            .unwrap()
            .expect("coordinator saves");
        checkpointer.protect(&first.directory);

        for step in 2..=4 {
            checkpointer
                .save(&group, step, 0, model.as_ref(), &pipeline)
                .unwrap();
        }
        assert!(first.directory.exists());
    }
}

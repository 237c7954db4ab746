use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};

use crate::TrainError;

/// Typed hyper-parameter registry. Keys are sorted so the exported JSON is
/// canonical and export/import round-trips losslessly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunConfig {
    entries: BTreeMap<String, Value>,
}

/// Command-line-sourced overrides. Unset or empty values never clobber an
/// existing config entry; `parameters` is a free-form `key=value[,key=value]`
/// string applied last.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub model: Option<String>,
    pub input: Vec<String>,
    pub output: Option<String>,
    pub vocabulary: Vec<String>,
    pub validation: Option<String>,
    pub references: Option<String>,
    pub half: bool,
    pub parameters: String,
}

impl RunConfig {
    /// Baseline configuration. Every option has a type-stable default.
    pub fn defaults() -> Self {
        let mut config = RunConfig::default();
        let defaults = [
            ("input", json!(["", ""])),
            ("output", json!("train")),
            ("model", json!("linear")),
            ("vocab", json!(["", ""])),
            // Dataset
            ("batch_size", json!(32)),
            // Training
            ("initial_step", json!(0)),
            ("warmup_steps", json!(4000)),
            ("train_steps", json!(100_000)),
            ("update_cycle", json!(1)),
            ("optimizer", json!("adam")),
            ("adam_beta1", json!(0.9)),
            ("adam_beta2", json!(0.999)),
            ("adam_epsilon", json!(1e-8)),
            ("adadelta_rho", json!(0.95)),
            ("adadelta_epsilon", json!(1e-7)),
            ("pattern", json!("")),
            ("clipping", json!("global_norm")),
            ("clip_grad_norm", json!(5.0)),
            ("adaptive_clip_rho", json!(0.95)),
            ("learning_rate", json!(1.0)),
            ("initial_learning_rate", json!(0.0)),
            ("learning_rate_schedule", json!("linear_warmup_rsqrt_decay")),
            ("learning_rate_boundaries", json!([])),
            ("learning_rate_values", json!([])),
            ("start_decay_step", json!(0)),
            ("end_decay_step", json!(0)),
            ("device_list", json!([0])),
            ("half", json!(false)),
            // Checkpoint saving
            ("keep_checkpoint_max", json!(20)),
            ("keep_top_checkpoint_max", json!(5)),
            ("save_summary", json!(true)),
            ("save_checkpoint_steps", json!(1000)),
            // Validation
            ("eval_steps", json!(2000)),
            ("validation", json!("")),
            ("references", json!("")),
        ];
        for (key, value) in defaults {
            config.entries.insert(key.to_string(), value);
        }
        config
    }

    /// Merge two configs: every key of `base` survives, keys present in both
    /// take `overlay`'s value, keys unique to `overlay` are added.
    pub fn merge(base: &RunConfig, overlay: &RunConfig) -> RunConfig {
        let mut entries = base.entries.clone();
        for (key, value) in &overlay.entries {
            entries.insert(key.clone(), value.clone());
        }
        RunConfig { entries }
    }

    /// Restore hyper-parameters persisted by a previous run. Reads
    /// `params.json` and `<model_name>.json` under `dir` when present; absent
    /// files are not an error. Both documents are parsed before either is
    /// applied so a malformed file leaves the store untouched.
    pub fn import_from(&mut self, dir: &Path, model_name: &str) -> Result<(), TrainError> {
        let candidates = [
            dir.join("params.json"),
            dir.join(format!("{}.json", model_name)),
        ];

        let mut staged = Vec::new();
        for path in &candidates {
            if !path.is_file() {
                continue;
            }
            let contents = fs::read_to_string(path)?;
            let parsed: RunConfig = serde_json::from_str(&contents).map_err(|err| {
                TrainError::config(format!(
                    "malformed hyper-parameter file {}: {}",
                    path.display(),
                    err
                ))
            })?;
            staged.push(parsed);
        }

        for parsed in staged {
            *self = RunConfig::merge(self, &parsed);
        }
        Ok(())
    }

    /// Apply command-line overrides. Empty or unset CLI values are ignored;
    /// the free-form `parameters` string is parsed last. Fails without
    /// partially applying anything when a key is unknown or changes type.
    pub fn override_with(&mut self, cli: &CliOverrides) -> Result<(), TrainError> {
        if let Some(model) = non_empty(&cli.model) {
            self.entries.insert("model".into(), json!(model));
        }
        if cli.input.len() == 2 {
            self.entries.insert("input".into(), json!(cli.input));
        }
        if let Some(output) = non_empty(&cli.output) {
            self.entries.insert("output".into(), json!(output));
        }
        if cli.vocabulary.len() == 2 {
            self.entries.insert("vocab".into(), json!(cli.vocabulary));
        }
        if let Some(validation) = non_empty(&cli.validation) {
            self.entries.insert("validation".into(), json!(validation));
        }
        if let Some(references) = non_empty(&cli.references) {
            self.entries.insert("references".into(), json!(references));
        }
        if cli.half {
            self.entries.insert("half".into(), json!(true));
        }
        self.parse_assignments(&cli.parameters)
    }

    /// Parse a free-form `key=value[,key=value]` override string. List values
    /// may contain commas (`device_list=[0,1]`); splitting tracks bracket
    /// depth. Unknown keys and type changes fail with a ConfigError and
    /// nothing is applied.
    pub fn parse_assignments(&mut self, text: &str) -> Result<(), TrainError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let mut staged: Vec<(String, Value)> = Vec::new();
        for assignment in split_assignments(text) {
            let assignment = assignment.trim();
            if assignment.is_empty() {
                continue;
            }
            let (key, raw) = assignment.split_once('=').ok_or_else(|| {
                TrainError::config(format!(
                    "parameter override '{}' must be in key=value form",
                    assignment
                ))
            })?;
            let key = key.trim();
            let existing = self.entries.get(key).ok_or_else(|| {
                TrainError::config(format!("unknown hyper-parameter '{}'", key))
            })?;
            let value = parse_for(existing, raw.trim()).ok_or_else(|| {
                TrainError::config(format!(
                    "value '{}' for hyper-parameter '{}' does not match its type",
                    raw.trim(),
                    key
                ))
            })?;
            staged.push((key.to_string(), value));
        }

        for (key, value) in staged {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    /// Write the configuration as canonical JSON, creating the directory if
    /// needed.
    pub fn export(&self, dir: &Path, filename: &str) -> Result<(), TrainError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(filename);
        let mut data = serde_json::to_string_pretty(self)
            .map_err(|err| TrainError::runtime(format!("failed to serialize config: {}", err)))?;
        data.push('\n');
        fs::write(&path, data)?;
        Ok(())
    }

    /// Configuration limited to exactly the keys of `template`. Used to
    /// persist only model-specific parameters.
    pub fn collect_subset(&self, template: &RunConfig) -> RunConfig {
        let mut entries = BTreeMap::new();
        for key in template.entries.keys() {
            if let Some(value) = self.entries.get(key) {
                entries.insert(key.clone(), value.clone());
            }
        }
        RunConfig { entries }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn get_str(&self, key: &str) -> Result<&str, TrainError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| type_error(key, "string"))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, TrainError> {
        self.require(key)?
            .as_bool()
            .ok_or_else(|| type_error(key, "boolean"))
    }

    pub fn get_usize(&self, key: &str) -> Result<usize, TrainError> {
        self.require(key)?
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| type_error(key, "non-negative integer"))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, TrainError> {
        self.require(key)?
            .as_f64()
            .ok_or_else(|| type_error(key, "number"))
    }

    pub fn get_usize_list(&self, key: &str) -> Result<Vec<usize>, TrainError> {
        let values = self
            .require(key)?
            .as_array()
            .ok_or_else(|| type_error(key, "integer list"))?;
        values
            .iter()
            .map(|v| {
                v.as_u64()
                    .map(|v| v as usize)
                    .ok_or_else(|| type_error(key, "integer list"))
            })
            .collect()
    }

    pub fn get_f64_list(&self, key: &str) -> Result<Vec<f64>, TrainError> {
        let values = self
            .require(key)?
            .as_array()
            .ok_or_else(|| type_error(key, "number list"))?;
        values
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| type_error(key, "number list")))
            .collect()
    }

    pub fn get_str_list(&self, key: &str) -> Result<Vec<String>, TrainError> {
        let values = self
            .require(key)?
            .as_array()
            .ok_or_else(|| type_error(key, "string list"))?;
        values
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| type_error(key, "string list"))
            })
            .collect()
    }

    fn require(&self, key: &str) -> Result<&Value, TrainError> {
        self.entries
            .get(key)
            .ok_or_else(|| TrainError::config(format!("missing hyper-parameter '{}'", key)))
    }
}

fn type_error(key: &str, expected: &str) -> TrainError {
    TrainError::config(format!(
        "hyper-parameter '{}' is not a {}",
        key, expected
    ))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Split `k=v,k2=[1,2],k3=v3` on commas outside brackets.
fn split_assignments(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '[' | '{' => depth += 1,
            ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Parse `raw` into a value matching the type of `existing`. Returns None
/// when the text cannot be coerced to that type.
fn parse_for(existing: &Value, raw: &str) -> Option<Value> {
    match existing {
        Value::String(_) => Some(Value::String(raw.to_string())),
        Value::Bool(_) => match raw.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Value::Number(n) => {
            if n.is_u64() || n.is_i64() {
                raw.parse::<i64>().ok().map(|v| Value::Number(Number::from(v)))
            } else {
                raw.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
            }
        }
        Value::Array(_) => serde_json::from_str::<Value>(raw)
            .ok()
            .filter(Value::is_array),
        _ => None,
    }
}

use std::{fs, path::Path};

use candle_core::{Device, Tensor};

use crate::TrainError;

/// One training batch: a `[batch, feature_dim]` feature matrix and a
/// `[batch, 1]` label column.
pub struct Batch {
    pub features: Tensor,
    pub labels: Tensor,
}

/// Sequential batch supplier. `next_batch` returns None when the epoch is
/// exhausted; `rewind` starts the next epoch from the beginning.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainError>;
    fn rewind(&mut self);
}

/// Batches served from pre-built tensors. Used by tests and evaluation.
pub struct InMemorySource {
    batches: Vec<Batch>,
    cursor: usize,
}

impl InMemorySource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl BatchSource for InMemorySource {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainError> {
        let Some(batch) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(Batch {
            features: batch.features.clone(),
            labels: batch.labels.clone(),
        }))
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }
}

/// Whitespace-separated numeric rows loaded eagerly from a text file. Each
/// row holds `feature_dim` feature columns followed by one label column.
#[derive(Debug)]
pub struct FileSource {
    rows: Vec<(Vec<f32>, f32)>,
    feature_dim: usize,
    batch_size: usize,
    cursor: usize,
    device: Device,
}

impl FileSource {
    pub fn open(
        path: &Path,
        feature_dim: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self, TrainError> {
        if batch_size == 0 {
            return Err(TrainError::config("batch_size must be at least 1"));
        }
        let contents = fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut values = Vec::with_capacity(feature_dim + 1);
            for token in line.split_whitespace() {
                let value = token.parse::<f32>().map_err(|_| {
                    TrainError::config(format!(
                        "{}:{}: '{}' is not a number",
                        path.display(),
                        line_no + 1,
                        token
                    ))
                })?;
                values.push(value);
            }
            if values.len() != feature_dim + 1 {
                return Err(TrainError::config(format!(
                    "{}:{}: expected {} columns, found {}",
                    path.display(),
                    line_no + 1,
                    feature_dim + 1,
                    values.len()
                )));
            }
            let label = values[feature_dim];
            values.truncate(feature_dim);
            rows.push((values, label));
        }
        Ok(Self {
            rows,
            feature_dim,
            batch_size,
            cursor: 0,
            device: device.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl BatchSource for FileSource {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainError> {
        if self.cursor >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.rows.len());
        let rows = &self.rows[self.cursor..end];
        self.cursor = end;

        let count = rows.len();
        let mut features = Vec::with_capacity(count * self.feature_dim);
        let mut labels = Vec::with_capacity(count);
        for (row, label) in rows {
            features.extend_from_slice(row);
            labels.push(*label);
        }

        let features = Tensor::from_vec(features, (count, self.feature_dim), &self.device)
            .map_err(|err| TrainError::runtime(err.to_string()))?;
        let labels = Tensor::from_vec(labels, (count, 1), &self.device)
            .map_err(|err| TrainError::runtime(err.to_string()))?;
        Ok(Some(Batch { features, labels }))
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }
}

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::TrainError;

/// Scalar summary sink in the TensorBoard event-file format. Disabled
/// writers (non-coordinator replicas, `save_summary=false`) swallow every
/// call.
pub struct SummaryWriter {
    writer: Option<TfEventWriter>,
}

impl SummaryWriter {
    pub fn init(dir: &Path, enabled: bool) -> Result<Self, TrainError> {
        let writer = if enabled {
            Some(TfEventWriter::create(dir)?)
        } else {
            None
        };
        Ok(Self { writer })
    }

    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Record a scalar when the step falls on the write cadence. Write
    /// failures never interrupt training.
    pub fn scalar(&mut self, tag: &str, value: f64, step: usize, write_every_n_steps: usize) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if step % write_every_n_steps.max(1) != 0 {
            return;
        }
        let _ = writer.write_scalar(tag, step as i64, value);
    }

    pub fn close(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
        self.writer = None;
    }
}

struct TfEventWriter {
    writer: BufWriter<File>,
}

impl TfEventWriter {
    fn create(dir: &Path) -> Result<Self, TrainError> {
        fs::create_dir_all(dir)?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let file = File::create(dir.join(filename))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    /// TFRecord framing: length, masked crc of length, payload, masked crc
    /// of payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainError> {
        let mut buffer = BytesMut::with_capacity(128);
        event
            .encode(&mut buffer)
            .map_err(|err| TrainError::runtime(format!("failed to encode event: {}", err)))?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.writer
            .write_all(&masked_crc32(data.as_ref()).to_le_bytes())?;
        self.flush()
    }

    fn flush(&mut self) -> Result<(), TrainError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for TfEventWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

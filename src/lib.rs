pub mod checkpoint;
pub mod data;
pub mod dist;
pub mod error;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod orchestrator;
pub mod params;
pub mod schedule;
pub mod selector;
pub mod summary;

pub use checkpoint::{CheckpointDescriptor, Checkpointer, InitialState, StartMode};
pub use data::{Batch, BatchSource, FileSource, InMemorySource};
pub use dist::{Collective, LocalGroup, ProcessGroup};
pub use error::TrainError;
pub use model::{get_model, model_defaults, LinearModel, SeqModel};
pub use optimizer::{ApplyOutcome, OptimizerPipeline};
pub use orchestrator::{Evaluator, Orchestrator, Termination, TrainingState};
pub use params::{CliOverrides, RunConfig};
pub use schedule::Schedule;
pub use summary::SummaryWriter;

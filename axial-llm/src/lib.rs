pub mod config;
pub mod data;
pub mod export;
pub mod io;
pub mod loss;
pub mod model;
pub mod tokenizer;
pub mod training;

pub use config::{LmConfig, TrainingConfig};
pub use export::{export_checkpoint, export_model, import_model};
pub use loss::{LmExample, compute_loss};
pub use model::Gpt2LmHeadModel;
pub use training::Trainer;

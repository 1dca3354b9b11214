pub mod adapter;
pub mod bundle;
pub mod config;
pub mod control;
pub mod device_map;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod finetune;
pub mod loader;
mod loader_factory;
pub mod pipeline;
pub mod pose;
pub mod predictor;
pub mod request;
pub mod safety;
pub mod safety_checker;
pub mod scheduler;
pub mod sdxl;
mod util;
pub mod watermark;
pub mod weights;

pub use config::{Precision, Settings};
pub use device_map::*;
pub use dispatch::Mode;
pub use error::{Error, Result};
pub use loader::*;
pub use loader_factory::*;
pub use predictor::Predictor;
pub use request::{GenerationRequest, Prediction, DEFAULT_PROMPT, MAX_DIMENSION};
pub use scheduler::SchedulerKind;
pub use sdxl::SdxlLoader;
pub use util::NoiseSource;
pub(crate) use util::*;

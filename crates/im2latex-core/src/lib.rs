pub mod attention;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod layer_norm;
pub mod model;
pub mod rotary;
pub mod transformer;
pub mod weights;

pub use config::ModelConfig;
pub use error::{ModelError, Result};
pub use model::{Im2LatexModel, Seq2Seq};
pub use weights::load_weights;

//! Model lookup by configured name.

use tracing::info;

use ctxkeeper_core::{Config, Error, LoadedModel, Result};

use crate::reference::ReferenceBackend;
use crate::sampler::ChainSampler;
use crate::tokenizer::ByteTokenizer;

/// Name of the built-in reference model.
pub const REFERENCE_MODEL: &str = "reference";

/// Names accepted by [`load_model`].
pub fn available_models() -> &'static [&'static str] {
    &[REFERENCE_MODEL]
}

/// Assemble the reference model with the configured window and sampling.
pub fn reference_model(config: &Config) -> LoadedModel {
    let capacity = config.window.capacity;
    LoadedModel::new(
        config.model.name.clone(),
        Box::new(ReferenceBackend::new(capacity)),
        Box::new(ByteTokenizer::new()),
        Box::new(ChainSampler::from_config(&config.sampling, capacity)),
    )
}

/// Load the model named in `config`.
pub fn load_model(config: &Config) -> Result<LoadedModel> {
    match config.model.name.as_str() {
        REFERENCE_MODEL => {
            info!(
                capacity = config.window.capacity,
                greedy = config.sampling.is_greedy(),
                "Loading reference model"
            );
            Ok(reference_model(config))
        }
        other => Err(Error::Config(format!(
            "unknown model '{}', available: {}",
            other,
            available_models().join(", ")
        ))),
    }
}

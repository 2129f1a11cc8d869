//! Single-file checkpoints of every learned parameter.
//!
//! Optimizer state is not stored. Loading is all-or-nothing: the file must hold
//! exactly the parameters of the target model, with matching shapes, or nothing
//! is copied.
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::IntroVae;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tch::{Device, Tensor};
use tracing::info;

/// Writes every parameter of `model` to `path`, creating missing parent directories.
pub fn save<P: AsRef<Path>>(model: &IntroVae, path: P) -> Result<()> {
    if let Some(dir) = path.as_ref().parent() {
        fs::create_dir_all(dir)?;
    }
    let named: Vec<_> = model.named_variables().into_iter().collect();
    Tensor::save_multi(&named, path.as_ref())?;
    info!(path = ?path.as_ref(), tensors = named.len(), "saved checkpoint");
    Ok(())
}

pub fn load<P: AsRef<Path>>(model: &mut IntroVae, path: P) -> Result<()> {
    let stored: BTreeMap<String, Tensor> =
        Tensor::load_multi(path.as_ref())?.into_iter().collect();
    let expected = model.named_variables();

    if let Some(name) = stored.keys().find(|name| !expected.contains_key(*name)) {
        return Err(Error::UnexpectedParameter(name.clone()));
    }
    for (name, var) in &expected {
        let src = stored
            .get(name)
            .ok_or_else(|| Error::MissingParameter(name.clone()))?;
        if src.size() != var.size() {
            return Err(Error::ParameterShape {
                name: name.clone(),
                expected: var.size(),
                actual: src.size(),
            });
        }
    }

    tch::no_grad(|| {
        for (name, mut var) in expected {
            var.copy_(&stored[&name]);
        }
    });
    Ok(())
}

/// Builds a model for `config` and fills it from `path`.
pub fn restore<P: AsRef<Path>>(config: ModelConfig, path: P, device: Device) -> Result<IntroVae> {
    let mut model = IntroVae::new(config, device)?;
    load(&mut model, path)?;
    Ok(model)
}

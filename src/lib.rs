//! Introspective variational autoencoder (IntroVAE) on top of `tch`.
//!
//! The encoder doubles as the adversary: it is trained to assign a large KL
//! divergence to the codes of reconstructed and prior-sampled images, while the
//! decoder is trained to make those codes look like real ones.
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod imaging;
pub mod latent;
pub mod model;
pub mod network;
pub mod resblock;
pub mod topology;

pub use config::ModelConfig;
pub use error::{Error, Result};
pub use model::{IntroVae, StepLosses};

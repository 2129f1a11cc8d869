use crate::error::{config, Result};

/// Construction parameters of an [`IntroVae`](crate::model::IntroVae).
///
/// Everything here is fixed once the model is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Side length of the square input images, a power of two.
    pub image_size: i64,
    /// Channel count of the encoder stem.
    pub base_channels: i64,
    pub z_dim: i64,
    /// Weight of the adversarial terms.
    pub alpha: f64,
    /// Weight of the reconstruction term.
    pub beta: f64,
    /// KL level above which the encoder stops pushing fakes away.
    pub margin: f64,
    pub lr_encoder: f64,
    pub lr_decoder: f64,
}

pub const MIN_IMAGE_SIZE: i64 = 16;

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: 128,
            base_channels: 32,
            z_dim: 256,
            alpha: 1.,
            beta: 1.,
            margin: 125.,
            lr_encoder: 1e-3,
            lr_decoder: 1e-3,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        let s = self.image_size;
        if s < MIN_IMAGE_SIZE || s & (s - 1) != 0 {
            return Err(config(format!(
                "image size must be a power of two >= {}, got {}",
                MIN_IMAGE_SIZE, s
            )));
        }
        if self.base_channels < 1 {
            return Err(config("base channel count must be positive"));
        }
        if self.z_dim < 1 {
            return Err(config("z_dim must be positive"));
        }
        for (name, v) in [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("margin", self.margin),
            ("encoder learning rate", self.lr_encoder),
            ("decoder learning rate", self.lr_decoder),
        ] {
            if !v.is_finite() || v < 0. {
                return Err(config(format!("{} must be finite and >= 0, got {}", name, v)));
            }
        }
        Ok(())
    }
}

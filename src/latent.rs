use tch::{nn, Device, Kind, Tensor};

/// Source of standard-normal draws for sampling and prior codes.
pub trait Noise {
    fn standard_normal(&self, size: &[i64], device: Device) -> Tensor;

    fn standard_normal_like(&self, like: &Tensor) -> Tensor {
        self.standard_normal(&like.size(), like.device())
    }
}

/// Fresh draws from the torch generator on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gaussian;

impl Noise for Gaussian {
    fn standard_normal(&self, size: &[i64], device: Device) -> Tensor {
        Tensor::randn(size, (Kind::Float, device))
    }
}

/// Always zero: sampling collapses onto the mean.
#[derive(Debug, Default, Clone, Copy)]
pub struct Zero;

impl Noise for Zero {
    fn standard_normal(&self, size: &[i64], device: Device) -> Tensor {
        Tensor::zeros(size, (Kind::Float, device))
    }
}

/// A reparameterized sample and the Gaussian it came from.
#[derive(Debug)]
pub struct Latent {
    pub z: Tensor,
    pub mu: Tensor,
    pub log_sigma2: Tensor,
}

impl Latent {
    pub fn kl(&self) -> Tensor {
        kl_divergence(&self.mu, &self.log_sigma2)
    }
}

/// Mean and log-variance projections from encoder features to the latent space.
#[derive(Debug)]
pub struct LatentHead {
    mu: nn::Linear,
    log_sigma2: nn::Linear,
}

impl LatentHead {
    pub fn new(p: &nn::Path, h_dim: i64, z_dim: i64) -> LatentHead {
        LatentHead {
            mu: nn::linear(p / "mu_net", h_dim, z_dim, Default::default()),
            log_sigma2: nn::linear(p / "log_sigma2_net", h_dim, z_dim, Default::default()),
        }
    }

    pub fn mean(&self, features: &Tensor) -> Tensor {
        features.apply(&self.mu)
    }

    /// `z = mu + exp(log_sigma2 / 2) * eps`.
    pub fn reparameterize(&self, features: &Tensor, noise: &dyn Noise) -> Latent {
        let mu = features.apply(&self.mu);
        let log_sigma2 = features.apply(&self.log_sigma2);
        let eps = noise.standard_normal_like(&log_sigma2);
        let z = &mu + (&log_sigma2 / 2.).exp() * eps;
        Latent { z, mu, log_sigma2 }
    }
}

/// KL(N(mu, sigma^2) || N(0, I)), summed over latent and batch dimensions.
pub fn kl_divergence(mu: &Tensor, log_sigma2: &Tensor) -> Tensor {
    let kl = (log_sigma2.exp() + mu * mu - log_sigma2 - 1.) * 0.5;
    kl.sum(Kind::Float)
}

pub fn mse_loss(x: &Tensor, y: &Tensor) -> Tensor {
    let diff = x - y;
    (&diff * &diff).mean(Kind::Float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn cpu() -> (Kind, Device) {
        (Kind::Float, Device::Cpu)
    }

    #[test]
    fn kl_of_standard_normal_is_zero() {
        let zeros = Tensor::zeros(&[4, 8], cpu());
        assert_abs_diff_eq!(kl_divergence(&zeros, &zeros).double_value(&[]), 0.);
    }

    #[test]
    fn kl_is_summed_not_averaged() {
        let mu = Tensor::ones(&[2, 3], cpu());
        let log_sigma2 = Tensor::zeros(&[2, 3], cpu());
        // 0.5 * mu^2 per element
        assert_abs_diff_eq!(
            kl_divergence(&mu, &log_sigma2).double_value(&[]),
            3.,
            epsilon = 1e-6
        );
    }

    #[test]
    fn kl_is_non_negative() {
        tch::manual_seed(7);
        for _ in 0..16 {
            let mu = Tensor::randn(&[5, 6], cpu()) * 3.;
            let log_sigma2 = Tensor::randn(&[5, 6], cpu()) * 2.;
            assert!(kl_divergence(&mu, &log_sigma2).double_value(&[]) >= 0.);
        }
    }

    #[test]
    fn kl_penalises_variance_both_ways() {
        let mu = Tensor::zeros(&[1, 1], cpu());
        let wide = kl_divergence(&mu, &Tensor::full(&[1, 1], 2., cpu()));
        let narrow = kl_divergence(&mu, &Tensor::full(&[1, 1], -2., cpu()));
        assert!(wide.double_value(&[]) > 0.);
        assert!(narrow.double_value(&[]) > 0.);
    }

    #[test]
    fn zero_noise_samples_the_mean() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = LatentHead::new(&vs.root(), 12, 4);
        let h = Tensor::randn(&[3, 12], cpu());
        let latent = head.reparameterize(&h, &Zero);
        assert_eq!(latent.z.size(), [3, 4]);
        let diff = (&latent.z - &latent.mu).abs().max().double_value(&[]);
        assert_abs_diff_eq!(diff, 0.);
        assert_abs_diff_eq!(
            (&latent.mu - head.mean(&h)).abs().max().double_value(&[]),
            0.
        );
    }

    #[test]
    fn gaussian_noise_perturbs_samples() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let head = LatentHead::new(&vs.root(), 12, 4);
        let h = Tensor::randn(&[3, 12], cpu());
        let a = head.reparameterize(&h, &Gaussian);
        let b = head.reparameterize(&h, &Gaussian);
        assert!((&a.z - &b.z).abs().max().double_value(&[]) > 0.);
    }

    #[test]
    fn mse_matches_hand_computation() {
        let x = Tensor::of_slice(&[0f32, 1., 2., 3.]);
        let y = Tensor::of_slice(&[1f32, 1., 0., 3.]);
        assert_abs_diff_eq!(mse_loss(&x, &y).double_value(&[]), 1.25, epsilon = 1e-6);
    }
}

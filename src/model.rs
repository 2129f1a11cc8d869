//! The introspective VAE and its two-phase adversarial training step.
//!
//! Encoder (plus latent head) and decoder live in separate var stores, each with
//! its own Adam optimizer, so the two parameter groups can never share a step.
//! Within a step the group that is not being updated is frozen, and every
//! tensor handed across the phase boundary is detached.
use crate::config::ModelConfig;
use crate::error::{Error, Phase, Result};
use crate::latent::{mse_loss, Gaussian, Latent, LatentHead, Noise};
use crate::network::Network;
use crate::topology::{self, Shape, StageReport};
use std::collections::BTreeMap;
use std::fmt;
use tch::{nn, nn::OptimizerConfig as _, Device, Tensor};
use tracing::debug;

/// Scalar values observed during one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    pub encoder_loss: f64,
    pub decoder_loss: f64,
    /// Reconstruction MSE.
    pub loss_ae: f64,
    /// KL of the real images' posteriors.
    pub reg_ae: f64,
    /// Margin hinge on the detached fakes.
    pub loss_adv: f64,
    pub regr_ng: f64,
    pub regpp_ng: f64,
    pub regr: f64,
    pub regpp: f64,
}

impl fmt::Display for StepLosses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enc {:.3} dec {:.3} ae {:.4} kl {:.3} adv {:.3}",
            self.encoder_loss, self.decoder_loss, self.loss_ae, self.reg_ae, self.loss_adv
        )
    }
}

/// Output of the encoder update, consumed by the decoder update.
#[derive(Debug)]
pub struct EncoderStep {
    /// Posterior sample of the batch, detached from the encoder.
    pub z: Tensor,
    /// Prior sample decoded into the fake batch.
    pub zp: Tensor,
    pub encoder_loss: f64,
    pub loss_ae: f64,
    pub reg_ae: f64,
    pub loss_adv: f64,
    pub regr_ng: f64,
    pub regpp_ng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderStep {
    pub decoder_loss: f64,
    pub regr: f64,
    pub regpp: f64,
}

pub struct IntroVae {
    config: ModelConfig,
    h_dim: i64,
    encoder_vs: nn::VarStore,
    decoder_vs: nn::VarStore,
    encoder: Network,
    head: LatentHead,
    decoder: Network,
    opt_encoder: nn::Optimizer,
    opt_decoder: nn::Optimizer,
    noise: Box<dyn Noise>,
}

impl IntroVae {
    pub fn new(config: ModelConfig, device: Device) -> Result<IntroVae> {
        config.validate()?;
        let encoder_plan = topology::encoder_plan(config.image_size, config.base_channels)?;
        let decoder_plan = topology::decoder_plan(config.image_size, config.z_dim)?;
        let h_dim = match encoder_plan.output() {
            Shape::Flat(h_dim) => h_dim,
            shape => {
                return Err(Error::Config(format!(
                    "encoder must end in a flat feature vector, got {}",
                    shape
                )))
            }
        };

        let encoder_vs = nn::VarStore::new(device);
        let encoder = Network::build(&(&encoder_vs.root() / "encoder"), encoder_plan);
        let head = LatentHead::new(&encoder_vs.root(), h_dim, config.z_dim);
        let decoder_vs = nn::VarStore::new(device);
        let decoder = Network::build(&(&decoder_vs.root() / "decoder"), decoder_plan);

        let opt_encoder = nn::Adam::default().build(&encoder_vs, config.lr_encoder)?;
        let opt_decoder = nn::Adam::default().build(&decoder_vs, config.lr_decoder)?;

        for stage in encoder.plan().report() {
            debug!(network = "encoder", "{}", stage);
        }
        for stage in decoder.plan().report() {
            debug!(network = "decoder", "{}", stage);
        }
        debug!(h_dim, z_dim = config.z_dim, "built introvae");

        Ok(IntroVae {
            config,
            h_dim,
            encoder_vs,
            decoder_vs,
            encoder,
            head,
            decoder,
            opt_encoder,
            opt_decoder,
            noise: Box::new(Gaussian),
        })
    }

    /// Replaces the source of sampling and prior noise.
    pub fn with_noise(mut self, noise: impl Noise + 'static) -> Self {
        self.noise = Box::new(noise);
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn h_dim(&self) -> i64 {
        self.h_dim
    }

    pub fn device(&self) -> Device {
        self.encoder_vs.device()
    }

    pub fn encoder_report(&self) -> Vec<StageReport> {
        self.encoder.plan().report()
    }

    pub fn decoder_report(&self) -> Vec<StageReport> {
        self.decoder.plan().report()
    }

    /// Every learned parameter, keyed by its checkpoint name.
    pub fn named_variables(&self) -> BTreeMap<String, Tensor> {
        self.encoder_vs
            .variables()
            .into_iter()
            .chain(self.decoder_vs.variables())
            .collect()
    }

    pub fn encoder_variables(&self) -> BTreeMap<String, Tensor> {
        self.encoder_vs.variables().into_iter().collect()
    }

    pub fn decoder_variables(&self) -> BTreeMap<String, Tensor> {
        self.decoder_vs.variables().into_iter().collect()
    }

    pub fn encode(&self, xs: &Tensor) -> Result<Latent> {
        let features = self.encoder.forward(xs)?;
        Ok(self.head.reparameterize(&features, self.noise.as_ref()))
    }

    fn kl_of(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.encode(xs)?.kl())
    }

    /// Posterior means, without gradient tracking.
    pub fn encode_mean(&self, xs: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| Ok(self.head.mean(&self.encoder.forward(xs)?)))
    }

    pub fn decode(&self, zs: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| self.decoder.forward(zs))
    }

    pub fn reconstruct(&self, xs: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| self.decoder.forward(&self.encode(xs)?.z))
    }

    /// Decodes `n` draws from the prior.
    pub fn sample(&self, n: i64) -> Result<Tensor> {
        let zs = self.noise.standard_normal(&[n, self.config.z_dim], self.device());
        self.decode(&zs)
    }

    /// Runs the encoder update followed by the decoder update on one batch.
    pub fn train_step(&mut self, xs: &Tensor) -> Result<StepLosses> {
        let enc = self.encoder_phase(xs)?;
        let dec = self.decoder_phase(xs, &enc)?;
        let losses = StepLosses {
            encoder_loss: enc.encoder_loss,
            decoder_loss: dec.decoder_loss,
            loss_ae: enc.loss_ae,
            reg_ae: enc.reg_ae,
            loss_adv: enc.loss_adv,
            regr_ng: enc.regr_ng,
            regpp_ng: enc.regpp_ng,
            regr: dec.regr,
            regpp: dec.regpp,
        };
        debug!(?losses, "train step");
        Ok(losses)
    }

    /// Updates the encoder and latent head; the decoder is frozen throughout.
    pub fn encoder_phase(&mut self, xs: &Tensor) -> Result<EncoderStep> {
        self.decoder_vs.freeze();
        let outcome = self.update_encoder(xs);
        self.decoder_vs.unfreeze();
        outcome
    }

    /// Updates the decoder from the codes of `step`; the encoder is frozen
    /// throughout.
    pub fn decoder_phase(&mut self, xs: &Tensor, step: &EncoderStep) -> Result<DecoderStep> {
        self.encoder_vs.freeze();
        let outcome = self.update_decoder(xs, step);
        self.encoder_vs.unfreeze();
        outcome
    }

    fn update_encoder(&mut self, xs: &Tensor) -> Result<EncoderStep> {
        let latent = self.encode(xs)?;
        let xr = self.decoder.forward(&latent.z)?;
        let zp = self.noise.standard_normal_like(&latent.z);
        let xp = self.decoder.forward(&zp)?;
        let loss_ae = mse_loss(&xr, xs);

        // The encoder judges the fakes, but that judgement must not reach the decoder.
        let regr_ng = self.kl_of(&xr.detach())?;
        let regpp_ng = self.kl_of(&xp.detach())?;

        let reg_ae = latent.kl();
        let margin = self.config.margin;
        let loss_adv =
            (regr_ng.neg() + margin).clamp_min(0.) + (regpp_ng.neg() + margin).clamp_min(0.);
        let encoder_loss =
            &reg_ae + &loss_adv * self.config.alpha + &loss_ae * self.config.beta;

        let value = finite(Phase::Encoder, &encoder_loss)?;
        self.opt_encoder.backward_step(&encoder_loss);

        Ok(EncoderStep {
            z: latent.z.detach(),
            zp,
            encoder_loss: value,
            loss_ae: loss_ae.double_value(&[]),
            reg_ae: reg_ae.double_value(&[]),
            loss_adv: loss_adv.double_value(&[]),
            regr_ng: regr_ng.double_value(&[]),
            regpp_ng: regpp_ng.double_value(&[]),
        })
    }

    // The decoder graph is rebuilt from the detached codes instead of being
    // retained from the encoder update; the decoder has not moved since, so
    // the reconstruction term is unchanged.
    fn update_decoder(&mut self, xs: &Tensor, step: &EncoderStep) -> Result<DecoderStep> {
        let xr = self.decoder.forward(&step.z)?;
        let xp = self.decoder.forward(&step.zp)?;
        let loss_ae = mse_loss(&xr, xs);

        let regr = self.kl_of(&xr)?;
        let regpp = self.kl_of(&xp)?;
        let decoder_loss = (&regr + &regpp) * self.config.alpha + loss_ae * self.config.beta;

        let value = finite(Phase::Decoder, &decoder_loss)?;
        self.opt_decoder.backward_step(&decoder_loss);

        Ok(DecoderStep {
            decoder_loss: value,
            regr: regr.double_value(&[]),
            regpp: regpp.double_value(&[]),
        })
    }
}

fn finite(phase: Phase, loss: &Tensor) -> Result<f64> {
    let value = loss.double_value(&[]);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::NonFinite { phase, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::Zero;
    use tch::Kind;

    fn small() -> ModelConfig {
        ModelConfig {
            image_size: 32,
            base_channels: 8,
            z_dim: 16,
            ..Default::default()
        }
    }

    fn images(batch: i64) -> Tensor {
        Tensor::rand(&[batch, 3, 32, 32], (Kind::Float, Device::Cpu))
    }

    fn snapshot(vars: BTreeMap<String, Tensor>) -> BTreeMap<String, Tensor> {
        vars.into_iter().map(|(k, v)| (k, v.copy())).collect()
    }

    fn max_change(
        before: &BTreeMap<String, Tensor>,
        after: &BTreeMap<String, Tensor>,
    ) -> Vec<(String, f64)> {
        before
            .iter()
            .map(|(name, t)| {
                let diff = (&after[name] - t).abs().max().double_value(&[]);
                (name.clone(), diff)
            })
            .collect()
    }

    #[test]
    fn shapes_round_trip() {
        tch::manual_seed(0);
        let vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let xs = images(2);
        let latent = vae.encode(&xs).unwrap();
        assert_eq!(latent.mu.size(), [2, 16]);
        assert_eq!(latent.log_sigma2.size(), [2, 16]);
        assert_eq!(vae.decode(&latent.z).unwrap().size(), xs.size());
        assert_eq!(vae.h_dim(), 64 * 2 * 2);
        assert_eq!(vae.sample(5).unwrap().size(), [5, 3, 32, 32]);
    }

    #[test]
    fn parameter_groups_are_disjoint() {
        let vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let enc = vae.encoder_variables();
        let dec = vae.decoder_variables();
        assert!(enc.keys().all(|k| !dec.contains_key(k)));
        assert!(enc.contains_key("mu_net.weight"));
        assert!(enc.contains_key("log_sigma2_net.bias"));
        assert!(dec.keys().all(|k| k.starts_with("decoder.")));
        assert_eq!(vae.named_variables().len(), enc.len() + dec.len());
    }

    #[test]
    fn one_step_updates_every_parameter() {
        tch::manual_seed(42);
        let mut vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let before = snapshot(vae.named_variables());
        let losses = vae.train_step(&images(4)).unwrap();

        for v in [losses.encoder_loss, losses.decoder_loss, losses.loss_ae] {
            assert!(v.is_finite() && v >= 0., "{:?}", losses);
        }
        for (name, diff) in max_change(&before, &vae.named_variables()) {
            assert!(diff > 0., "{} did not move", name);
        }
    }

    #[test]
    fn encoder_loss_combines_terms() {
        tch::manual_seed(3);
        let cfg = ModelConfig {
            alpha: 0.5,
            beta: 2.,
            ..small()
        };
        let mut vae = IntroVae::new(cfg, Device::Cpu).unwrap();
        let step = vae.encoder_phase(&images(2)).unwrap();
        let expected = step.reg_ae + 0.5 * step.loss_adv + 2. * step.loss_ae;
        assert!((step.encoder_loss - expected).abs() <= 1e-3 * expected.abs().max(1.));
        let hinge = (125. - step.regr_ng).max(0.) + (125. - step.regpp_ng).max(0.);
        assert!((step.loss_adv - hinge).abs() <= 1e-3 * hinge.max(1.));
    }

    #[test]
    fn low_margin_silences_the_adversary() {
        tch::manual_seed(5);
        let cfg = ModelConfig {
            margin: 0.,
            ..small()
        };
        let mut vae = IntroVae::new(cfg, Device::Cpu).unwrap();
        let losses = vae.train_step(&images(4)).unwrap();
        assert_eq!(losses.loss_adv, 0.);
        assert!(losses.encoder_loss.is_finite());
    }

    #[test]
    fn encoder_phase_leaves_decoder_alone() {
        tch::manual_seed(11);
        let mut vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let before = snapshot(vae.decoder_variables());
        vae.encoder_phase(&images(4)).unwrap();

        for (name, var) in vae.decoder_variables() {
            let grad = var.grad();
            assert!(
                !grad.defined() || grad.abs().max().double_value(&[]) == 0.,
                "{} received a gradient from the encoder update",
                name
            );
            assert!(var.requires_grad(), "{} left frozen", name);
        }
        for (name, diff) in max_change(&before, &vae.decoder_variables()) {
            assert_eq!(diff, 0., "{} moved", name);
        }
    }

    #[test]
    fn decoder_phase_leaves_encoder_alone() {
        tch::manual_seed(12);
        let mut vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let xs = images(4);
        let step = vae.encoder_phase(&xs).unwrap();
        let encoder = snapshot(vae.encoder_variables());
        let decoder = snapshot(vae.decoder_variables());
        vae.decoder_phase(&xs, &step).unwrap();

        for (name, diff) in max_change(&encoder, &vae.encoder_variables()) {
            assert_eq!(diff, 0., "{} moved during the decoder update", name);
        }
        assert!(max_change(&decoder, &vae.decoder_variables())
            .iter()
            .any(|(_, diff)| *diff > 0.));
        assert!(vae.encoder_variables().values().all(|v| v.requires_grad()));
    }

    fn grads(vars: BTreeMap<String, Tensor>) -> BTreeMap<String, Tensor> {
        vars.into_iter().map(|(k, v)| (k, v.grad().copy())).collect()
    }

    fn assert_same_grads(expected: &BTreeMap<String, Tensor>, actual: &BTreeMap<String, Tensor>) {
        assert_eq!(expected.len(), actual.len());
        for (name, want) in expected {
            let scale = want.abs().max().double_value(&[]) + 1.;
            let diff = (&actual[name] - want).abs().max().double_value(&[]);
            assert!(diff <= 1e-4 * scale, "{} gradient differs by {}", name, diff);
        }
    }

    #[test]
    fn encoder_judges_fakes_as_constants() {
        let cfg = ModelConfig {
            beta: 0.,
            margin: 1e4,
            ..small()
        };
        let xs = images(3);
        tch::manual_seed(21);
        let mut vae = IntroVae::new(cfg.clone(), Device::Cpu).unwrap().with_noise(Zero);
        tch::manual_seed(21);
        let reference = IntroVae::new(cfg, Device::Cpu).unwrap().with_noise(Zero);

        let latent = reference.encode(&xs).unwrap();
        let xr = reference.decode(&latent.z).unwrap();
        let xp = reference.decode(&latent.z.zeros_like()).unwrap();
        assert!(!xr.requires_grad() && !xp.requires_grad());
        let margin = reference.config.margin;
        let adv = (reference.kl_of(&xr).unwrap().neg() + margin).clamp_min(0.)
            + (reference.kl_of(&xp).unwrap().neg() + margin).clamp_min(0.);
        let loss = latent.kl() + adv * reference.config.alpha;
        loss.backward();
        let expected = grads(reference.encoder_variables());

        vae.encoder_phase(&xs).unwrap();
        assert_same_grads(&expected, &grads(vae.encoder_variables()));
    }

    #[test]
    fn decoder_learns_through_the_encoder() {
        let cfg = ModelConfig {
            alpha: 1.,
            beta: 0.,
            ..small()
        };
        let xs = images(3);
        let step = EncoderStep {
            z: Tensor::randn(&[3, 16], (Kind::Float, Device::Cpu)),
            zp: Tensor::randn(&[3, 16], (Kind::Float, Device::Cpu)),
            encoder_loss: 0.,
            loss_ae: 0.,
            reg_ae: 0.,
            loss_adv: 0.,
            regr_ng: 0.,
            regpp_ng: 0.,
        };
        tch::manual_seed(22);
        let mut vae = IntroVae::new(cfg.clone(), Device::Cpu).unwrap().with_noise(Zero);
        tch::manual_seed(22);
        let mut reference = IntroVae::new(cfg, Device::Cpu).unwrap().with_noise(Zero);

        reference.encoder_vs.freeze();
        let xr = reference.decoder.forward(&step.z).unwrap();
        let xp = reference.decoder.forward(&step.zp).unwrap();
        // judged as constants, the fakes carry nothing back to the decoder
        let cut = reference.kl_of(&xr.detach()).unwrap() + reference.kl_of(&xp.detach()).unwrap();
        assert!(!cut.requires_grad());
        let loss = reference.kl_of(&xr).unwrap() + reference.kl_of(&xp).unwrap();
        loss.backward();
        let expected = grads(reference.decoder_variables());
        assert!(expected.values().any(|g| g.abs().max().double_value(&[]) > 0.));

        let before = snapshot(vae.decoder_variables());
        vae.decoder_phase(&xs, &step).unwrap();
        assert_same_grads(&expected, &grads(vae.decoder_variables()));
        assert!(max_change(&before, &vae.decoder_variables())
            .iter()
            .any(|(_, diff)| *diff > 0.));
    }

    #[test]
    fn step_codes_are_detached() {
        tch::manual_seed(13);
        let mut vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let step = vae.encoder_phase(&images(2)).unwrap();
        assert!(!step.z.requires_grad());
        assert!(!step.zp.requires_grad());
        assert_eq!(step.zp.size(), step.z.size());
    }

    #[test]
    fn zero_noise_is_deterministic() {
        tch::manual_seed(0);
        let vae = IntroVae::new(small(), Device::Cpu).unwrap().with_noise(Zero);
        let xs = images(2);
        let a = vae.reconstruct(&xs).unwrap();
        let b = vae.reconstruct(&xs).unwrap();
        assert_eq!((a - b).abs().max().double_value(&[]), 0.);
        let mu = vae.encode_mean(&xs).unwrap();
        let z = vae.encode(&xs).unwrap().z;
        assert!((mu - z).abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn non_finite_input_fails_the_step() {
        tch::manual_seed(0);
        let mut vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let before = snapshot(vae.named_variables());
        let xs = Tensor::full(&[2, 3, 32, 32], f64::NAN, (Kind::Float, Device::Cpu));
        match vae.train_step(&xs) {
            Err(Error::NonFinite { phase, value }) => {
                assert_eq!(phase, Phase::Encoder);
                assert!(value.is_nan());
            }
            other => panic!("expected a non-finite error, got {:?}", other),
        }
        for (name, diff) in max_change(&before, &vae.named_variables()) {
            assert_eq!(diff, 0., "{} moved on a failed step", name);
        }
        assert!(vae.decoder_variables().values().all(|v| v.requires_grad()));
    }

    #[test]
    fn mis_shaped_batch_is_rejected() {
        let mut vae = IntroVae::new(small(), Device::Cpu).unwrap();
        let xs = Tensor::rand(&[2, 1, 32, 32], (Kind::Float, Device::Cpu));
        assert!(matches!(
            vae.train_step(&xs),
            Err(Error::Shape { ref layer, .. }) if layer == "stem"
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = ModelConfig {
            image_size: 24,
            ..small()
        };
        assert!(matches!(IntroVae::new(cfg, Device::Cpu), Err(Error::Config(_))));
    }
}

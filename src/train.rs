// IntroVAE: Introspective Variational Autoencoders for Photographic Image Synthesis.
// https://arxiv.org/abs/1807.06358
use introvae::{checkpoint, imaging, IntroVae, ModelConfig};
use std::{error::Error, fs::create_dir_all, path::PathBuf};
use tch::{Device, Kind, Tensor};
use tracing::{error, info};

pub struct TrainOptions {
    pub batch_size: i64,
    pub iterations: u64,
    pub sample_every: u64,
}

pub fn train(
    dataset: PathBuf,
    model: PathBuf,
    demo: PathBuf,
    config: ModelConfig,
    opts: TrainOptions,
) -> Result<(), Box<dyn Error>> {
    let device = Device::cuda_if_available();
    let image_size = config.image_size;
    let images =
        tch::vision::image::load_dir(&dataset, image_size, image_size)?.to_device(device);
    info!(?dataset, shape = ?images.size(), "loaded dataset");
    let train_size = images.size()[0];
    if !demo.is_dir() {
        create_dir_all(&demo)?;
    }

    let random_batch_images = || {
        let index = Tensor::randint(train_size, &[opts.batch_size], (Kind::Int64, device));
        imaging::normalize(&images.index_select(0, &index))
    };

    let mut vae = IntroVae::new(config, device)?;
    for stage in vae.encoder_report() {
        info!(network = "encoder", "{}", stage);
    }
    for stage in vae.decoder_report() {
        info!(network = "decoder", "{}", stage);
    }

    let pb = indicatif::ProgressBar::new(opts.iterations);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}"),
    );
    let demo_images = random_batch_images();
    for index in 0..opts.iterations {
        pb.set_position(index);
        let losses = match vae.train_step(&random_batch_images()) {
            Ok(losses) => losses,
            Err(e) => {
                pb.abandon();
                error!(step = index, "{}", e);
                return Err(e.into());
            }
        };
        pb.set_message(losses.to_string());

        if opts.sample_every > 0 && index % opts.sample_every == 0 {
            let recon = vae.reconstruct(&demo_images)?;
            let fake = vae.sample(opts.batch_size)?;
            let imgs = Tensor::cat(&[&demo_images, &recon, &fake], 0).to_device(Device::Cpu);
            let grid = imaging::image_grid(&imgs, opts.batch_size)?;
            tch::vision::image::save(&grid, demo.join(format!("demo_{}.png", index)))?;
            checkpoint::save(&vae, model.join(format!("introvae_{}.ot", index)))?;
            info!(step = index, %losses);
        }
    }
    pb.finish();
    Ok(())
}

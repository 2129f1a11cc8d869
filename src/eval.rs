use introvae::{checkpoint, imaging, ModelConfig};
use std::{error::Error, path::PathBuf};
use tch::Device;
use tracing::info;

pub fn eval(
    checkpoint_path: PathBuf,
    inputs: Vec<PathBuf>,
    output: PathBuf,
    config: ModelConfig,
    n_interp: i64,
) -> Result<(), Box<dyn Error>> {
    let device = Device::cuda_if_available();
    let image_size = config.image_size;
    let vae = checkpoint::restore(config, &checkpoint_path, device)?;
    info!(path = ?checkpoint_path, "loaded checkpoint");

    let x = imaging::load_images(&inputs, image_size)?.to_device(device);
    let mu = vae.encode_mean(&x)?;
    let z = imaging::interpolate(&mu, n_interp)?;
    let xr = vae.decode(&z)?;
    let strip =
        imaging::interpolation_strip(&x.to_device(Device::Cpu), &xr.to_device(Device::Cpu))?;
    tch::vision::image::save(&strip, &output)?;
    info!(path = ?output, "wrote interpolation strip");
    Ok(())
}

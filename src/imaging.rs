use crate::error::{config, Result};
use std::path::Path;
use tch::{vision::image, Kind, Tensor};

/// Byte images to floats in `[0, 1]`.
pub fn normalize(imgs: &Tensor) -> Tensor {
    imgs.to_kind(Kind::Float) / 255.
}

/// Loads, resizes and normalizes each file into a `[n, 3, size, size]` batch.
pub fn load_images<P: AsRef<Path>>(paths: &[P], size: i64) -> Result<Tensor> {
    if paths.is_empty() {
        return Err(config("no input images"));
    }
    let imgs = paths
        .iter()
        .map(|p| -> Result<Tensor> {
            let img = image::load_and_resize(p, size, size)?;
            Ok(if img.size()[0] == 1 {
                img.expand(&[3, size, size], false)
            } else {
                img
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(normalize(&Tensor::stack(&imgs, 0)))
}

/// Resamples `[b, z]` codes to `n` evenly spaced points along the batch axis.
///
/// Piecewise linear through every input code; the first and last points are
/// the first and last inputs.
pub fn interpolate(mu: &Tensor, n: i64) -> Result<Tensor> {
    if mu.dim() != 2 || mu.size()[0] < 1 {
        return Err(config(format!(
            "expected [batch, z_dim] codes, got {:?}",
            mu.size()
        )));
    }
    if n < 1 {
        return Err(config("interpolation needs at least one point"));
    }
    Ok(mu
        .transpose(0, 1)
        .unsqueeze(0)
        .upsample_linear1d(&[n], true, None)
        .squeeze_dim(0)
        .transpose(0, 1)
        .contiguous())
}

/// Appends zero images until the batch holds `len` entries.
pub fn pad_batch(imgs: &Tensor, len: i64) -> Tensor {
    let mut size = imgs.size();
    if size[0] >= len {
        return imgs.shallow_clone();
    }
    size[0] = len - size[0];
    let zeros = Tensor::zeros(&size, (imgs.kind(), imgs.device()));
    Tensor::cat(&[imgs, &zeros], 0)
}

/// Tiles `[n, 3, S, S]` floats in `[0, 1]` into a `[3, rows * S, ncol * S]` byte image.
pub fn image_grid(imgs: &Tensor, ncol: i64) -> Result<Tensor> {
    let n = imgs.size()[0];
    if ncol < 1 || n % ncol != 0 {
        return Err(config(format!("cannot tile {} images in rows of {}", n, ncol)));
    }
    let imgs = (imgs * 255.).clamp(0., 255.).to_kind(Kind::Uint8);
    let rows = (0..n / ncol)
        .map(|i| {
            Tensor::cat(
                &(0..ncol)
                    .map(|j| imgs.narrow(0, ncol * i + j, 1))
                    .collect::<Vec<_>>(),
                3,
            )
        })
        .collect::<Vec<_>>();
    Ok(Tensor::cat(&rows, 2).squeeze_dim(0))
}

/// Inputs on the first row, decodings on the second, both padded to equal length.
pub fn interpolation_strip(inputs: &Tensor, decoded: &Tensor) -> Result<Tensor> {
    let len = inputs.size()[0].max(decoded.size()[0]);
    let both = Tensor::cat(&[pad_batch(inputs, len), pad_batch(decoded, len)], 0);
    image_grid(&both, len)
}

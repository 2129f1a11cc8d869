use tch::{nn, Tensor};

pub(crate) fn conv2d(p: nn::Path, c_in: i64, c_out: i64, ksize: i64) -> nn::Conv2D {
    let cfg = nn::ConvConfig {
        padding: ksize / 2,
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, ksize, cfg)
}

/// `relu(conv2(relu(conv1(x)))) + skip(x)`, spatial size preserved.
///
/// The skip path is the identity when the channel count is unchanged and a
/// 1x1 projection otherwise.
#[derive(Debug)]
pub struct ResBlock {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    skip: Option<nn::Conv2D>,
}

impl ResBlock {
    pub fn new(p: &nn::Path, kernels: [i64; 2], channels: [i64; 3]) -> ResBlock {
        let [c_in, c_mid, c_out] = channels;
        let skip = if c_in != c_out {
            Some(conv2d(p / "skip", c_in, c_out, 1))
        } else {
            None
        };
        ResBlock {
            conv1: conv2d(p / "conv1", c_in, c_mid, kernels[0]),
            conv2: conv2d(p / "conv2", c_mid, c_out, kernels[1]),
            skip,
        }
    }
}

impl nn::Module for ResBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let ys = xs.apply(&self.conv1).relu().apply(&self.conv2).relu();
        match &self.skip {
            Some(skip) => ys + xs.apply(skip),
            None => ys + xs,
        }
    }
}

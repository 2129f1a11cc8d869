//! Size-driven layer schedules for the encoder and decoder.
//!
//! Both networks are described as a [`Plan`]: an ordered list of named stages,
//! each a short run of [`Layer`] specs with known input and output shapes. The
//! plan is computed before any tensor exists, so `h_dim` and every intermediate
//! shape can be inspected (and logged) without a dry run.
use crate::error::{config, Result};
use std::fmt;

/// Encoder channel counts stop doubling here.
pub const MAX_ENCODER_CHANNELS: i64 = 512;
/// Decoder channel counts stop halving below twice this value.
pub const MIN_DECODER_CHANNELS: i64 = 16;
/// Spatial side length where the encoder stops shrinking and the decoder starts.
pub const SPATIAL_FLOOR: i64 = 4;
/// Doublings the decoder may spend while also narrowing channels.
pub const NARROWING_DOUBLINGS: i64 = 6;
pub const RES_KERNELS: [i64; 2] = [3, 3];
pub const RGB_KERNEL: i64 = 5;

/// Per-sample tensor shape, batch dimension excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Map { channels: i64, size: i64 },
    Flat(i64),
}

impl Shape {
    pub fn dims(&self) -> Vec<i64> {
        match *self {
            Shape::Map { channels, size } => vec![channels, size, size],
            Shape::Flat(d) => vec![d],
        }
    }

    pub fn with_batch(&self, batch: i64) -> Vec<i64> {
        let mut dims = vec![batch];
        dims.extend(self.dims());
        dims
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Stride 1, `kernel / 2` padding.
    Conv { c_in: i64, c_out: i64, kernel: i64 },
    Res { c_in: i64, c_mid: i64, c_out: i64 },
    Linear { d_in: i64, d_out: i64 },
    /// 2x2 average pooling.
    AvgPool,
    /// 2x nearest-neighbour upsampling.
    Upsample,
    Relu,
    Sigmoid,
    Reshape { channels: i64, size: i64 },
    Flatten,
}

impl Layer {
    pub(crate) fn output(&self, input: Shape) -> Shape {
        match (*self, input) {
            (Layer::Conv { c_out, .. }, Shape::Map { size, .. })
            | (Layer::Res { c_out, .. }, Shape::Map { size, .. }) => Shape::Map {
                channels: c_out,
                size,
            },
            (Layer::Linear { d_out, .. }, Shape::Flat(_)) => Shape::Flat(d_out),
            (Layer::AvgPool, Shape::Map { channels, size }) => Shape::Map {
                channels,
                size: size / 2,
            },
            (Layer::Upsample, Shape::Map { channels, size }) => Shape::Map {
                channels,
                size: size * 2,
            },
            (Layer::Relu, s) | (Layer::Sigmoid, s) => s,
            (Layer::Reshape { channels, size }, Shape::Flat(_)) => Shape::Map { channels, size },
            (Layer::Flatten, Shape::Map { channels, size }) => Shape::Flat(channels * size * size),
            (layer, input) => unreachable!("{:?} cannot follow {}", layer, input),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub input: Shape,
    pub output: Shape,
    pub layers: Vec<Layer>,
}

/// Stage name and output shape, for construction logs.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub name: String,
    pub shape: Shape,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.name, self.shape)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub input: Shape,
    pub stages: Vec<Stage>,
}

impl Plan {
    pub fn output(&self) -> Shape {
        self.stages.last().map_or(self.input, |s| s.output)
    }

    pub fn report(&self) -> Vec<StageReport> {
        self.stages
            .iter()
            .map(|s| StageReport {
                name: s.name.clone(),
                shape: s.output,
            })
            .collect()
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.stages.iter().flat_map(|s| s.layers.iter())
    }
}

struct Builder {
    input: Shape,
    current: Shape,
    stages: Vec<Stage>,
}

impl Builder {
    fn new(input: Shape) -> Self {
        Self {
            input,
            current: input,
            stages: Vec::new(),
        }
    }

    fn stage(&mut self, name: impl Into<String>, layers: Vec<Layer>) -> &mut Self {
        let input = self.current;
        let output = layers.iter().fold(input, |s, layer| layer.output(s));
        self.stages.push(Stage {
            name: name.into(),
            input,
            output,
            layers,
        });
        self.current = output;
        self
    }

    fn finish(self) -> Plan {
        Plan {
            input: self.input,
            stages: self.stages,
        }
    }
}

fn res(c_in: i64, c_out: i64) -> Layer {
    Layer::Res {
        c_in,
        c_mid: c_out,
        c_out,
    }
}

fn check_size(image_size: i64) -> Result<()> {
    if image_size < 2 * SPATIAL_FLOOR || image_size & (image_size - 1) != 0 {
        return Err(config(format!(
            "no topology for image size {}: needs a power of two >= {}",
            image_size,
            2 * SPATIAL_FLOOR
        )));
    }
    Ok(())
}

/// `[b, 3, S, S] -> [b, h_dim]`.
///
/// A stem convolution halves the image once, then each residual stage doubles
/// the channels (up to [`MAX_ENCODER_CHANNELS`]) and halves the map until it
/// reaches [`SPATIAL_FLOOR`]. A final residual stage pools once more and
/// flattens.
pub fn encoder_plan(image_size: i64, base_channels: i64) -> Result<Plan> {
    check_size(image_size)?;
    if base_channels < 1 {
        return Err(config("base channel count must be positive"));
    }
    let mut b = Builder::new(Shape::Map {
        channels: 3,
        size: image_size,
    });
    b.stage(
        "stem",
        vec![
            Layer::Conv {
                c_in: 3,
                c_out: base_channels,
                kernel: RGB_KERNEL,
            },
            Layer::Relu,
            Layer::AvgPool,
        ],
    );

    let mut size = image_size / 2;
    let mut current = base_channels;
    let mut next = (base_channels * 2).min(MAX_ENCODER_CHANNELS);
    let mut index = 0;
    while size > SPATIAL_FLOOR {
        b.stage(format!("down{}", index), vec![res(current, next), Layer::AvgPool]);
        size /= 2;
        current = next;
        next = (next * 2).min(MAX_ENCODER_CHANNELS);
        index += 1;
    }
    b.stage("head", vec![res(current, next), Layer::AvgPool, Layer::Flatten]);
    Ok(b.finish())
}

/// `[b, z_dim] -> [b, 3, S, S]`.
///
/// The latent is projected to a `z_dim x 4 x 4` map. When the target needs
/// more than [`NARROWING_DOUBLINGS`] doublings, the surplus is spent first on
/// channel-preserving upsampling stages; the remaining stages each double the
/// map and halve the channels, never below [`MIN_DECODER_CHANNELS`].
pub fn decoder_plan(image_size: i64, z_dim: i64) -> Result<Plan> {
    check_size(image_size)?;
    if z_dim < 1 {
        return Err(config("z_dim must be positive"));
    }
    let mut b = Builder::new(Shape::Flat(z_dim));
    b.stage(
        "project",
        vec![
            Layer::Linear {
                d_in: z_dim,
                d_out: z_dim * SPATIAL_FLOOR * SPATIAL_FLOOR,
            },
            Layer::Relu,
            Layer::Reshape {
                channels: z_dim,
                size: SPATIAL_FLOOR,
            },
            res(z_dim, z_dim),
        ],
    );

    let doublings = (image_size / SPATIAL_FLOOR).trailing_zeros() as i64;
    let mut size = SPATIAL_FLOOR;
    let mut channels = z_dim;
    for index in 0..(doublings - NARROWING_DOUBLINGS).max(0) {
        b.stage(
            format!("widen{}", index),
            vec![Layer::Upsample, res(channels, channels)],
        );
        size *= 2;
    }

    let mut index = 0;
    while size < image_size {
        let next = if channels >= 2 * MIN_DECODER_CHANNELS {
            channels / 2
        } else {
            channels
        };
        b.stage(format!("up{}", index), vec![Layer::Upsample, res(channels, next)]);
        channels = next;
        size *= 2;
        index += 1;
    }

    b.stage(
        "to_rgb",
        vec![
            Layer::Conv {
                c_in: channels,
                c_out: 3,
                kernel: RGB_KERNEL,
            },
            Layer::Sigmoid,
        ],
    );
    Ok(b.finish())
}

use crate::error::{Error, Result};
use crate::resblock::{conv2d, ResBlock};
use crate::topology::{Layer, Plan, Shape, RES_KERNELS};
use tch::{nn, Tensor};

#[derive(Debug)]
enum Block {
    Conv(nn::Conv2D),
    Res(ResBlock),
    Linear(nn::Linear),
    AvgPool,
    Upsample(i64),
    Relu,
    Sigmoid,
    Reshape { channels: i64, size: i64 },
    Flatten,
}

impl Block {
    fn new(p: &nn::Path, layer: Layer, input: Shape) -> Block {
        match layer {
            Layer::Conv {
                c_in,
                c_out,
                kernel,
            } => Block::Conv(conv2d(p / "conv", c_in, c_out, kernel)),
            Layer::Res { c_in, c_mid, c_out } => {
                Block::Res(ResBlock::new(&(p / "res"), RES_KERNELS, [c_in, c_mid, c_out]))
            }
            Layer::Linear { d_in, d_out } => {
                Block::Linear(nn::linear(p / "fc", d_in, d_out, Default::default()))
            }
            Layer::AvgPool => Block::AvgPool,
            Layer::Upsample => match input {
                Shape::Map { size, .. } => Block::Upsample(size * 2),
                Shape::Flat(_) => unreachable!("upsampling a flat input"),
            },
            Layer::Relu => Block::Relu,
            Layer::Sigmoid => Block::Sigmoid,
            Layer::Reshape { channels, size } => Block::Reshape { channels, size },
            Layer::Flatten => Block::Flatten,
        }
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Block::Conv(conv) => xs.apply(conv),
            Block::Res(res) => xs.apply(res),
            Block::Linear(linear) => xs.apply(linear),
            Block::AvgPool => xs.avg_pool2d(&[2, 2], &[2, 2], &[0, 0], false, true, None),
            Block::Upsample(size) => xs.upsample_nearest2d(&[*size, *size], None, None),
            Block::Relu => xs.relu(),
            Block::Sigmoid => xs.sigmoid(),
            Block::Reshape { channels, size } => xs.view([-1, *channels, *size, *size]),
            Block::Flatten => xs.flatten(1, -1),
        }
    }
}

/// A feed-forward stack instantiated from a [`Plan`].
///
/// Parameters live under `<path>.<stage>.<conv|res|fc>`.
#[derive(Debug)]
pub struct Network {
    plan: Plan,
    blocks: Vec<Vec<Block>>,
}

impl Network {
    pub fn build(p: &nn::Path, plan: Plan) -> Network {
        let blocks = plan
            .stages
            .iter()
            .map(|stage| {
                let sp = p / stage.name.as_str();
                let mut shape = stage.input;
                stage
                    .layers
                    .iter()
                    .map(|&layer| {
                        let block = Block::new(&sp, layer, shape);
                        shape = layer.output(shape);
                        block
                    })
                    .collect()
            })
            .collect();
        Network { plan, blocks }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Runs every stage, checking its input shape first.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.shallow_clone();
        for (stage, blocks) in self.plan.stages.iter().zip(&self.blocks) {
            let actual = xs.size();
            let batch = actual.first().copied().unwrap_or(-1);
            let expected = stage.input.with_batch(batch);
            if actual != expected {
                return Err(Error::Shape {
                    layer: stage.name.clone(),
                    expected,
                    actual,
                });
            }
            xs = blocks.iter().fold(xs, |xs, block| block.forward(&xs));
        }
        Ok(xs)
    }
}

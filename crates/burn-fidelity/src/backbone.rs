//! VGG16 feature extractor used by LPIPS.
//!
//! The network is the convolutional part of torchvision's VGG16, cut after `relu5_3`
//! and split into five stages. Each stage is described by an explicit sequence of
//! primitive operations in [VGG16_STAGES]; the module only stores the convolution
//! parameters and replays the sequence at inference time.

use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::MaxPool2dConfig;
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;

/// Number of channels of the activation map returned by each stage.
pub const FEATURE_CHANNELS: [usize; 5] = [64, 128, 256, 512, 512];

/// Smallest input side for which every stage yields a non-empty activation map.
pub const MIN_INPUT_SIZE: usize = 16;

/// A primitive operation of the VGG16 feature pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggOp {
    /// 3x3 convolution with padding 1 and bias.
    Conv {
        /// Input and output channels.
        channels: [usize; 2],
    },
    /// Rectified linear unit.
    Relu,
    /// 2x2 max pooling with stride 2.
    MaxPool,
}

/// A named group of consecutive VGG16 layers ending at one LPIPS tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VggStage {
    /// Name of the activation the stage ends with.
    pub name: &'static str,
    /// Operations applied in order.
    pub ops: &'static [VggOp],
}

const fn conv(c_in: usize, c_out: usize) -> VggOp {
    VggOp::Conv {
        channels: [c_in, c_out],
    }
}

use VggOp::{MaxPool, Relu};

/// The first 30 layers of VGG16 `features`, split into stages of 4/5/7/7/7 layers.
pub const VGG16_STAGES: [VggStage; 5] = [
    VggStage {
        name: "relu1_2",
        ops: &[conv(3, 64), Relu, conv(64, 64), Relu],
    },
    VggStage {
        name: "relu2_2",
        ops: &[MaxPool, conv(64, 128), Relu, conv(128, 128), Relu],
    },
    VggStage {
        name: "relu3_3",
        ops: &[
            MaxPool,
            conv(128, 256),
            Relu,
            conv(256, 256),
            Relu,
            conv(256, 256),
            Relu,
        ],
    },
    VggStage {
        name: "relu4_3",
        ops: &[
            MaxPool,
            conv(256, 512),
            Relu,
            conv(512, 512),
            Relu,
            conv(512, 512),
            Relu,
        ],
    },
    VggStage {
        name: "relu5_3",
        ops: &[
            MaxPool,
            conv(512, 512),
            Relu,
            conv(512, 512),
            Relu,
            conv(512, 512),
            Relu,
        ],
    },
];

/// Key remapping rules from torchvision's VGG16 state dict to [Vgg16Features].
///
/// Convolution `features.<i>` is located by its flat index `i` in [VGG16_STAGES].
/// Classifier parameters have no counterpart and are left unmapped.
pub fn vgg16_key_remaps() -> Vec<(String, String)> {
    let mut remaps = Vec::new();
    let mut index = 0;

    for (stage, layout) in VGG16_STAGES.iter().enumerate() {
        let mut conv = 0;
        for op in layout.ops {
            if let VggOp::Conv { .. } = op {
                remaps.push((
                    format!("features\\.{index}\\.(.*)"),
                    format!("stages.{stage}.convs.{conv}.$1"),
                ));
                conv += 1;
            }
            index += 1;
        }
    }

    remaps
}

/// Convolutions of one [stage](VggStage).
#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> VggBlock<B> {
    fn new(layout: &VggStage, device: &B::Device) -> Self {
        let convs = layout
            .ops
            .iter()
            .filter_map(|op| match op {
                VggOp::Conv { channels } => Some(
                    Conv2dConfig::new(*channels, [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .with_bias(true)
                        .init(device),
                ),
                _ => None,
            })
            .collect();

        Self { convs }
    }

    fn forward(&self, x: Tensor<B, 4>, layout: &VggStage) -> Tensor<B, 4> {
        let mut x = x;
        let mut convs = 0;

        for op in layout.ops {
            x = match op {
                VggOp::Conv { .. } => {
                    let x = self.convs[convs].forward(x);
                    convs += 1;
                    x
                }
                VggOp::Relu => relu(x),
                VggOp::MaxPool => max_pool2d(x),
            };
        }

        x
    }
}

/// VGG16 feature extractor.
///
/// Extracts the activations at the end of each [stage](VGG16_STAGES):
/// - relu1_2: 64 channels, full resolution
/// - relu2_2: 128 channels, 1/2 resolution
/// - relu3_3: 256 channels, 1/4 resolution
/// - relu4_3: 512 channels, 1/8 resolution
/// - relu5_3: 512 channels, 1/16 resolution
#[derive(Module, Debug)]
pub struct Vgg16Features<B: Backend> {
    stages: Vec<VggBlock<B>>,
}

impl<B: Backend> Vgg16Features<B> {
    /// Create a new, randomly initialized, VGG16 feature extractor.
    pub fn new(device: &B::Device) -> Self {
        let stages = VGG16_STAGES
            .iter()
            .map(|layout| VggBlock::new(layout, device))
            .collect();

        Self { stages }
    }

    /// Extract the activation maps of the 5 stages.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, 3, H, W]`
    /// - output: 5 tensors `[batch, C_i, H / 2^i, W / 2^i]` with `C_i` from [FEATURE_CHANNELS]
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut features = Vec::with_capacity(VGG16_STAGES.len());
        let mut x = x;

        for (block, layout) in self.stages.iter().zip(VGG16_STAGES.iter()) {
            x = block.forward(x, layout);
            features.push(x.clone());
        }

        features
    }
}

fn max_pool2d<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    MaxPool2dConfig::new([2, 2])
        .with_strides([2, 2])
        .init()
        .forward(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::record::{FullPrecisionSettings, Recorder};
    use burn::tensor::Distribution;
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    #[test]
    fn stage_sizes_match_layer_slices() {
        let sizes: Vec<usize> = VGG16_STAGES.iter().map(|stage| stage.ops.len()).collect();
        assert_eq!(sizes, [4, 5, 7, 7, 7]);

        let convs = VGG16_STAGES
            .iter()
            .flat_map(|stage| stage.ops.iter())
            .filter(|op| matches!(op, VggOp::Conv { .. }))
            .count();
        assert_eq!(convs, 13);
    }

    #[test]
    fn stage_output_channels_match_feature_channels() {
        for (stage, channels) in VGG16_STAGES.iter().zip(FEATURE_CHANNELS) {
            let last = stage
                .ops
                .iter()
                .rev()
                .find_map(|op| match op {
                    VggOp::Conv { channels } => Some(channels[1]),
                    _ => None,
                })
                .unwrap();
            assert_eq!(last, channels, "stage {}", stage.name);
        }
    }

    #[test]
    fn key_remaps_follow_torchvision_indices() {
        let remaps = vgg16_key_remaps();
        let patterns: Vec<&str> = remaps.iter().map(|(pattern, _)| pattern.as_str()).collect();

        assert_eq!(remaps.len(), 13);
        assert_eq!(patterns[0], "features\\.0\\.(.*)");
        assert_eq!(patterns[2], "features\\.5\\.(.*)");
        assert_eq!(patterns[4], "features\\.10\\.(.*)");
        assert_eq!(patterns[12], "features\\.28\\.(.*)");
        assert_eq!(remaps[12].1, "stages.4.convs.2.$1");
    }

    fn single_value<const D: usize>(tensor: Tensor<TestBackend, D>) -> f32 {
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values.len(), 1);
        values[0]
    }

    #[test]
    fn torchvision_checkpoint_loads_into_stages() {
        // Each `features.<i>` convolution holds weight i / 1000 and bias i / 100. The
        // unmapped `classifier.0.weight` is skipped.
        let mut args = LoadArgs::new("tests/fixtures/vgg16_features.pt".into());
        for (pattern, replacement) in vgg16_key_remaps() {
            args = args.with_key_remap(&pattern, &replacement);
        }

        let record: Vgg16FeaturesRecord<TestBackend> =
            PyTorchFileRecorder::<FullPrecisionSettings>::default()
                .load(args, &Default::default())
                .expect("Should decode state successfully");

        assert_eq!(record.stages.len(), 5);
        let mut index = 0;
        for (stage, layout) in record.stages.iter().zip(VGG16_STAGES.iter()) {
            let mut convs = stage.convs.iter();
            for op in layout.ops {
                if let VggOp::Conv { .. } = op {
                    let conv = convs.next().unwrap();
                    let weight = single_value(conv.weight.val());
                    let bias = single_value(conv.bias.as_ref().unwrap().val());

                    assert!((weight - index as f32 / 1000.0).abs() < 1e-6, "features.{index}");
                    assert!((bias - index as f32 / 100.0).abs() < 1e-6, "features.{index}");
                }
                index += 1;
            }
            assert!(convs.next().is_none(), "stage {}", layout.name);
        }

        let conv5_3 = &record.stages[4].convs[2];
        assert!((single_value(conv5_3.weight.val()) - 0.028).abs() < 1e-6);
        let conv2_1 = &record.stages[1].convs[0];
        assert!((single_value(conv2_1.bias.as_ref().unwrap().val()) - 0.05).abs() < 1e-6);
    }

    #[test]
    fn forward_returns_five_pyramid_levels() {
        let device = Default::default();
        let vgg = Vgg16Features::<TestBackend>::new(&device);
        let input = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);

        let features = vgg.forward(input);

        assert_eq!(features.len(), 5);
        for (index, (feature, channels)) in features.iter().zip(FEATURE_CHANNELS).enumerate() {
            let side = 32 >> index;
            assert_eq!(feature.dims(), [2, channels, side, side]);
        }
    }

    #[test]
    fn forward_is_deterministic() {
        let device = Default::default();
        let vgg = Vgg16Features::<TestBackend>::new(&device);
        let input = Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Default, &device);

        let first = vgg.forward(input.clone());
        let second = vgg.forward(input);

        for (a, b) in first.into_iter().zip(second) {
            a.into_data().assert_eq(&b.into_data(), true);
        }
    }
}

//! LPIPS (Learned Perceptual Image Patch Similarity).
//!
//! LPIPS measures perceptual similarity between images using deep features.
//! Reference: "The Unreasonable Effectiveness of Deep Features as a Perceptual Metric"
//! <https://arxiv.org/abs/1801.03924>

use burn::config::Config;
use burn::module::{Content, DisplaySettings, Ignored, Module, ModuleDisplay};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{DType, Tensor, TensorData};

use crate::LpipsError;
use crate::backbone::{FEATURE_CHANNELS, MIN_INPUT_SIZE, Vgg16Features};
use crate::transform::{InputDtype, InputRange, normalize, resize, to_float_tensor};
use crate::weights::{ParameterSet, WeightProvider};

/// Stabilizes the L2 normalization of activations with a near-zero norm.
const EPSILON: f64 = 1e-10;

/// Configuration for the [LPIPS](Lpips) module.
///
/// # Example
///
/// ```ignore
/// use burn_fidelity::lpips::LpipsConfig;
/// use burn_fidelity::transform::InputDtype;
///
/// let lpips = LpipsConfig::new()
///     .with_resize(Some(224))
///     .with_dtype(Some(InputDtype::U8))
///     .init_pretrained(&provider, &device)?;
/// ```
#[derive(Config, Debug)]
pub struct LpipsConfig {
    /// Side of the square resolution both inputs are resampled to.
    /// `None` compares images at their native resolution.
    pub resize: Option<usize>,

    /// Element type both inputs must have. `None` accepts `u8` and `f32`.
    pub dtype: Option<InputDtype>,

    /// Value range of the input pixels.
    #[config(default = "InputRange::Byte")]
    pub input_range: InputRange,
}

impl LpipsConfig {
    /// Check the configuration values.
    pub fn validate(&self) -> Result<(), LpipsError> {
        if self.resize == Some(0) {
            return Err(LpipsError::Config(
                "resize must be a positive integer".to_string(),
            ));
        }

        // Bytes cannot carry pixels in [0, 1].
        if self.dtype == Some(InputDtype::U8) && self.input_range == InputRange::Unit {
            return Err(LpipsError::Config(
                "u8 inputs cannot use the unit input range, use the byte range or f32 inputs"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Initialize a new [LPIPS](Lpips) module with random weights.
    ///
    /// Pretrained parameters can be applied afterwards with [Module::load_record]; use
    /// [init_pretrained](Self::init_pretrained) for the published weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Lpips<B>, LpipsError> {
        self.validate()?;

        Ok(Lpips {
            backbone: Vgg16Features::new(device),
            heads: LinearHeads::new(device),
            config: Ignored(self.clone()),
        })
    }

    /// Initialize a new, frozen, [LPIPS](Lpips) module from a loaded parameter set.
    pub fn init_with<B: Backend>(
        &self,
        parameters: ParameterSet<B>,
        device: &B::Device,
    ) -> Result<Lpips<B>, LpipsError> {
        self.validate()?;

        Ok(Lpips {
            backbone: Vgg16Features::new(device)
                .load_record(parameters.backbone)
                .no_grad(),
            heads: LinearHeads::new(device)
                .load_record(parameters.heads)
                .no_grad(),
            config: Ignored(self.clone()),
        })
    }

    /// Initialize a new, frozen, [LPIPS](Lpips) module with the weights of `provider`.
    pub fn init_pretrained<B: Backend, P: WeightProvider<B>>(
        &self,
        provider: &P,
        device: &B::Device,
    ) -> Result<Lpips<B>, LpipsError> {
        self.validate()?;
        let parameters = provider.load(device)?;

        self.init_with(parameters, device)
    }
}

/// Learned 1x1 projections reducing each feature level to a single channel.
#[derive(Module, Debug)]
pub struct LinearHeads<B: Backend> {
    lins: Vec<Conv2d<B>>,
}

impl<B: Backend> LinearHeads<B> {
    /// Create new, randomly initialized, heads matching [FEATURE_CHANNELS].
    pub fn new(device: &B::Device) -> Self {
        let lins = FEATURE_CHANNELS
            .iter()
            .map(|channels| {
                Conv2dConfig::new([*channels, 1], [1, 1])
                    .with_bias(false)
                    .init(device)
            })
            .collect();

        Self { lins }
    }

    /// Key remapping rules from the LPIPS state dict (`lin<k>.model.1.weight`, after a
    /// dropout layer) to [LinearHeads].
    pub fn key_remaps() -> Vec<(String, String)> {
        vec![(
            "lin([0-9]+)\\.model\\.1\\.(.*)".to_string(),
            "lins.$1.$2".to_string(),
        )]
    }

    fn device(&self) -> B::Device {
        self.lins[0].weight.val().device()
    }
}

/// LPIPS perceptual distance with a VGG16 backbone.
///
/// The distance of a pair is the sum, over the 5 backbone stages, of the spatial mean of the
/// learned projection of the squared difference between unit-normalized activations.
///
/// The projection weights are not constrained to be non-negative and the result is not
/// clamped, so a pair can in principle get a negative distance.
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct Lpips<B: Backend> {
    backbone: Vgg16Features<B>,
    heads: LinearHeads<B>,
    config: Ignored<LpipsConfig>,
}

impl<B: Backend> ModuleDisplay for Lpips<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("net", &"Vgg16".to_string())
            .add("resize", &format!("{:?}", self.config.resize))
            .add("dtype", &format!("{:?}", self.config.dtype))
            .add("input_range", &format!("{:?}", self.config.input_range))
            .optional()
    }
}

impl<B: Backend> Lpips<B> {
    /// The configuration the module was created with.
    pub fn config(&self) -> &LpipsConfig {
        &self.config.0
    }

    /// Compute the distance between two host image batches.
    ///
    /// Batches may hold `u8` or `f32` pixels, in the configured [range](LpipsConfig::input_range).
    /// Every precondition is checked before the data is uploaded.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, 3, H, W]`
    /// - target: `[batch, 3, H, W]`
    /// - output: `[batch]`
    pub fn distance(
        &self,
        input: TensorData,
        target: TensorData,
    ) -> Result<Tensor<B, 1>, LpipsError> {
        self.check_input("Input 0", &input.shape, input.dtype)?;
        self.check_input("Input 1", &target.shape, target.dtype)?;
        self.check_pair(&input.shape, &target.shape)?;

        let device = self.heads.device();
        let input = to_float_tensor(input, &device);
        let target = to_float_tensor(target, &device);

        Ok(self.forward_checked(input, target))
    }

    /// Compute the distance between two float image batches already on the device.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, 3, H, W]`
    /// - target: `[batch, 3, H, W]`
    /// - output: `[batch]`
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        target: Tensor<B, 4>,
    ) -> Result<Tensor<B, 1>, LpipsError> {
        let (input_shape, target_shape) = (input.dims(), target.dims());

        self.check_input("Input 0", &input_shape, input.dtype())?;
        self.check_input("Input 1", &target_shape, target.dtype())?;
        self.check_pair(&input_shape, &target_shape)?;

        Ok(self.forward_checked(input, target))
    }

    fn forward_checked(&self, input: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch, _, _, _] = input.dims();
        let range = self.config.input_range;

        let input = normalize(input, range);
        let target = normalize(target, range);

        let (input, target) = match self.config.resize {
            Some(size) => (resize(input, size), resize(target, size)),
            None => (input, target),
        };

        let feats0 = self.backbone.forward(input);
        let feats1 = self.backbone.forward(target);

        let device = feats0[0].device();
        let mut total = Tensor::zeros([batch], &device);

        let levels = feats0.into_iter().zip(feats1).zip(self.heads.lins.iter());
        for ((feat0, feat1), lin) in levels {
            total = total.add(layer_distance(feat0, feat1, lin));
        }

        total
    }

    fn check_input(&self, label: &str, shape: &[usize], dtype: DType) -> Result<(), LpipsError> {
        if shape.len() != 4 || shape[1] != 3 {
            return Err(LpipsError::Precondition(format!(
                "{label} is not Bx3xHxW, got shape {shape:?}"
            )));
        }

        if let Some(required) = self.config.dtype {
            if dtype != required.dtype() {
                return Err(LpipsError::Precondition(format!(
                    "Unexpected {label} dtype {dtype:?}, expected {:?}",
                    required.dtype()
                )));
            }
        }

        Ok(())
    }

    fn check_pair(&self, input: &[usize], target: &[usize]) -> Result<(), LpipsError> {
        if input[0] != target[0] {
            return Err(LpipsError::Precondition(format!(
                "Batch sizes differ, got shapes {input:?} and {target:?}"
            )));
        }

        let (height, width) = match self.config.resize {
            Some(size) => (size, size),
            None if input[2..] != target[2..] => {
                return Err(LpipsError::Precondition(format!(
                    "Spatial sizes differ and no resize is configured, got shapes {input:?} and {target:?}"
                )));
            }
            None => (input[2], input[3]),
        };

        if height < MIN_INPUT_SIZE || width < MIN_INPUT_SIZE {
            return Err(LpipsError::Precondition(format!(
                "Spatial size {height}x{width} is smaller than {MIN_INPUT_SIZE}x{MIN_INPUT_SIZE}"
            )));
        }

        Ok(())
    }
}

/// Distance contribution of one feature level.
///
/// # Shapes
///
/// - feat0, feat1: `[batch, C, H, W]`
/// - output: `[batch]`
fn layer_distance<B: Backend>(
    feat0: Tensor<B, 4>,
    feat1: Tensor<B, 4>,
    lin: &Conv2d<B>,
) -> Tensor<B, 1> {
    let diff = normalize_tensor(feat0).sub(normalize_tensor(feat1));
    let diff_sq = diff.clone().mul(diff);

    // [batch, C, H, W] -> [batch, 1, H, W]
    spatial_average(lin.forward(diff_sq))
}

/// Scale each spatial location's channel vector to unit L2 norm.
fn normalize_tensor<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let norm = x.clone().powi_scalar(2).sum_dim(1).sqrt().add_scalar(EPSILON);
    x.div(norm)
}

/// Mean over the spatial dimensions of a single channel map.
fn spatial_average<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, _, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([batch])
}

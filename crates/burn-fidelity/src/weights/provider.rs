use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use burn::record::{FullPrecisionSettings, Record, Recorder};
use burn::tensor::backend::Backend;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use super::{VGG16_BASE, VGG16_LPIPS, WeightCache};
use crate::backbone::{Vgg16FeaturesRecord, vgg16_key_remaps};
use crate::lpips::{LinearHeads, LinearHeadsRecord, Lpips, LpipsConfig};
use crate::{LpipsError, WeightError};

/// Pretrained parameters of an [LPIPS](Lpips) module.
pub struct ParameterSet<B: Backend> {
    /// Parameters of the VGG16 backbone convolutions.
    pub backbone: Vgg16FeaturesRecord<B>,
    /// Parameters of the per-level 1x1 projections.
    pub heads: LinearHeadsRecord<B>,
}

/// Source of pretrained LPIPS parameters.
pub trait WeightProvider<B: Backend> {
    /// Load the parameters on `device`.
    fn load(&self, device: &B::Device) -> Result<ParameterSet<B>, WeightError>;
}

/// Published weights: torchvision's VGG16 and the LPIPS projections, downloaded through a
/// [weight cache](WeightCache).
#[derive(new, Debug)]
pub struct HubWeights {
    cache: WeightCache,
}

impl<B: Backend> WeightProvider<B> for HubWeights {
    fn load(&self, device: &B::Device) -> Result<ParameterSet<B>, WeightError> {
        let backbone = load_pytorch(&self.cache.fetch(&VGG16_BASE)?, &vgg16_key_remaps(), device)?;
        let heads = load_pytorch(
            &self.cache.fetch(&VGG16_LPIPS)?,
            &LinearHeads::<B>::key_remaps(),
            device,
        )?;

        Ok(ParameterSet { backbone, heads })
    }
}

/// Read a PyTorch state dict into a record, renaming its keys with `remaps`.
///
/// Keys without a counterpart in the record are ignored. Any decoding failure is reported as a
/// corrupted file.
fn load_pytorch<B: Backend, R: Record<B>>(
    path: &Path,
    remaps: &[(String, String)],
    device: &B::Device,
) -> Result<R, WeightError> {
    let mut args = LoadArgs::new(path.to_path_buf());

    for (pattern, replacement) in remaps {
        log::debug!("Remapping {pattern} -> {replacement}");
        args = args.with_key_remap(pattern, replacement);
    }

    let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();

    Recorder::<B>::load(&recorder, args, device).map_err(|err| WeightError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// An [LPIPS](Lpips) module whose weights are acquired on first use.
///
/// The provider is invoked at most once per successful load, even under concurrent first
/// use; every caller then receives a clone of the same frozen module. A failed load is not
/// remembered, so the next call retries.
pub struct PretrainedLpips<B: Backend, P> {
    provider: P,
    config: LpipsConfig,
    device: B::Device,
    model: Mutex<Option<Lpips<B>>>,
}

impl<B: Backend, P: WeightProvider<B>> PretrainedLpips<B, P> {
    /// Create a lazily loaded module. The configuration is validated immediately.
    pub fn new(config: LpipsConfig, provider: P, device: B::Device) -> Result<Self, LpipsError> {
        config.validate()?;

        Ok(Self {
            provider,
            config,
            device,
            model: Mutex::new(None),
        })
    }

    /// The module, loading the weights if this is the first call.
    pub fn get(&self) -> Result<Lpips<B>, LpipsError> {
        let mut model = self.lock();

        if let Some(model) = model.as_ref() {
            return Ok(model.clone());
        }

        log::info!("Loading pretrained LPIPS weights");
        let loaded = self
            .config
            .init_pretrained(&self.provider, &self.device)?;
        *model = Some(loaded.clone());

        Ok(loaded)
    }

    /// Whether the weights have been loaded already.
    pub fn is_loaded(&self) -> bool {
        self.lock().is_some()
    }

    // A panic while holding the lock cannot leave a partially built module behind.
    fn lock(&self) -> MutexGuard<'_, Option<Lpips<B>>> {
        self.model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

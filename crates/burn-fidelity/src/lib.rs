#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! `burn-fidelity` provides the feature-extraction side of generative model evaluation
//! metrics on top of Burn.
//!
//! The main entry point is [Lpips](lpips::Lpips), the Learned Perceptual Image Patch
//! Similarity computed with a frozen VGG16 backbone. Pretrained weights are fetched once
//! through a [WeightProvider](weights::WeightProvider) and cached on disk.
//!
//! ```ignore
//! use burn_fidelity::lpips::LpipsConfig;
//! use burn_fidelity::transform::InputDtype;
//! use burn_fidelity::weights::{HubWeights, WeightCacheConfig};
//!
//! let device = Default::default();
//! let provider = HubWeights::new(WeightCacheConfig::new().init()?);
//! let lpips = LpipsConfig::new()
//!     .with_dtype(Some(InputDtype::U8))
//!     .init_pretrained::<Backend, _>(&provider, &device)?;
//!
//! let distance = lpips.distance(images_a, images_b)?; // [batch]
//! ```

#[macro_use]
extern crate derive_new;

/// The VGG16 feature backbone.
pub mod backbone;

/// Error types.
pub mod error;

/// The LPIPS perceptual similarity engine.
pub mod lpips;

/// Named sample similarity measures.
pub mod similarity;

/// Input normalization and resizing.
pub mod transform;

/// Pretrained weight download, caching and loading.
pub mod weights;

pub use error::*;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

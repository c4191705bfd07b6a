//! Named sample similarity measures.
//!
//! A [SampleSimilarity] compares two batches pair by pair. Measures are registered under a
//! stable name, resolved with [SampleSimilarityKind::from_name].

use core::fmt::Display;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::LpipsError;
use crate::lpips::Lpips;

/// A measure comparing two batches of samples pair by pair.
pub trait SampleSimilarity<B: Backend> {
    /// Registered name of the measure.
    fn name(&self) -> &'static str;

    /// One value per pair of samples.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, ...]`
    /// - target: `[batch, ...]`
    /// - output: `[batch]`
    fn similarity(
        &self,
        input: TensorData,
        target: TensorData,
    ) -> Result<Tensor<B, 1>, LpipsError>;
}

impl<B: Backend> SampleSimilarity<B> for Lpips<B> {
    fn name(&self) -> &'static str {
        SampleSimilarityKind::LpipsVgg16.name()
    }

    fn similarity(
        &self,
        input: TensorData,
        target: TensorData,
    ) -> Result<Tensor<B, 1>, LpipsError> {
        self.distance(input, target)
    }
}

/// The registered sample similarity measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSimilarityKind {
    /// LPIPS with a VGG16 backbone.
    LpipsVgg16,
}

impl SampleSimilarityKind {
    /// All registered measures.
    pub const ALL: [SampleSimilarityKind; 1] = [SampleSimilarityKind::LpipsVgg16];

    /// Resolve a registered name.
    pub fn from_name(name: &str) -> Result<Self, LpipsError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| {
                LpipsError::Config(format!("Sample similarity `{name}` is not registered"))
            })
    }

    /// The registered name.
    pub fn name(&self) -> &'static str {
        match self {
            SampleSimilarityKind::LpipsVgg16 => "lpips-vgg16",
        }
    }
}

impl Display for SampleSimilarityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use crate::lpips::LpipsConfig;
    use burn::tensor::Tolerance;

    #[test]
    fn resolves_registered_names() {
        let kind = SampleSimilarityKind::from_name("lpips-vgg16").unwrap();

        assert_eq!(kind, SampleSimilarityKind::LpipsVgg16);
        assert_eq!(kind.to_string(), "lpips-vgg16");
    }

    #[test]
    fn rejects_unknown_names() {
        let result = SampleSimilarityKind::from_name("lpips-alex");

        assert!(matches!(result, Err(LpipsError::Config(msg)) if msg.contains("lpips-alex")));
    }

    #[test]
    fn lpips_is_a_sample_similarity() {
        let model = LpipsConfig::new()
            .init::<TestBackend>(&Default::default())
            .unwrap();
        let measure: &dyn SampleSimilarity<TestBackend> = &model;
        let image = TensorData::new(vec![7u8; 2 * 3 * 16 * 16], [2, 3, 16, 16]);

        let similarity = measure.similarity(image.clone(), image).unwrap();

        assert_eq!(measure.name(), "lpips-vgg16");
        similarity
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.0f32, 0.0]), Tolerance::default());
    }
}

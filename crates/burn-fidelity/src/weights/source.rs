/// VGG16 ImageNet weights from the torchvision model hub.
///
/// Distributed under BSD 3-Clause, the Oxford VGG weights under CC-BY
/// (<https://www.robots.ox.ac.uk/~vgg/research/very_deep/>).
pub const VGG16_BASE: WeightSource = WeightSource::new(
    "vgg16",
    "https://download.pytorch.org/models/vgg16-397923af.pth",
);

/// LPIPS v0.1 linear layer weights for the VGG16 backbone.
///
/// Distributed under BSD 2-Clause (<https://github.com/richzhang/PerceptualSimilarity>).
pub const VGG16_LPIPS: WeightSource = WeightSource::new(
    "vgg16-lpips",
    "https://github.com/toshas/torch-fidelity/releases/download/v0.2.0/weights-vgg16-lpips.pth",
);

/// A remote weight blob, versioned by its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightSource {
    /// Network identifier, used in logs.
    pub name: &'static str,
    /// Location of the serialized state dict.
    pub url: &'static str,
}

impl WeightSource {
    /// Create a new weight source.
    pub const fn new(name: &'static str, url: &'static str) -> Self {
        Self { name, url }
    }

    /// The cache file name, i.e. the last path segment of the URL.
    pub fn file_name(&self) -> &'static str {
        let path = self.url.split(['?', '#']).next().unwrap_or(self.url);
        path.rsplit('/').next().unwrap_or(path)
    }

    /// The SHA-256 prefix embedded in torch hub style file names (`name-<hex>.ext`).
    ///
    /// Returns `None` when the file name carries no such prefix.
    pub fn hash_prefix(&self) -> Option<&'static str> {
        let file_name = self.file_name();
        let stem = file_name.split('.').next()?;
        let (_, suffix) = stem.rsplit_once('-')?;

        let is_hex = suffix.len() >= 8 && suffix.chars().all(|c| c.is_ascii_hexdigit());
        is_hex.then_some(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_last_url_segment() {
        assert_eq!(VGG16_BASE.file_name(), "vgg16-397923af.pth");
        assert_eq!(VGG16_LPIPS.file_name(), "weights-vgg16-lpips.pth");

        let source = WeightSource::new("x", "https://host/a/b/model.pth?download=1");
        assert_eq!(source.file_name(), "model.pth");
    }

    #[test]
    fn hash_prefix_follows_torch_hub_naming() {
        assert_eq!(VGG16_BASE.hash_prefix(), Some("397923af"));
        assert_eq!(VGG16_LPIPS.hash_prefix(), None);
    }
}

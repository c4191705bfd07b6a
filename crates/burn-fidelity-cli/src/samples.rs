use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use burn::tensor::TensorData;

/// Extensions of the image files picked up in a directory.
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Two images to compare, named after the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SamplePair {
    pub name: String,
    pub input1: PathBuf,
    pub input2: PathBuf,
}

/// Pair two image files, or the images of two directories by sorted file name.
pub(crate) fn find_pairs(input1: &Path, input2: &Path) -> anyhow::Result<Vec<SamplePair>> {
    match (input1.is_dir(), input2.is_dir()) {
        (true, true) => {
            let files1 = find_images(input1)?;
            let files2 = find_images(input2)?;

            if files1.is_empty() {
                bail!("No images found in {}", input1.display());
            }
            if files1.len() != files2.len() {
                bail!(
                    "Input directories hold a different number of images: {} in {}, {} in {}",
                    files1.len(),
                    input1.display(),
                    files2.len(),
                    input2.display()
                );
            }

            Ok(files1
                .into_iter()
                .zip(files2)
                .map(|(input1, input2)| SamplePair {
                    name: file_name(&input1),
                    input1,
                    input2,
                })
                .collect())
        }
        (false, false) => Ok(vec![SamplePair {
            name: file_name(input1),
            input1: input1.to_path_buf(),
            input2: input2.to_path_buf(),
        }]),
        _ => bail!(
            "Inputs must be two image files or two directories, got {} and {}",
            input1.display(),
            input2.display()
        ),
    }
}

fn find_images(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in fs::read_dir(root).with_context(|| format!("Reading {}", root.display()))? {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// An RGB image in planar `[3, H, W]` layout.
#[derive(Debug, Clone)]
pub(crate) struct RgbImage {
    pub height: usize,
    pub width: usize,
    pub pixels: Vec<u8>,
}

impl RgbImage {
    /// Decode an image file, dropping any alpha channel.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Decoding {}", path.display()))?
            .into_rgb8();
        let (width, height) = image.dimensions();

        Ok(Self::from_interleaved(
            height as usize,
            width as usize,
            &image.into_raw(),
        ))
    }

    /// Convert `[H, W, 3]` interleaved pixels to planar layout.
    pub fn from_interleaved(height: usize, width: usize, interleaved: &[u8]) -> Self {
        let plane = height * width;
        let mut pixels = vec![0u8; 3 * plane];

        for (index, pixel) in interleaved.chunks_exact(3).enumerate() {
            for (channel, value) in pixel.iter().enumerate() {
                pixels[channel * plane + index] = *value;
            }
        }

        Self {
            height,
            width,
            pixels,
        }
    }

    fn shape(&self) -> [usize; 2] {
        [self.height, self.width]
    }
}

impl SamplePair {
    /// Decode both images of the pair.
    pub fn decode(self) -> anyhow::Result<DecodedPair> {
        Ok(DecodedPair {
            input1: RgbImage::open(&self.input1)?,
            input2: RgbImage::open(&self.input2)?,
            name: self.name,
        })
    }
}

/// A [pair](SamplePair) with both images decoded.
#[derive(Debug, Clone)]
pub(crate) struct DecodedPair {
    pub name: String,
    pub input1: RgbImage,
    pub input2: RgbImage,
}

impl DecodedPair {
    fn same_shapes(&self, other: &DecodedPair) -> bool {
        self.input1.shape() == other.input1.shape() && self.input2.shape() == other.input2.shape()
    }
}

/// Consecutive pairs stacked into two `[batch, 3, H, W]` tensors.
#[derive(Debug)]
pub(crate) struct PairBatch {
    pub names: Vec<String>,
    pub input1: TensorData,
    pub input2: TensorData,
}

/// Group consecutive pairs into batches of at most `batch_size` pairs.
///
/// A batch only holds pairs whose first images share a shape and whose second images share
/// a shape. Pairs are pulled from `pairs` as batches are requested, so at most one batch and
/// one pending pair are decoded at any time.
pub(crate) fn batch_pairs<I>(pairs: I, batch_size: usize) -> PairBatches<I::IntoIter>
where
    I: IntoIterator<Item = anyhow::Result<DecodedPair>>,
{
    PairBatches {
        pairs: pairs.into_iter(),
        batch_size,
        pending: None,
    }
}

/// Iterator returned by [batch_pairs].
pub(crate) struct PairBatches<I> {
    pairs: I,
    batch_size: usize,
    pending: Option<DecodedPair>,
}

impl<I> Iterator for PairBatches<I>
where
    I: Iterator<Item = anyhow::Result<DecodedPair>>,
{
    type Item = anyhow::Result<PairBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut current = Vec::with_capacity(self.batch_size);
        current.extend(self.pending.take());

        while current.len() < self.batch_size {
            let pair = match self.pairs.next() {
                Some(Ok(pair)) => pair,
                Some(Err(err)) => return Some(Err(err)),
                None => break,
            };

            if current
                .first()
                .is_some_and(|first: &DecodedPair| !first.same_shapes(&pair))
            {
                self.pending = Some(pair);
                break;
            }
            current.push(pair);
        }

        match current.is_empty() {
            true => None,
            false => Some(Ok(stack(current))),
        }
    }
}

fn stack(pairs: Vec<DecodedPair>) -> PairBatch {
    let batch = pairs.len();
    let [h1, w1] = pairs[0].input1.shape();
    let [h2, w2] = pairs[0].input2.shape();

    let mut names = Vec::with_capacity(batch);
    let mut pixels1 = Vec::with_capacity(batch * 3 * h1 * w1);
    let mut pixels2 = Vec::with_capacity(batch * 3 * h2 * w2);

    for pair in pairs {
        names.push(pair.name);
        pixels1.extend(pair.input1.pixels);
        pixels2.extend(pair.input2.pixels);
    }

    PairBatch {
        names,
        input1: TensorData::new(pixels1, [batch, 3, h1, w1]),
        input2: TensorData::new(pixels2, [batch, 3, h2, w2]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    fn image(height: usize, width: usize, value: u8) -> RgbImage {
        RgbImage {
            height,
            width,
            pixels: vec![value; 3 * height * width],
        }
    }

    #[test]
    fn directories_are_paired_by_sorted_name() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        for name in ["b.png", "a.JPG", "c.jpeg", "notes.txt"] {
            touch(dir1.path(), name);
        }
        for name in ["z.png", "x.png", "y.png"] {
            touch(dir2.path(), name);
        }

        let pairs = find_pairs(dir1.path(), dir2.path()).unwrap();

        let names: Vec<&str> = pairs.iter().map(|pair| pair.name.as_str()).collect();
        assert_eq!(names, ["a.JPG", "b.png", "c.jpeg"]);
        assert_eq!(pairs[0].input2, dir2.path().join("x.png"));
        assert_eq!(pairs[2].input2, dir2.path().join("z.png"));
    }

    #[test]
    fn directories_with_different_counts_are_rejected() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        touch(dir1.path(), "a.png");
        touch(dir1.path(), "b.png");
        touch(dir2.path(), "a.png");

        let err = find_pairs(dir1.path(), dir2.path()).unwrap_err();

        assert!(err.to_string().contains("different number"), "{err}");
    }

    #[test]
    fn file_and_directory_are_rejected() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.png");

        assert!(find_pairs(&dir.path().join("a.png"), dir.path()).is_err());
    }

    #[test]
    fn interleaved_pixels_become_planar() {
        let image = RgbImage::from_interleaved(1, 2, &[1, 2, 3, 4, 5, 6]);

        assert_eq!(image.pixels, [1, 4, 2, 5, 3, 6]);
    }

    fn pair(name: &str, side1: [usize; 2], side2: [usize; 2]) -> DecodedPair {
        DecodedPair {
            name: name.to_string(),
            input1: image(side1[0], side1[1], 0),
            input2: image(side2[0], side2[1], 1),
        }
    }

    #[test]
    fn batches_split_on_size_and_shape() {
        let pairs = vec![
            pair("0", [16, 16], [16, 16]),
            pair("1", [16, 16], [16, 16]),
            pair("2", [16, 16], [16, 16]),
            pair("3", [16, 16], [32, 16]),
        ];

        let batches: Vec<PairBatch> = batch_pairs(pairs.into_iter().map(Ok), 2)
            .collect::<anyhow::Result<_>>()
            .unwrap();

        let sizes: Vec<usize> = batches.iter().map(|batch| batch.names.len()).collect();
        assert_eq!(sizes, [2, 1, 1]);
        assert_eq!(batches[0].input1.shape, [2, 3, 16, 16]);
        assert_eq!(batches[2].input2.shape, [1, 3, 32, 16]);
        assert_eq!(batches[2].names, ["3"]);
    }

    #[test]
    fn pairs_are_decoded_one_batch_at_a_time() {
        let decoded = Cell::new(0);
        let pairs = (0..10).map(|index| {
            decoded.set(decoded.get() + 1);
            let side = if index < 6 { 16 } else { 24 };
            Ok(pair(&index.to_string(), [side, side], [16, 16]))
        });
        let mut batches = batch_pairs(pairs, 4);

        assert_eq!(batches.next().unwrap().unwrap().names.len(), 4);
        assert_eq!(decoded.get(), 4);

        // The first pair of the next shape is held back.
        assert_eq!(batches.next().unwrap().unwrap().names.len(), 2);
        assert_eq!(decoded.get(), 7);

        assert_eq!(batches.next().unwrap().unwrap().names.len(), 4);
        assert!(batches.next().is_none());
    }

    #[test]
    fn decode_errors_stop_the_batches() {
        let pairs = vec![
            Ok(pair("0", [16, 16], [16, 16])),
            Err(anyhow::anyhow!("Decoding broken.png")),
        ];

        let mut batches = batch_pairs(pairs, 4);

        let err = batches.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("broken.png"));
    }
}

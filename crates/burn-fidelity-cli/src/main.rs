//! `fidelity-lpips`: LPIPS distances between two images or two image directories.
//!
//! Each pair is reported as `name<TAB>distance` on stdout, followed by `mean<TAB>value`.

mod logger;
mod samples;

use std::path::PathBuf;

use burn::config::Config;
use burn::tensor::TensorData;
use burn_fidelity::lpips::LpipsConfig;
use burn_fidelity::transform::{InputDtype, InputRange};
use burn_fidelity::weights::{HubWeights, WeightCacheConfig};
use clap::{Parser, ValueEnum};

use crate::logger::install_stderr_logger;
use crate::samples::{SamplePair, batch_pairs, find_pairs};

#[cfg(feature = "wgpu")]
type Backend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
type Backend = burn::backend::NdArray<f32>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// First image, or directory of images.
    #[arg(long)]
    input1: PathBuf,

    /// Second image, or directory of images paired with the first by sorted file name.
    #[arg(long)]
    input2: PathBuf,

    /// Resample both inputs to this square side before comparing.
    #[arg(long)]
    resize: Option<usize>,

    /// Require the decoded inputs to have this element type.
    #[arg(long, value_enum)]
    dtype: Option<DtypeArg>,

    /// Value range of the input pixels.
    #[arg(long, value_enum)]
    input_range: Option<RangeArg>,

    /// Number of pairs compared per forward pass.
    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Directory holding the downloaded weights.
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// JSON file with an LPIPS configuration; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only log warnings and errors, and hide download progress.
    #[arg(long)]
    silent: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DtypeArg {
    U8,
    F32,
}

impl From<DtypeArg> for InputDtype {
    fn from(value: DtypeArg) -> Self {
        match value {
            DtypeArg::U8 => InputDtype::U8,
            DtypeArg::F32 => InputDtype::F32,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum RangeArg {
    Byte,
    Unit,
}

impl From<RangeArg> for InputRange {
    fn from(value: RangeArg) -> Self {
        match value {
            RangeArg::Byte => InputRange::Byte,
            RangeArg::Unit => InputRange::Unit,
        }
    }
}

impl Args {
    fn lpips_config(&self) -> anyhow::Result<LpipsConfig> {
        let mut config = match &self.config {
            Some(path) => LpipsConfig::load(path).map_err(|err| {
                anyhow::anyhow!("Loading configuration {}: {err}", path.display())
            })?,
            None => LpipsConfig::new(),
        };

        if let Some(resize) = self.resize {
            config.resize = Some(resize);
        }
        if let Some(dtype) = self.dtype {
            config.dtype = Some(dtype.into());
        }
        if let Some(range) = self.input_range {
            config.input_range = range.into();
        }

        config.validate()?;

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    install_stderr_logger(args.silent);

    if args.batch_size == 0 {
        anyhow::bail!("--batch-size must be a positive integer");
    }

    let config = args.lpips_config()?;
    let pairs = find_pairs(&args.input1, &args.input2)?;
    log::info!("Comparing {} image pairs", pairs.len());

    let cache = WeightCacheConfig::new()
        .with_root(args.cache_root.clone())
        .with_verbose(!args.silent)
        .init()?;
    let device = Default::default();
    let lpips = config.init_pretrained::<Backend, _>(&HubWeights::new(cache), &device)?;

    let mut distances = Vec::with_capacity(pairs.len());
    let decoded = pairs.into_iter().map(SamplePair::decode);

    for batch in batch_pairs(decoded, args.batch_size) {
        let batch = batch?;
        let values = lpips
            .distance(prepare(batch.input1, &config), prepare(batch.input2, &config))?
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow::anyhow!("Reading distances: {err:?}"))?;

        for (name, value) in batch.names.iter().zip(&values) {
            println!("{name}\t{value}");
        }
        distances.extend(values);
    }

    let mean = distances.iter().sum::<f32>() / distances.len() as f32;
    println!("mean\t{mean}");

    Ok(())
}

/// Bring decoded bytes to the configured range and element type.
fn prepare(data: TensorData, config: &LpipsConfig) -> TensorData {
    match (config.input_range, config.dtype) {
        (InputRange::Unit, _) => {
            let shape = data.shape.clone();
            let values: Vec<f32> = data
                .iter::<f32>()
                .map(|value| value / InputRange::Byte.max_value())
                .collect();

            TensorData::new(values, shape)
        }
        (InputRange::Byte, Some(InputDtype::F32)) => data.convert::<f32>(),
        (InputRange::Byte, _) => data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_configuration_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lpips.json");
        LpipsConfig::new()
            .with_resize(Some(64))
            .with_dtype(Some(InputDtype::F32))
            .save(&path)
            .unwrap();

        let args = Args::try_parse_from([
            "fidelity-lpips",
            "--input1",
            "a.png",
            "--input2",
            "b.png",
            "--config",
            path.to_str().unwrap(),
            "--resize",
            "224",
            "--input-range",
            "unit",
        ])
        .unwrap();
        let config = args.lpips_config().unwrap();

        assert_eq!(args.batch_size, 64);
        assert_eq!(config.resize, Some(224));
        assert_eq!(config.dtype, Some(InputDtype::F32));
        assert_eq!(config.input_range, InputRange::Unit);
    }

    #[test]
    fn u8_inputs_in_unit_range_are_rejected() {
        let args = Args::try_parse_from([
            "fidelity-lpips",
            "--input1",
            "a.png",
            "--input2",
            "b.png",
            "--dtype",
            "u8",
            "--input-range",
            "unit",
        ])
        .unwrap();

        let err = args.lpips_config().unwrap_err();

        assert!(err.to_string().contains("unit input range"), "{err}");
    }

    #[test]
    fn zero_resize_is_rejected() {
        let args = Args::try_parse_from([
            "fidelity-lpips",
            "--input1",
            "a.png",
            "--input2",
            "b.png",
            "--resize",
            "0",
        ])
        .unwrap();

        assert!(args.lpips_config().is_err());
    }

    #[test]
    fn prepare_follows_range_and_dtype() {
        let data = TensorData::new(vec![0u8, 51, 255], [1, 3, 1, 1]);

        let unit = prepare(data.clone(), &LpipsConfig::new().with_input_range(InputRange::Unit));
        let float = prepare(data.clone(), &LpipsConfig::new().with_dtype(Some(InputDtype::F32)));
        let bytes = prepare(data, &LpipsConfig::new());

        assert_eq!(unit.to_vec::<f32>().unwrap(), [0.0, 0.2, 1.0]);
        assert_eq!(float.to_vec::<f32>().unwrap(), [0.0, 51.0, 255.0]);
        assert_eq!(bytes.to_vec::<u8>().unwrap(), [0, 51, 255]);
    }
}

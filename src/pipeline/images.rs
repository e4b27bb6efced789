//! The image pipeline recompresses every file under the images source tree
//! into a mirrored output tree.
//!
//! PNG files lose colour depth: they are quantized to a palette and written
//! as indexed images. JPEG files are only re-encoded when a quality is
//! configured, since that costs detail.

use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use color_quant::NeuQuant;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageReader};
use rayon::prelude::*;
use thiserror::Error;

use super::svg::{self, SvgOptions};
use crate::config::{ImageConfig, PathEntry};
use crate::utils::{as_overhead, split_glob, write_artifact};

/// Errors that can occur when processing images.
#[derive(Debug, Error)]
pub enum ImageError {
    /// An I/O error occurred while reading or writing image files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred during image decoding or encoding.
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Couldn't write indexed PNG: {0}")]
    Png(#[from] png::EncodingError),

    #[error("Invalid glob pattern: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't read path matched by glob: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Matched file lies outside the glob root: {0}")]
    StripPrefix(#[from] std::path::StripPrefixError),
}

/// How a single file gets recompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Png,
    Jpeg,
    Svg,
    Other,
}

impl Kind {
    fn of(path: &Utf8Path) -> Self {
        match path.extension().map(str::to_ascii_lowercase).as_deref() {
            Some("png") => Kind::Png,
            Some("jpg" | "jpeg") => Kind::Jpeg,
            Some("svg") => Kind::Svg,
            _ => Kind::Other,
        }
    }
}

/// Totals of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageReport {
    pub files: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ImageReport {
    pub fn saved(&self) -> u64 {
        self.bytes_in.saturating_sub(self.bytes_out)
    }
}

pub struct ImagePipeline {
    paths: PathEntry,
    config: ImageConfig,
}

impl ImagePipeline {
    pub fn new(paths: PathEntry, config: ImageConfig) -> Self {
        Self { paths, config }
    }

    /// Every file matched by the input glob, with its path relative to the
    /// glob's static root.
    fn sources(&self) -> Result<Vec<(Utf8PathBuf, Utf8PathBuf)>, ImageError> {
        let (root, suffix) = split_glob(self.paths.input.as_str());
        let mut sources = Vec::new();

        for path in glob::glob(self.paths.input.as_str())? {
            let path = Utf8PathBuf::try_from(path?)?;
            if !path.is_file() {
                continue;
            }

            let relative = match suffix.as_str().is_empty() {
                true => Utf8PathBuf::from(path.file_name().unwrap_or_default()),
                false => path.strip_prefix(&root)?.to_path_buf(),
            };

            sources.push((path, relative));
        }

        Ok(sources)
    }

    /// Compresses all images and writes them to the output tree, replacing
    /// what is there.
    pub fn run(&self) -> Result<ImageReport, ImageError> {
        let s = Instant::now();
        let sources = self.sources()?;

        let sizes = sources
            .par_iter()
            .map(|(path, relative)| -> Result<(u64, u64), ImageError> {
                let input = fs::read(path)?;
                let output = compress(path, &input, &self.config)?;

                let dir = match relative.parent() {
                    Some(parent) => self.paths.output.join(parent),
                    None => self.paths.output.clone(),
                };
                let name = relative.file_name().unwrap_or_default();
                write_artifact(&dir, name, &output)?;

                tracing::debug!(
                    "{relative}: {} -> {} bytes",
                    input.len(),
                    output.len()
                );

                Ok((input.len() as u64, output.len() as u64))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let report = sizes.iter().fold(
            ImageReport {
                files: sizes.len(),
                ..ImageReport::default()
            },
            |mut acc, (i, o)| {
                acc.bytes_in += i;
                acc.bytes_out += o;
                acc
            },
        );

        tracing::info!(
            "Optimised {} images, saved {} bytes {}",
            report.files,
            report.saved(),
            as_overhead(s)
        );

        Ok(report)
    }
}

/// Recompresses a single file. Returns the original bytes when the result
/// would not be smaller.
fn compress(path: &Utf8Path, input: &[u8], config: &ImageConfig) -> Result<Vec<u8>, ImageError> {
    let output = match Kind::of(path) {
        Kind::Png => encode_png(input, config.png_colors)?,
        Kind::Jpeg => match config.jpeg_quality {
            Some(quality) => encode_jpeg(input, quality)?,
            None => return Ok(input.to_vec()),
        },
        Kind::Svg => clean_svg(input, &config.svg),
        Kind::Other => return Ok(input.to_vec()),
    };

    match output.len() < input.len() {
        true => Ok(output),
        false => Ok(input.to_vec()),
    }
}

fn decode(input: &[u8]) -> Result<image::DynamicImage, ImageError> {
    Ok(ImageReader::new(std::io::Cursor::new(input))
        .with_guessed_format()?
        .decode()?)
}

/// Quantizes to at most `colors` RGBA entries with NeuQuant and writes an
/// 8-bit indexed PNG, with a `tRNS` chunk when the palette has transparency.
fn encode_png(input: &[u8], colors: u16) -> Result<Vec<u8>, ImageError> {
    let img = decode(input)?.to_rgba8();
    let quant = NeuQuant::new(10, usize::from(colors.clamp(2, 256)), img.as_raw());

    let indices: Vec<u8> = img
        .as_raw()
        .chunks_exact(4)
        .map(|px| quant.index_of(px) as u8)
        .collect();

    let map = quant.color_map_rgba();
    let palette: Vec<u8> = map.chunks_exact(4).flat_map(|c| [c[0], c[1], c[2]]).collect();
    let alpha: Vec<u8> = map.chunks_exact(4).map(|c| c[3]).collect();

    let mut out = Vec::new();
    let mut encoder = png::Encoder::new(&mut out, img.width(), img.height());
    encoder.set_color(png::ColorType::Indexed);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(png::Compression::Best);
    encoder.set_adaptive_filter(png::AdaptiveFilterType::Adaptive);
    encoder.set_palette(palette);
    if alpha.iter().any(|&a| a != u8::MAX) {
        encoder.set_trns(alpha);
    }

    let mut writer = encoder.write_header()?;
    writer.write_image_data(&indices)?;
    writer.finish()?;

    Ok(out)
}

fn encode_jpeg(input: &[u8], quality: u8) -> Result<Vec<u8>, ImageError> {
    let img = decode(input)?.to_rgb8();
    let mut out = Vec::new();

    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).write_image(
        img.as_raw(),
        img.width(),
        img.height(),
        ExtendedColorType::Rgb8,
    )?;

    Ok(out)
}

fn clean_svg(input: &[u8], options: &SvgOptions) -> Vec<u8> {
    match std::str::from_utf8(input) {
        Ok(text) => svg::clean(text, options).into_bytes(),
        Err(_) => input.to_vec(),
    }
}

//! ONNX Runtime implementation of [`InferenceEngine`].
//!
//! Supports FP32 models (e.g. Real-ESRGAN, value range 0–255) and FP16
//! models (value range 0–1). Inputs are reflection-padded to multiples of
//! [`PAD_ALIGN`] and the padding is cropped off the output again.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use image::{Rgb, RgbImage};
use ndarray::{s, Array4, ArrayD, ArrayView4, Ix4};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::inference::{InferenceEngine, ModelLoader};

/// Model requires spatial dimensions to be multiples of this.
pub const PAD_ALIGN: usize = 4;

/// Pixel value range the model expects on its input and produces on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueRange {
    /// 0–1 for FP16 models, 0–255 otherwise.
    #[default]
    Auto,
    Unit,
    Byte,
}

impl ValueRange {
    pub fn max_value(self, is_fp16: bool) -> f32 {
        match self {
            Self::Unit => 1.0,
            Self::Byte => 255.0,
            Self::Auto if is_fp16 => 1.0,
            Self::Auto => 255.0,
        }
    }
}

impl std::str::FromStr for ValueRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "unit" | "0..1" | "0-1" => Ok(Self::Unit),
            "byte" | "0..255" | "0-255" => Ok(Self::Byte),
            other => Err(format!("unknown value range: {other}")),
        }
    }
}

impl std::fmt::Display for ValueRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Unit => write!(f, "unit"),
            Self::Byte => write!(f, "byte"),
        }
    }
}

/// Everything needed to build an [`OnnxEngine`]; doubles as its loader.
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    pub model_path: PathBuf,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
    pub value_range: ValueRange,
}

impl ModelLoader for OnnxLoader {
    fn load(&self) -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(OnnxEngine::load(self)?))
    }
}

pub struct OnnxEngine {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    value_max: f32,
}

impl OnnxEngine {
    pub fn load(loader: &OnnxLoader) -> Result<Self> {
        if !loader.model_path.is_file() {
            bail!("Model file not found: {}", loader.model_path.display());
        }

        debug!(
            model = %loader.model_path.display(),
            backend = %loader.backend,
            value_range = %loader.value_range,
            "Loading ONNX model"
        );

        let session = build_session(&SessionConfig {
            model_path: &loader.model_path,
            backend: loader.backend,
            trt_cache_dir: loader.trt_cache_dir.as_deref(),
        })?;

        let input = session.inputs().first().context("Model declares no inputs")?;
        let input_name = input.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .context("Model declares no outputs")?
            .name()
            .to_string();

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session,
            input_name,
            output_name,
            is_fp16,
            value_max: loader.value_range.max_value(is_fp16),
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }
}

impl InferenceEngine for OnnxEngine {
    fn run(&mut self, input: &RgbImage) -> Result<RgbImage> {
        let h = input.height() as usize;
        let w = input.width() as usize;
        let padded = pad_nchw(&rgb_to_nchw(input, self.value_max), h, w);
        let padded_h = padded.shape()[2];
        let padded_w = padded.shape()[3];

        let output = if self.is_fp16 {
            run_fp16(&mut self.session, &padded, &self.input_name, &self.output_name)?
        } else {
            run_fp32(&mut self.session, padded, &self.input_name, &self.output_name)?
        };
        let output = output
            .into_dimensionality::<Ix4>()
            .context("Model output is not a 4D tensor")?;

        let (channels, out_h, out_w) = (output.shape()[1], output.shape()[2], output.shape()[3]);
        if output.shape()[0] != 1 || channels != 3 {
            bail!("Unexpected model output shape {:?}", output.shape());
        }

        let crop_h = h * out_h / padded_h;
        let crop_w = w * out_w / padded_w;
        if crop_h == 0 || crop_w == 0 {
            bail!("Model output {out_w}x{out_h} is smaller than the {w}x{h} input");
        }

        nchw_to_rgb(
            output.slice(s![.., .., ..crop_h, ..crop_w]),
            self.value_max,
        )
    }
}

fn run_fp32(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let input_tensor = Tensor::from_array(input)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;
    Ok(output_view.to_owned())
}

fn run_fp16(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let f32_slice = input
        .as_slice()
        .context("input must be contiguous for f16 conversion")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_output = output_view.as_standard_layout();
    let fp16_slice = fp16_output
        .as_slice()
        .context("output must be contiguous for f16 conversion")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
}

/// Interleaved RGB8 → NCHW `[1,3,H,W]` scaled to `0..=value_max`.
fn rgb_to_nchw(image: &RgbImage, value_max: f32) -> Array4<f32> {
    let scale = value_max / 255.0;
    let (w, h) = (image.width() as usize, image.height() as usize);
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 * scale
    })
}

/// NCHW `[1,3,H,W]` in `0..=value_max` → RGB8, rounding and clamping.
fn nchw_to_rgb(arr: ArrayView4<'_, f32>, value_max: f32) -> Result<RgbImage> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    let scale = 255.0 / value_max;
    let to_u8 = |v: f32| (v * scale).round().clamp(0.0, 255.0) as u8;

    let width = u32::try_from(w).context("output width overflows u32")?;
    let height = u32::try_from(h).context("output height overflows u32")?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            to_u8(arr[[0, 0, y, x]]),
            to_u8(arr[[0, 1, y, x]]),
            to_u8(arr[[0, 2, y, x]]),
        ])
    }))
}

fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Symmetric reflection of `index` into `0..len`, valid for any overshoot.
fn mirror_index(index: usize, len: usize) -> usize {
    let period = 2 * len;
    let folded = index % period;
    if folded < len {
        folded
    } else {
        period - 1 - folded
    }
}

/// Reflection-pad NCHW array so H and W are multiples of [`PAD_ALIGN`].
fn pad_nchw(arr: &Array4<f32>, h: usize, w: usize) -> Array4<f32> {
    let pad_h = pad_amount(h);
    let pad_w = pad_amount(w);

    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    Array4::from_shape_fn((1, 3, h + pad_h, w + pad_w), |(n, c, y, x)| {
        arr[[n, c, mirror_index(y, h), mirror_index(x, w)]]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_nchw_layout() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([10, 20, 30]));
        image.put_pixel(1, 0, Rgb([40, 50, 60]));

        let nchw = rgb_to_nchw(&image, 255.0);
        assert_eq!(nchw.shape(), &[1, 3, 1, 2]);
        assert_eq!(nchw[[0, 0, 0, 0]], 10.0);
        assert_eq!(nchw[[0, 0, 0, 1]], 40.0);
        assert_eq!(nchw[[0, 1, 0, 1]], 50.0);
        assert_eq!(nchw[[0, 2, 0, 0]], 30.0);
    }

    #[test]
    fn test_rgb_to_nchw_unit_range() {
        let image = RgbImage::from_pixel(1, 1, Rgb([255, 0, 51]));
        let nchw = rgb_to_nchw(&image, 1.0);
        assert!((nchw[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((nchw[[0, 2, 0, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_pad_amount() {
        assert_eq!(pad_amount(4), 0);
        assert_eq!(pad_amount(5), 3);
        assert_eq!(pad_amount(6), 2);
        assert_eq!(pad_amount(7), 1);
        assert_eq!(pad_amount(512), 0);
    }

    #[test]
    fn test_pad_nchw_no_padding() {
        let arr = Array4::<f32>::ones((1, 3, 4, 8));
        let padded = pad_nchw(&arr, 4, 8);
        assert_eq!(padded, arr);
    }

    #[test]
    fn test_pad_nchw_reflects_edges() {
        let arr = Array4::from_shape_fn((1, 3, 2, 3), |(_, _, y, x)| (y * 10 + x) as f32);
        let padded = pad_nchw(&arr, 2, 3);

        assert_eq!(padded.shape(), &[1, 3, 4, 4]);
        assert_eq!(padded[[0, 0, 0, 3]], 2.0);
        assert_eq!(padded[[0, 0, 2, 0]], 10.0);
        assert_eq!(padded[[0, 0, 3, 1]], 1.0);
    }

    #[test]
    fn test_pad_nchw_single_pixel() {
        let arr = Array4::from_elem((1, 3, 1, 1), 7.0f32);
        let padded = pad_nchw(&arr, 1, 1);
        assert_eq!(padded.shape(), &[1, 3, 4, 4]);
        assert!(padded.iter().all(|v| *v == 7.0));
    }

    #[test]
    fn test_nchw_to_rgb_rounds_and_clamps() {
        let mut arr = Array4::<f32>::zeros((1, 3, 1, 2));
        arr[[0, 0, 0, 0]] = 300.0;
        arr[[0, 1, 0, 0]] = -5.0;
        arr[[0, 2, 0, 0]] = 127.6;
        arr[[0, 0, 0, 1]] = 1.0;

        let image = nchw_to_rgb(arr.view(), 255.0).expect("conversion succeeds");
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 128]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([1, 0, 0]));
    }

    #[test]
    fn test_unit_range_roundtrip() {
        let image = RgbImage::from_fn(3, 2, |x, y| Rgb([x as u8 * 40, y as u8 * 90, 200]));
        let nchw = rgb_to_nchw(&image, 1.0);
        let back = nchw_to_rgb(nchw.view(), 1.0).expect("conversion succeeds");
        assert_eq!(back, image);
    }

    #[test]
    fn test_value_range_resolution() {
        assert_eq!(ValueRange::Auto.max_value(true), 1.0);
        assert_eq!(ValueRange::Auto.max_value(false), 255.0);
        assert_eq!(ValueRange::Byte.max_value(true), 255.0);
        assert_eq!("0..1".parse::<ValueRange>(), Ok(ValueRange::Unit));
        assert!("0..65535".parse::<ValueRange>().is_err());
    }

    #[test]
    fn test_loader_rejects_missing_model_file() {
        let loader = OnnxLoader {
            model_path: PathBuf::from("/nonexistent/upscaler.onnx"),
            backend: InferenceBackend::Cpu,
            trt_cache_dir: None,
            value_range: ValueRange::Auto,
        };
        let Err(error) = loader.load() else {
            panic!("missing model must fail");
        };
        assert!(error.to_string().contains("/nonexistent/upscaler.onnx"));
    }
}

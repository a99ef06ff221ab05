use candle_core::{Device, Result, Tensor};
use ndarray::ArrayView4;

pub mod error;
pub mod modeling;
pub mod tapnet_predictor;

pub use error::TapNetError;
pub use modeling::backbones::feature_backbone::{
    ConvStemBackbone, ConvStemConfig, FeatureBackbone, VideoShape,
};
pub use modeling::tapnet_base::{TapNet, TapNetConfig, TapNetInputs, TapNetOutput};
pub use tapnet_predictor::{postprocess_occlusions, TapNetPredictor, TrackResult, VideoFeatures};

/// Converts `[time, height, width, 3]` RGB frames into a `[1, time, height, width, 3]`
/// video tensor with values in `[-1, 1]`.
pub fn preprocess_frames(frames: ArrayView4<u8>, device: &Device) -> Result<Tensor> {
    let (t, h, w, c) = frames.dim();
    if c != 3 {
        return Err(candle_core::Error::Msg(format!(
            "expected RGB frames, got {c} channels"
        )));
    }

    // logical order, so non-standard layouts are handled as well
    let data: Vec<f32> = frames
        .iter()
        .map(|&p| p as f32 / 255.0 * 2.0 - 1.0)
        .collect();

    Tensor::from_vec(data, (1, t, h, w, c), device)
}

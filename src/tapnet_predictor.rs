use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use log::info;

use crate::error::{Result, TapNetError};
use crate::modeling::backbones::feature_backbone::VideoShape;
use crate::modeling::tapnet_base::{TapNet, TapNetInputs, TapNetOutput};

/// Feature grid of one video, reusable across query sets.
#[derive(Debug, Clone)]
pub struct VideoFeatures {
    pub feature_grid: Tensor,
    pub video_shape: VideoShape,
}

impl VideoFeatures {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let s = self.video_shape;
        let dims = [s.batch, s.num_frames, s.height, s.width, s.channels].map(|v| v as u32);

        let mut tensors = HashMap::new();
        tensors.insert("feature_grid".to_string(), self.feature_grid.clone());
        tensors.insert("video_shape".to_string(), Tensor::new(&dims, &Device::Cpu)?);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let mut data = candle_core::safetensors::load(path, device)?;

        let feature_grid = data
            .remove("feature_grid")
            .ok_or_else(|| TapNetError::Config("feature cache has no feature_grid".to_string()))?;
        let dims = data
            .remove("video_shape")
            .ok_or_else(|| TapNetError::Config("feature cache has no video_shape".to_string()))?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?;

        let video_shape = match dims[..] {
            [batch, num_frames, height, width, channels] => VideoShape {
                batch: batch as usize,
                num_frames: num_frames as usize,
                height: height as usize,
                width: width as usize,
                channels: channels as usize,
            },
            _ => {
                return Err(TapNetError::ShapeMismatch(format!(
                    "video_shape must hold 5 sizes, got {:?}",
                    dims
                )))
            }
        };

        Ok(Self {
            feature_grid,
            video_shape,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrackResult {
    /// `[batch, num_queries, time, 2]`, `[x, y]` in video raster coordinates.
    pub tracks: Tensor,
    /// Raw occlusion logits, `[batch, num_queries, time]`.
    pub occlusion: Tensor,
    /// `[batch, num_queries, time]`, `1` where the point is visible.
    pub visibles: Tensor,
}

/// Visibility from occlusion logits, optionally combined with an expected-distance
/// logit of the same shape: visible when `(1 - σ(occ)) · (1 - σ(dist)) > 0.5`.
pub fn postprocess_occlusions(
    occlusions: &Tensor,
    expected_dist: Option<&Tensor>,
) -> candle_core::Result<Tensor> {
    let mut visible = candle_nn::ops::sigmoid(occlusions)?.affine(-1.0, 1.0)?;
    if let Some(dist) = expected_dist {
        visible = (visible * candle_nn::ops::sigmoid(dist)?.affine(-1.0, 1.0)?)?;
    }
    visible.gt(0.5)
}

pub struct TapNetPredictor {
    model: TapNet,
    query_chunk_size: usize,
}

impl TapNetPredictor {
    pub fn new(model: TapNet, query_chunk_size: usize) -> Result<Self> {
        if query_chunk_size == 0 {
            return Err(TapNetError::Config(
                "query_chunk_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            model,
            query_chunk_size,
        })
    }

    pub fn model(&self) -> &TapNet {
        &self.model
    }

    /// Runs the backbone once; the result can be tracked repeatedly with
    /// [`TapNetPredictor::track_cached`].
    pub fn compute_features(&self, video: &Tensor) -> Result<VideoFeatures> {
        let video_shape = VideoShape::from_video(video, None)
            .map_err(|e| TapNetError::ShapeMismatch(e.to_string()))?;
        let feature_grid = self.model.extract_features(video, false, None)?;
        info!(
            "computed feature grid {:?} for {} frame(s) of {}x{}",
            feature_grid.dims(),
            video_shape.num_frames,
            video_shape.height,
            video_shape.width
        );
        Ok(VideoFeatures {
            feature_grid,
            video_shape,
        })
    }

    /// Tracks `[batch, num_queries, 3]` `[t, y, x]` queries through `video`.
    pub fn track(&self, video: &Tensor, query_points: &Tensor) -> Result<TrackResult> {
        let inputs = TapNetInputs::tracking(query_points, self.query_chunk_size);
        let out = self.model.forward(video, &inputs)?;
        into_track_result(out)
    }

    pub fn track_cached(
        &self,
        features: &VideoFeatures,
        query_points: &Tensor,
    ) -> Result<TrackResult> {
        let inputs = TapNetInputs::tracking(query_points, self.query_chunk_size);
        let out =
            self.model
                .forward_from_grid(&features.feature_grid, features.video_shape, &inputs)?;
        into_track_result(out)
    }
}

fn into_track_result(out: TapNetOutput) -> Result<TrackResult> {
    let (tracks, occlusion) = match (out.tracks, out.occlusion) {
        (Some(tracks), Some(occlusion)) => (tracks, occlusion),
        _ => {
            return Err(TapNetError::Config(
                "forward pass did not produce tracks".to_string(),
            ))
        }
    };
    let visibles = postprocess_occlusions(&occlusion, None)?;
    Ok(TrackResult {
        tracks,
        occlusion,
        visibles,
    })
}

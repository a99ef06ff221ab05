use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::Tensor;
use candle_nn::VarBuilder;
use log::{debug, warn};

use crate::error::{Result, TapNetError};
use crate::modeling::backbones::feature_backbone::{FeatureBackbone, VideoShape};
use crate::modeling::cost_volume::{CostVolumeGrid, CostVolumeHead};
use crate::modeling::interpolation::interp_query_features;
use crate::modeling::soft_argmax::SOFT_ARGMAX_THRESHOLD;
use crate::modeling::tapnet_utils::l2_normalize;
use crate::modeling::transforms::{convert_grid_coordinates, CoordinateFormat};

#[derive(Debug, Clone)]
pub struct TapNetConfig {
    /// Downsampling factor between the video and the feature grid.
    pub feature_grid_stride: usize,
    /// Channel groups correlated independently in the cost volume.
    pub num_heads: usize,
    pub softargmax_threshold: f64,
    pub hidden_channels: usize,
    pub occlusion_channels: usize,
}

impl Default for TapNetConfig {
    fn default() -> Self {
        Self {
            feature_grid_stride: 8,
            num_heads: 4,
            softargmax_threshold: SOFT_ARGMAX_THRESHOLD,
            hidden_channels: 16,
            occlusion_channels: 32,
        }
    }
}

/// Per-call options of [`TapNet::forward`].
#[derive(Debug, Clone)]
pub struct TapNetInputs<'a> {
    pub is_training: bool,
    /// Frames per clip when the video is given as 4D `[batch * time, h, w, c]`.
    pub num_frames: Option<usize>,
    /// `[batch, num_queries, 3]` points, each `[t, y, x]` in video raster coordinates.
    pub query_points: Option<&'a Tensor>,
    pub compute_regression: bool,
    /// Queries per cost volume; required when `compute_regression` is set.
    pub query_chunk_size: Option<usize>,
    pub get_query_feats: bool,
    /// Precomputed feature grid; skips the backbone when set.
    pub feature_grid: Option<&'a Tensor>,
}

impl<'a> TapNetInputs<'a> {
    pub fn tracking(query_points: &'a Tensor, query_chunk_size: usize) -> Self {
        Self {
            is_training: false,
            num_frames: None,
            query_points: Some(query_points),
            compute_regression: true,
            query_chunk_size: Some(query_chunk_size),
            get_query_feats: false,
            feature_grid: None,
        }
    }

    pub fn features_only() -> Self {
        Self {
            is_training: false,
            num_frames: None,
            query_points: None,
            compute_regression: false,
            query_chunk_size: None,
            get_query_feats: false,
            feature_grid: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TapNetOutput {
    /// `[batch, time, height / stride, width / stride, channels]`, unit-norm cells.
    pub feature_grid: Tensor,
    /// `[batch, num_queries, channels]`, when requested.
    pub query_feats: Option<Tensor>,
    /// `[batch, num_queries, time]` logits, higher means more likely occluded.
    pub occlusion: Option<Tensor>,
    /// `[batch, num_queries, time, 2]`, `[x, y]` in video raster coordinates.
    pub tracks: Option<Tensor>,
}

pub struct TapNet {
    backbone: Box<dyn FeatureBackbone>,
    cost_volume_head: CostVolumeHead,
    config: TapNetConfig,
    cost_volume_calls: AtomicUsize,
}

impl TapNet {
    pub fn new(
        backbone: Box<dyn FeatureBackbone>,
        config: TapNetConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if config.num_heads == 0 || config.feature_grid_stride == 0 {
            return Err(TapNetError::Config(format!(
                "num_heads and feature_grid_stride must be positive: {:?}",
                config
            )));
        }
        if backbone.channels() % config.num_heads != 0 {
            return Err(TapNetError::Config(format!(
                "backbone channels {} are not divisible into {} heads",
                backbone.channels(),
                config.num_heads
            )));
        }

        let cost_volume_head = CostVolumeHead::new(
            config.num_heads,
            config.hidden_channels,
            config.occlusion_channels,
            config.softargmax_threshold,
            vb,
        )?;

        Ok(Self {
            backbone,
            cost_volume_head,
            config,
            cost_volume_calls: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &TapNetConfig {
        &self.config
    }

    /// Number of cost volumes evaluated so far (one per query chunk).
    pub fn cost_volume_calls(&self) -> usize {
        self.cost_volume_calls.load(Ordering::Relaxed)
    }

    /// Runs the backbone and L2-normalizes every feature cell.
    pub fn extract_features(
        &self,
        video: &Tensor,
        is_training: bool,
        num_frames: Option<usize>,
    ) -> Result<Tensor> {
        let latent = self.backbone.extract(
            video,
            is_training,
            self.config.feature_grid_stride,
            num_frames,
        )?;
        Ok(l2_normalize(&latent, 1e-12)?)
    }

    pub fn forward(&self, video: &Tensor, inputs: &TapNetInputs) -> Result<TapNetOutput> {
        self.check_inputs(inputs)?;
        let shape = VideoShape::from_video(video, inputs.num_frames).map_err(shape_mismatch)?;

        let feature_grid = match inputs.feature_grid {
            Some(grid) => grid.clone(),
            None => self.extract_features(video, inputs.is_training, inputs.num_frames)?,
        };

        self.forward_from_grid(&feature_grid, shape, inputs)
    }

    /// Forward pass from an already computed feature grid of a video with `shape`.
    pub fn forward_from_grid(
        &self,
        feature_grid: &Tensor,
        shape: VideoShape,
        inputs: &TapNetInputs,
    ) -> Result<TapNetOutput> {
        let chunk_size = self.check_inputs(inputs)?;
        let (b, t, h, w, c) = feature_grid.dims5().map_err(shape_mismatch)?;
        if b != shape.batch || t != shape.num_frames {
            return Err(TapNetError::ShapeMismatch(format!(
                "feature grid {:?} does not match video {:?}",
                feature_grid.dims(),
                shape
            )));
        }
        let d = self.config.num_heads;
        if c % d != 0 {
            return Err(TapNetError::ShapeMismatch(format!(
                "{c} feature channels are not divisible into {d} heads"
            )));
        }
        debug!("feature grid {:?} for video {:?}", feature_grid.dims(), shape);

        let mut out = TapNetOutput {
            feature_grid: feature_grid.clone(),
            query_feats: None,
            occlusion: None,
            tracks: None,
        };
        let query_points = match inputs.query_points {
            Some(q) => q,
            None => return Ok(out),
        };
        let (qb, num_queries, coords) = query_points.dims3().map_err(shape_mismatch)?;
        if qb != b || coords != 3 {
            return Err(TapNetError::ShapeMismatch(format!(
                "query points {:?} do not match feature grid {:?}",
                query_points.dims(),
                feature_grid.dims()
            )));
        }

        let position_in_grid = convert_grid_coordinates(
            query_points,
            &shape.tyx(),
            &[t, h, w],
            CoordinateFormat::Tyx,
        )?;
        let interp_features = interp_query_features(feature_grid, &position_in_grid)?;
        if inputs.get_query_feats {
            out.query_feats = Some(interp_features.clone());
        }
        let chunk_size = match chunk_size {
            Some(chunk_size) => chunk_size,
            None => return Ok(out),
        };
        if num_queries == 0 {
            warn!("no query points to track");
            let device = feature_grid.device();
            out.occlusion = Some(Tensor::zeros((b, 0, t), feature_grid.dtype(), device)?);
            out.tracks = Some(Tensor::zeros((b, 0, t, 2), feature_grid.dtype(), device)?);
            return Ok(out);
        }
        debug!(
            "tracking {} queries in {} chunk(s) of {}",
            num_queries,
            num_queries.div_ceil(chunk_size),
            chunk_size
        );

        // channels split as (c / heads, heads), heads innermost; the grid is laid out once
        let grid = CostVolumeGrid::new(&feature_grid.reshape(&[b, t, h, w, c / d, d][..])?)?;
        let interp_features_heads = interp_features.reshape((b, num_queries, c / d, d))?;
        let mut all_occ = Vec::new();
        let mut all_pts = Vec::new();
        for start in (0..num_queries).step_by(chunk_size) {
            let len = chunk_size.min(num_queries - start);
            self.cost_volume_calls.fetch_add(1, Ordering::Relaxed);
            let (points, occlusion) = self.cost_volume_head.tracks_from_cost_volume(
                &interp_features_heads.narrow(1, start, len)?,
                &grid,
                &query_points.narrow(1, start, len)?,
                shape.tyx(),
            )?;
            all_occ.push(occlusion);
            all_pts.push(points);
        }
        out.occlusion = Some(Tensor::cat(&all_occ, 1)?);
        out.tracks = Some(Tensor::cat(&all_pts, 1)?);

        Ok(out)
    }

    /// Validates `inputs`, returning the chunk size when tracks are requested.
    fn check_inputs(&self, inputs: &TapNetInputs) -> Result<Option<usize>> {
        if (inputs.compute_regression || inputs.get_query_feats) && inputs.query_points.is_none()
        {
            return Err(TapNetError::Config(
                "query points are required for tracks or query features".to_string(),
            ));
        }
        if !inputs.compute_regression {
            return Ok(None);
        }
        match inputs.query_chunk_size {
            None => Err(TapNetError::Config(
                "query_chunk_size must be set when computing tracks".to_string(),
            )),
            Some(0) => Err(TapNetError::Config(
                "query_chunk_size must be positive".to_string(),
            )),
            Some(chunk_size) => Ok(Some(chunk_size)),
        }
    }
}

fn shape_mismatch(e: candle_core::Error) -> TapNetError {
    TapNetError::ShapeMismatch(e.to_string())
}

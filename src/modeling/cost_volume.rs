use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::modeling::soft_argmax::heatmaps_to_points;
use crate::modeling::tapnet_utils::{contract, spatial_rms, spatial_softmax, Conv2dSame};

/// Feature grid heads laid out once as `[batch, heads, channels, time, height, width]`,
/// the operand order of the correlation matmul, so query chunks share one buffer.
pub struct CostVolumeGrid {
    grid: Tensor,
}

impl CostVolumeGrid {
    /// `feature_grid_heads` is `[batch, time, height, width, channels, heads]`.
    pub fn new(feature_grid_heads: &Tensor) -> Result<Self> {
        if feature_grid_heads.rank() != 6 {
            return Err(candle_core::Error::Msg(format!(
                "expected [b, t, h, w, c, heads] feature grid, got {:?}",
                feature_grid_heads.dims()
            )));
        }
        let grid = feature_grid_heads
            .permute(vec![0, 5, 4, 1, 2, 3])?
            .contiguous()?;
        Ok(Self { grid })
    }

    /// Correlates `[batch, num_queries, channels, heads]` query features with every
    /// grid cell of every frame, giving `[time, batch, num_queries, height, width, heads]`.
    pub fn correlate(&self, interp_feature_heads: &Tensor) -> Result<Tensor> {
        contract("bncd,bdcthw->tbnhwd", interp_feature_heads, &self.grid)
    }
}

/// One-shot correlation of `[batch, num_queries, channels, heads]` query features with a
/// `[batch, time, height, width, channels, heads]` grid.
///
/// Returns `[time, batch, num_queries, height, width, heads]`.
pub fn cost_volume(interp_feature_heads: &Tensor, feature_grid_heads: &Tensor) -> Result<Tensor> {
    CostVolumeGrid::new(feature_grid_heads)?.correlate(interp_feature_heads)
}

/// Learned layers turning a cost volume into tracks and occlusion logits.
///
/// Both branches share the first `1x3x3` convolution. The track branch reduces
/// to a single channel and decodes a spatial softmax with soft argmax; the
/// occlusion branch downsamples, takes the spatial RMS and projects to one logit.
pub struct CostVolumeHead {
    hid1: Conv2dSame,
    hid2: Conv2dSame,
    hid3: Conv2dSame,
    occ_out: Linear,
    num_heads: usize,
    softargmax_threshold: f64,
}

impl CostVolumeHead {
    pub fn new(
        num_heads: usize,
        hidden_channels: usize,
        occlusion_channels: usize,
        softargmax_threshold: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hid1 = Conv2dSame::new(
            num_heads,
            hidden_channels,
            3,
            1,
            vb.pp("cost_volume_regression_1"),
        )?;
        let hid2 = Conv2dSame::new(hidden_channels, 1, 3, 1, vb.pp("cost_volume_regression_2"))?;
        let hid3 = Conv2dSame::new(
            hidden_channels,
            occlusion_channels,
            3,
            2,
            vb.pp("cost_volume_occlusion_1"),
        )?;
        let occ_out = candle_nn::linear(occlusion_channels, 1, vb.pp("occlusion_out"))?;

        Ok(Self {
            hid1,
            hid2,
            hid3,
            occ_out,
            num_heads,
            softargmax_threshold,
        })
    }

    /// Runs both branches for one chunk of queries.
    ///
    /// `query_points` is the matching `[batch, chunk, 3]` slice of `[t, y, x]` queries
    /// and `image_size` the `(time, height, width)` of the video. Returns tracks
    /// `[batch, chunk, time, 2]` (`[x, y]`) and occlusion logits `[batch, chunk, time]`.
    pub fn tracks_from_cost_volume(
        &self,
        interp_feature_heads: &Tensor,
        grid: &CostVolumeGrid,
        query_points: &Tensor,
        image_size: [usize; 3],
    ) -> Result<(Tensor, Tensor)> {
        let cost = grid.correlate(interp_feature_heads)?;
        let (t, b, n, h, w, d) = match *cost.dims() {
            [t, b, n, h, w, d] => (t, b, n, h, w, d),
            _ => {
                return Err(candle_core::Error::Msg(format!(
                    "unexpected cost volume shape {:?}",
                    cost.dims()
                )))
            }
        };
        if d != self.num_heads {
            return Err(candle_core::Error::Msg(format!(
                "cost volume has {d} heads, head expects {}",
                self.num_heads
            )));
        }

        // every (frame, query) pair is an independent image for the 1x3x3 convolutions
        let cost = cost
            .reshape((t * b * n, h, w, d))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;

        let occlusion = self.hid1.forward(&cost)?.relu()?;

        let pos = self.hid2.forward(&occlusion)?;
        let pos = spatial_softmax(&pos)?
            .reshape((t, b, n, h, w))?
            .permute((1, 2, 0, 3, 4))?;
        let points = heatmaps_to_points(
            &pos,
            image_size,
            self.softargmax_threshold,
            Some(query_points),
        )?;

        let occlusion = self.hid3.forward(&occlusion)?;
        let occlusion = spatial_rms(&occlusion, 1e-8)?;
        let occlusion = self
            .occ_out
            .forward(&occlusion)?
            .reshape((t, b, n))?
            .permute((1, 2, 0))?
            .contiguous()?;

        Ok((points, occlusion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_cost_volume_peaks_at_matching_cell() {
        // one query, one head, 2-channel features; only cell (t=1, y=0, x=2) matches
        let (t, h, w, c) = (2, 2, 3, 2);
        let mut grid = vec![0.0f32; t * h * w * c];
        for cell in 0..t * h * w {
            grid[cell * c + 1] = 1.0;
        }
        let hit = (h * w + 2) * c;
        grid[hit] = 1.0;
        grid[hit + 1] = 0.0;
        let grid = Tensor::from_vec(grid, &[1, t, h, w, c, 1], &Device::Cpu).unwrap();
        let query = Tensor::new(&[[[[1.0f32], [0.0]]]], &Device::Cpu).unwrap();

        let cv = cost_volume(&query, &grid).unwrap();
        assert_eq!(cv.dims(), &[t, 1, 1, h, w, 1]);
        let values = cv.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (i, v) in values.iter().enumerate() {
            let expected = if i == h * w + 2 { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_grid_layout_matches_direct_contraction() {
        let (b, n, t, h, w, c, d) = (2, 3, 2, 3, 4, 5, 2);
        let queries = Tensor::randn(0f32, 1.0, (b, n, c, d), &Device::Cpu).unwrap();
        let grid = Tensor::randn(0f32, 1.0, &[b, t, h, w, c, d], &Device::Cpu).unwrap();

        let direct = contract("bncd,bthwcd->tbnhwd", &queries, &grid).unwrap();
        let prepared = CostVolumeGrid::new(&grid).unwrap();
        // chunks correlate against the same prepared grid
        let chunked = Tensor::cat(
            &[
                prepared.correlate(&queries.narrow(1, 0, 2).unwrap()).unwrap(),
                prepared.correlate(&queries.narrow(1, 2, 1).unwrap()).unwrap(),
            ],
            2,
        )
        .unwrap();
        assert_eq!(chunked.dims(), direct.dims());

        let want = direct.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let got = chunked.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in got.iter().zip(want.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_head_output_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = CostVolumeHead::new(4, 16, 32, 5.0, vb).unwrap();

        let (b, n, t, h, w, c) = (2, 3, 4, 5, 6, 8);
        let queries = Tensor::randn(0f32, 1.0, (b, n, c, 4), &Device::Cpu).unwrap();
        let grid = Tensor::randn(0f32, 1.0, &[b, t, h, w, c, 4], &Device::Cpu).unwrap();
        let grid = CostVolumeGrid::new(&grid).unwrap();
        let query_points = Tensor::zeros((b, n, 3), DType::F32, &Device::Cpu).unwrap();

        let (points, occlusion) = head
            .tracks_from_cost_volume(&queries, &grid, &query_points, [t, h * 8, w * 8])
            .unwrap();
        assert_eq!(points.dims(), &[b, n, t, 2]);
        assert_eq!(occlusion.dims(), &[b, n, t]);
        let values = occlusion.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_head_count_mismatch_fails() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let head = CostVolumeHead::new(4, 16, 32, 5.0, vb).unwrap();
        let queries = Tensor::zeros((1, 1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let grid = Tensor::zeros(&[1, 2, 3, 3, 4, 2], DType::F32, &Device::Cpu).unwrap();
        let grid = CostVolumeGrid::new(&grid).unwrap();
        let query_points = Tensor::zeros((1, 1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(head
            .tracks_from_cost_volume(&queries, &grid, &query_points, [2, 24, 24])
            .is_err());
    }
}

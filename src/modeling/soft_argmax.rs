use candle_core::{DType, Result, Tensor, D};

use crate::modeling::tapnet_utils::round_half_even;
use crate::modeling::transforms::{convert_grid_coordinates, tyx_to_xy, CoordinateFormat};

/// Default radius (in grid cells) of the soft-argmax window.
pub const SOFT_ARGMAX_THRESHOLD: f64 = 5.0;

/// Soft argmax of a single `[height, width]` heatmap, returned as `[x, y]` in grid units.
pub fn soft_argmax_heatmap(heatmap: &Tensor, threshold: f64) -> Result<Tensor> {
    let (_h, _w) = heatmap.dims2()?;
    soft_argmax_heatmaps(heatmap, threshold)
}

/// Soft argmax over the last two axes of `[..., height, width]` heatmaps.
///
/// The hard argmax (first maximum in row-major order) seeds a window of cells
/// closer than `threshold`; the result is the heatmap-weighted mean coordinate of
/// that window, as `[..., 2]` holding `[x, y]` in grid units. Heatmaps are expected
/// to be non-negative and to sum to one.
pub fn soft_argmax_heatmaps(heatmaps: &Tensor, threshold: f64) -> Result<Tensor> {
    let dims = heatmaps.dims().to_vec();
    let rank = dims.len();
    if rank < 2 {
        return Err(candle_core::Error::Msg(format!(
            "soft argmax needs [..., h, w] heatmaps, got {:?}",
            dims
        )));
    }
    let (h, w) = (dims[rank - 2], dims[rank - 1]);
    if h == 0 || w == 0 {
        return Err(candle_core::Error::Msg(format!(
            "soft argmax over an empty heatmap {:?}",
            dims
        )));
    }
    let lead = &dims[..rank - 2];
    let m: usize = lead.iter().product();
    let device = heatmaps.device();

    let flat = heatmaps.reshape((m, h * w))?.to_dtype(DType::F32)?;

    let grid_x: Vec<f32> = (0..h * w).map(|i| (i % w) as f32).collect();
    let grid_y: Vec<f32> = (0..h * w).map(|i| (i / w) as f32).collect();
    let grid_x = Tensor::from_vec(grid_x, (1, h * w), device)?;
    let grid_y = Tensor::from_vec(grid_y, (1, h * w), device)?;

    // seed cell of each heatmap, [m, 1]
    let argmax = flat.argmax_keepdim(D::Minus1)?.to_dtype(DType::F32)?;
    let seed_y = (&argmax / w as f64)?.floor()?;
    let seed_x = (argmax - (&seed_y * w as f64)?)?;

    let dx = grid_x.broadcast_sub(&seed_x)?;
    let dy = grid_y.broadcast_sub(&seed_y)?;
    let valid = (dx.sqr()? + dy.sqr()?)?
        .lt(threshold * threshold)?
        .to_dtype(DType::F32)?;

    let weights = (valid * &flat)?;
    let sum_of_weights = weights.sum_keepdim(D::Minus1)?.maximum(1e-12)?;
    let x = weights
        .broadcast_mul(&grid_x)?
        .sum_keepdim(D::Minus1)?
        .div(&sum_of_weights)?;
    let y = weights
        .broadcast_mul(&grid_y)?
        .sum_keepdim(D::Minus1)?
        .div(&sum_of_weights)?;

    let mut out_shape = lead.to_vec();
    out_shape.push(2);
    Tensor::cat(&[&x, &y], D::Minus1)?
        .reshape(out_shape)?
        .to_dtype(heatmaps.dtype())
}

/// Decodes `[batch, num_points, time, height, width]` heatmaps into tracks.
///
/// `image_size` is `(time, height, width)` of the video the feature grid was
/// extracted from; the returned `[batch, num_points, time, 2]` points are `[x, y]`
/// in that video's raster coordinates.
///
/// When `query_points` (`[batch, num_points, 3]`, `[t, y, x]` in video coordinates)
/// are given, each track reproduces its query verbatim on the query frame. The
/// override is a blend `points * (1 - mask) + query * mask`, not an indexed write.
pub fn heatmaps_to_points(
    all_pairs_softmax: &Tensor,
    image_size: [usize; 3],
    threshold: f64,
    query_points: Option<&Tensor>,
) -> Result<Tensor> {
    let (b, n, t, h, w) = all_pairs_softmax.dims5()?;
    let [frames, height, width] = image_size;
    if t != frames {
        return Err(candle_core::Error::Msg(format!(
            "heatmaps cover {t} frames but the video has {frames}"
        )));
    }

    let out_points = soft_argmax_heatmaps(all_pairs_softmax, threshold)?;
    // out_points are [x, y]: rescale by (width, height)
    let out_points =
        convert_grid_coordinates(&out_points, &[w, h], &[width, height], CoordinateFormat::Xy)?;

    let query_points = match query_points {
        Some(q) => q,
        None => return Ok(out_points),
    };
    let (qb, qn, _) = query_points.dims3()?;
    if (qb, qn) != (b, n) {
        return Err(candle_core::Error::Msg(format!(
            "query points {:?} do not match heatmaps {:?}",
            query_points.dims(),
            all_pairs_softmax.dims()
        )));
    }

    let query_frame = convert_grid_coordinates(
        query_points,
        &[frames, height, width],
        &[t, h, w],
        CoordinateFormat::Tyx,
    )?
    .narrow(2, 0, 1)?;
    let frame_ids = Tensor::arange(0u32, t as u32, query_points.device())?
        .to_dtype(query_points.dtype())?
        .reshape((1, 1, t))?;
    let is_query_point = round_half_even(&query_frame)?
        .broadcast_as((b, n, t))?
        .eq(&frame_ids.broadcast_as((b, n, t))?)?
        .to_dtype(out_points.dtype())?
        .unsqueeze(3)?;

    let query_xy = tyx_to_xy(query_points)?
        .to_dtype(out_points.dtype())?
        .unsqueeze(2)?;
    let keep = is_query_point.affine(-1.0, 1.0)?;

    out_points.broadcast_mul(&keep)? + query_xy.broadcast_mul(&is_query_point)?
}

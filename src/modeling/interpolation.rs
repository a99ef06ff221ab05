use candle_core::{DType, Device, Result, Tensor};
use ndarray::{s, Array3, ArrayD, ArrayView2, Ix3, Ix5, IxDyn};

/// Linear interpolation stencil along one axis of `size` samples.
///
/// Returns `(lower, upper, weight_of_upper)`. Coordinates outside the axis are
/// clamped first, so out-of-range samples take the nearest edge value.
fn linear_stencil(coord: f32, size: usize) -> (usize, usize, f32) {
    let last = size.saturating_sub(1);
    let coord = coord.clamp(0.0, last as f32);
    let lo = coord.floor() as usize;
    let hi = (lo + 1).min(last);
    (lo, hi, coord - lo as f32)
}

/// Samples a 2D field at fractional `[y, x]` points (order 1, nearest-edge).
///
/// An empty field yields zeros.
pub fn bilinear_sample(field: &ArrayView2<f32>, points: &[[f32; 2]]) -> Vec<f32> {
    let (h, w) = field.dim();
    if h == 0 || w == 0 {
        return vec![0.0; points.len()];
    }
    points
        .iter()
        .map(|&[y, x]| {
            let (y0, y1, dy) = linear_stencil(y, h);
            let (x0, x1, dx) = linear_stencil(x, w);

            let f00 = field[[y0, x0]];
            let f01 = field[[y0, x1]];
            let f10 = field[[y1, x0]];
            let f11 = field[[y1, x1]];

            (1.0 - dx) * (1.0 - dy) * f00
                + dx * (1.0 - dy) * f01
                + (1.0 - dx) * dy * f10
                + dx * dy * f11
        })
        .collect()
}

/// Samples one feature vector per query point.
///
/// * `feature_grid` - `[batch, time, height, width, channels]`
/// * `position_in_grid` - `[batch, num_points, 3]`, each `[t, y, x]` in grid units
///
/// Returns `[batch, num_points, channels]`. Every channel plane is sampled with
/// [`bilinear_sample`]; a fractional frame is blended linearly between its two
/// neighbouring frames.
pub fn interp_query_features(feature_grid: &Tensor, position_in_grid: &Tensor) -> Result<Tensor> {
    let (b, t, h, w, c) = feature_grid.dims5()?;
    let (pb, n, coords) = position_in_grid.dims3()?;
    if pb != b || coords != 3 {
        return Err(candle_core::Error::Msg(format!(
            "query positions {:?} do not match feature grid {:?}",
            position_in_grid.dims(),
            feature_grid.dims()
        )));
    }
    if t == 0 || h == 0 || w == 0 {
        return Err(candle_core::Error::Msg(format!(
            "cannot sample an empty feature grid {:?}",
            feature_grid.dims()
        )));
    }

    let grid = tensor_to_ndarray(feature_grid)?.into_dimensionality::<Ix5>().map_err(shape_err)?;
    let points = tensor_to_ndarray(position_in_grid)?
        .into_dimensionality::<Ix3>()
        .map_err(shape_err)?;

    let mut out = Array3::<f32>::zeros((b, n, c));
    for bi in 0..b {
        // (query, weight) taps per frame; each query touches at most two frames
        let mut taps: Vec<Vec<(usize, f32)>> = vec![Vec::new(); t];
        let mut yx = Vec::with_capacity(n);
        for qi in 0..n {
            let (t0, t1, dt) = linear_stencil(points[[bi, qi, 0]], t);
            taps[t0].push((qi, 1.0 - dt));
            taps[t1].push((qi, dt));
            yx.push([points[[bi, qi, 1]], points[[bi, qi, 2]]]);
        }

        for (ti, frame_taps) in taps.iter().enumerate() {
            if frame_taps.is_empty() {
                continue;
            }
            let frame_points: Vec<[f32; 2]> = frame_taps.iter().map(|&(qi, _)| yx[qi]).collect();
            for ci in 0..c {
                let field = grid.slice(s![bi, ti, .., .., ci]);
                let samples = bilinear_sample(&field, &frame_points);
                for (&(qi, weight), value) in frame_taps.iter().zip(samples) {
                    out[[bi, qi, ci]] += weight * value;
                }
            }
        }
    }

    let data: Vec<f32> = out.into_iter().collect();
    Tensor::from_vec(data, (b, n, c), feature_grid.device())?.to_dtype(feature_grid.dtype())
}

fn shape_err<E: std::fmt::Display>(e: E) -> candle_core::Error {
    candle_core::Error::Msg(format!("unexpected array rank: {e}"))
}

pub(crate) fn tensor_to_ndarray(t: &Tensor) -> Result<ArrayD<f32>> {
    let t = t.to_device(&Device::Cpu)?;

    let t = match t.dtype() {
        DType::F32 => t,
        DType::F16 | DType::BF16 | DType::F64 | DType::U8 => t.to_dtype(DType::F32)?,
        dt => {
            return Err(candle_core::Error::Msg(format!(
                "Unsupported dtype {:?}",
                dt
            )))
        }
    };

    let data = t.flatten_all()?.to_vec1::<f32>()?;
    ArrayD::from_shape_vec(IxDyn(t.dims()), data).map_err(shape_err)
}

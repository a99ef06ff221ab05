use candle_core::{Result, Tensor};

/// Axis layout of a coordinate tensor's last dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateFormat {
    /// `[x, y]` points; grid sizes are given as `(width, height)`.
    Xy,
    /// `[t, y, x]` points; grid sizes are given as `(time, height, width)`.
    Tyx,
}

impl CoordinateFormat {
    pub fn rank(&self) -> usize {
        match self {
            CoordinateFormat::Xy => 2,
            CoordinateFormat::Tyx => 3,
        }
    }
}

/// Rescales coordinates from one grid to another, independently per axis.
///
/// `coords` has shape `[..., rank]`. The frame axis of `Tyx` coordinates is
/// never rescaled: both grids must have the same number of frames.
pub fn convert_grid_coordinates(
    coords: &Tensor,
    input_grid_size: &[usize],
    output_grid_size: &[usize],
    format: CoordinateFormat,
) -> Result<Tensor> {
    let rank = format.rank();
    if input_grid_size.len() != rank || output_grid_size.len() != rank {
        return Err(candle_core::Error::Msg(format!(
            "{:?} coordinates need {} grid sizes, got {:?} -> {:?}",
            format, rank, input_grid_size, output_grid_size
        )));
    }
    if input_grid_size.iter().any(|&s| s == 0) {
        return Err(candle_core::Error::Msg(format!(
            "input grid {:?} has an empty axis",
            input_grid_size
        )));
    }
    let last = coords.dims().last().copied().unwrap_or(0);
    if last != rank {
        return Err(candle_core::Error::Msg(format!(
            "{:?} coordinates need a trailing axis of {}, got shape {:?}",
            format,
            rank,
            coords.dims()
        )));
    }
    if format == CoordinateFormat::Tyx && input_grid_size[0] != output_grid_size[0] {
        return Err(candle_core::Error::Msg(format!(
            "converting frame count is not supported ({} -> {})",
            input_grid_size[0], output_grid_size[0]
        )));
    }

    let scale: Vec<f32> = input_grid_size
        .iter()
        .zip(output_grid_size.iter())
        .map(|(&input, &output)| output as f32 / input as f32)
        .collect();
    let scale = Tensor::from_vec(scale, rank, coords.device())?.to_dtype(coords.dtype())?;
    coords.broadcast_mul(&scale)
}

/// Reorders `[t, y, x]` query points into `[x, y]` track coordinates.
pub fn tyx_to_xy(points: &Tensor) -> Result<Tensor> {
    let last = points.rank().saturating_sub(1);
    if points.rank() == 0 || points.dim(last)? != 3 {
        return Err(candle_core::Error::Msg(format!(
            "expected [..., 3] (t, y, x) points, got {:?}",
            points.dims()
        )));
    }
    let x = points.narrow(last, 2, 1)?;
    let y = points.narrow(last, 1, 1)?;
    Tensor::cat(&[&x, &y], last)
}

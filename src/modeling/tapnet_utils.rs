use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

/// Two-operand tensor contraction over named axes, e.g. `"bncd,bthwcd->tbnhwd"`.
///
/// Each character names one axis. Axes present in both operands and in the
/// output are batch axes, axes present in both operands but not in the output are
/// summed over, and every other axis must appear in the output.
pub fn contract(spec: &str, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let bad = |msg: String| candle_core::Error::Msg(format!("contract '{spec}': {msg}"));

    let (inputs, out) = spec
        .split_once("->")
        .ok_or_else(|| bad("missing '->'".to_string()))?;
    let (l, r) = inputs
        .split_once(',')
        .ok_or_else(|| bad("expected two operands".to_string()))?;
    let l: Vec<char> = l.trim().chars().collect();
    let r: Vec<char> = r.trim().chars().collect();
    let o: Vec<char> = out.trim().chars().collect();

    if l.len() != lhs.rank() || r.len() != rhs.rank() {
        return Err(bad(format!(
            "operand ranks {:?} / {:?} do not match",
            lhs.dims(),
            rhs.dims()
        )));
    }
    for axes in [&l, &r, &o] {
        if axes.iter().enumerate().any(|(i, c)| axes[..i].contains(c)) {
            return Err(bad("repeated axis within one term".to_string()));
        }
    }

    let index_of = |axes: &[char], c: char| -> Result<usize> {
        axes.iter()
            .position(|&a| a == c)
            .ok_or_else(|| bad(format!("unknown axis '{c}'")))
    };
    let size = |c: char| -> Result<usize> {
        match l.iter().position(|&a| a == c) {
            Some(i) => lhs.dim(i),
            None => rhs.dim(index_of(&r, c)?),
        }
    };

    for (i, c) in l.iter().enumerate() {
        if let Some(j) = r.iter().position(|a| a == c) {
            if lhs.dim(i)? != rhs.dim(j)? {
                return Err(bad(format!(
                    "axis '{c}' has sizes {} and {}",
                    lhs.dim(i)?,
                    rhs.dim(j)?
                )));
            }
        }
    }

    let batch: Vec<char> = o
        .iter()
        .copied()
        .filter(|c| l.contains(c) && r.contains(c))
        .collect();
    let summed: Vec<char> = l
        .iter()
        .copied()
        .filter(|c| r.contains(c) && !o.contains(c))
        .collect();
    let lhs_free: Vec<char> = l.iter().copied().filter(|c| !r.contains(c)).collect();
    let rhs_free: Vec<char> = r.iter().copied().filter(|c| !l.contains(c)).collect();
    if let Some(c) = lhs_free.iter().chain(rhs_free.iter()).find(|&&c| !o.contains(&c)) {
        return Err(bad(format!("axis '{c}' only appears in one operand")));
    }

    let numel = |axes: &[char]| -> Result<usize> {
        axes.iter()
            .map(|&c| size(c))
            .collect::<Result<Vec<_>>>()
            .map(|dims| dims.iter().product())
    };
    let (nb, nk) = (numel(&batch)?, numel(&summed)?);
    let (nl, nr) = (numel(&lhs_free)?, numel(&rhs_free)?);

    let lhs_perm = batch
        .iter()
        .chain(lhs_free.iter())
        .chain(summed.iter())
        .map(|&c| index_of(&l, c))
        .collect::<Result<Vec<_>>>()?;
    let rhs_perm = batch
        .iter()
        .chain(summed.iter())
        .chain(rhs_free.iter())
        .map(|&c| index_of(&r, c))
        .collect::<Result<Vec<_>>>()?;

    let lhs = lhs.permute(lhs_perm)?.reshape((nb, nl, nk))?;
    let rhs = rhs.permute(rhs_perm)?.reshape((nb, nk, nr))?;
    let prod = lhs.matmul(&rhs)?;

    let inter: Vec<char> = batch
        .iter()
        .chain(lhs_free.iter())
        .chain(rhs_free.iter())
        .copied()
        .collect();
    let inter_dims = inter
        .iter()
        .map(|&c| size(c))
        .collect::<Result<Vec<_>>>()?;
    let out_perm = o
        .iter()
        .map(|&c| index_of(&inter, c))
        .collect::<Result<Vec<_>>>()?;

    prod.reshape(inter_dims)?.permute(out_perm)
}

/// Scales every vector along the last axis to unit length.
pub fn l2_normalize(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.maximum(eps)?.sqrt()?;
    xs.broadcast_div(&norm)
}

/// One softmax over the last two axes taken jointly.
pub fn spatial_softmax(xs: &Tensor) -> Result<Tensor> {
    let shape = xs.shape().clone();
    let rank = xs.rank();
    if rank < 2 {
        return Err(candle_core::Error::Msg(format!(
            "spatial softmax needs at least 2 dims, got {:?}",
            xs.dims()
        )));
    }
    let flat = xs.flatten_from(rank - 2)?;
    candle_nn::ops::softmax_last_dim(&flat)?.reshape(shape)
}

/// Root-mean-square over the spatial axes of `[N, C, H, W]`, giving `[N, C]`.
pub fn spatial_rms(xs: &Tensor, eps: f64) -> Result<Tensor> {
    (xs.sqr()?.mean((2, 3))? + eps)?.sqrt()
}

/// Rounds to the nearest integer, ties to even (`2.5 -> 2`, `3.5 -> 4`).
pub fn round_half_even(xs: &Tensor) -> Result<Tensor> {
    let nearest = xs.round()?;
    let tie = (xs - xs.floor()?)?.eq(0.5)?;
    let even = (xs * 0.5)?.round()?.affine(2.0, 0.0)?;
    tie.where_cond(&even, &nearest)
}

/// 2D convolution with TensorFlow-style `SAME` padding.
///
/// For strided convolutions the extra padding row/column goes to the bottom/right,
/// which a symmetric `padding` in [`Conv2dConfig`] cannot express.
#[derive(Debug, Clone)]
pub struct Conv2dSame {
    conv: Conv2d,
    kernel_size: usize,
    stride: usize,
}

impl Conv2dSame {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            stride,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(in_channels, out_channels, kernel_size, config, vb)?;
        Ok(Self {
            conv,
            kernel_size,
            stride,
        })
    }

    fn same_padding(&self, size: usize) -> (usize, usize) {
        let out = size.div_ceil(self.stride);
        let total = (out.saturating_sub(1) * self.stride + self.kernel_size).saturating_sub(size);
        (total / 2, total - total / 2)
    }
}

impl Module for Conv2dSame {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        let (top, bottom) = self.same_padding(h);
        let (left, right) = self.same_padding(w);
        let xs = xs
            .pad_with_zeros(2, top, bottom)?
            .pad_with_zeros(3, left, right)?;
        self.conv.forward(&xs)
    }
}

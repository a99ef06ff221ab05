use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

/// Layout of a video tensor, with a flattened 4D batch resolved into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoShape {
    pub batch: usize,
    pub num_frames: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl VideoShape {
    /// Reads the layout of `[batch, time, height, width, channels]` video, or of
    /// `[batch * time, height, width, channels]` video when `num_frames` is given.
    pub fn from_video(video: &Tensor, num_frames: Option<usize>) -> Result<Self> {
        match (video.rank(), num_frames) {
            (5, _) => {
                let (batch, num_frames, height, width, channels) = video.dims5()?;
                Ok(Self {
                    batch,
                    num_frames,
                    height,
                    width,
                    channels,
                })
            }
            (4, Some(num_frames)) => {
                let (frames, height, width, channels) = video.dims4()?;
                if num_frames == 0 || frames % num_frames != 0 {
                    return Err(candle_core::Error::Msg(format!(
                        "{frames} stacked frames cannot be split into clips of {num_frames}"
                    )));
                }
                Ok(Self {
                    batch: frames / num_frames,
                    num_frames,
                    height,
                    width,
                    channels,
                })
            }
            _ => Err(candle_core::Error::Msg(format!(
                "expected 5D video or 4D video with a frame count, got {:?}",
                video.dims()
            ))),
        }
    }

    /// `(time, height, width)`, the grid size used for `[t, y, x]` coordinates.
    pub fn tyx(&self) -> [usize; 3] {
        [self.num_frames, self.height, self.width]
    }
}

/// Dense per-frame features for a video.
pub trait FeatureBackbone: Send + Sync {
    /// Extracts `[batch, time, height / stride, width / stride, channels]` features.
    ///
    /// `video` follows [`VideoShape::from_video`]; `target_num_frames` is required
    /// for 4D input.
    fn extract(
        &self,
        video: &Tensor,
        is_training: bool,
        stride: usize,
        target_num_frames: Option<usize>,
    ) -> Result<Tensor>;

    /// Channel count of the extracted features.
    fn channels(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConvStemConfig {
    pub in_channels: usize,
    pub channels: usize,
    pub stride: usize,
}

impl Default for ConvStemConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            channels: 256,
            stride: 8,
        }
    }
}

/// Minimal backbone: one non-overlapping `stride x stride` patch convolution per frame.
pub struct ConvStemBackbone {
    patch_embed: Conv2d,
    config: ConvStemConfig,
}

impl ConvStemBackbone {
    pub fn new(config: ConvStemConfig, vb: VarBuilder) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.stride,
            ..Default::default()
        };
        let patch_embed = candle_nn::conv2d(
            config.in_channels,
            config.channels,
            config.stride,
            conv_config,
            vb.pp("patch_embed"),
        )?;
        Ok(Self {
            patch_embed,
            config,
        })
    }
}

impl FeatureBackbone for ConvStemBackbone {
    fn extract(
        &self,
        video: &Tensor,
        _is_training: bool,
        stride: usize,
        target_num_frames: Option<usize>,
    ) -> Result<Tensor> {
        if stride != self.config.stride {
            return Err(candle_core::Error::Msg(format!(
                "conv stem has stride {}, requested {}",
                self.config.stride, stride
            )));
        }
        let shape = VideoShape::from_video(video, target_num_frames)?;
        let frames = shape.batch * shape.num_frames;

        // [b*t, c, h, w] for the per-frame convolution
        let xs = video
            .reshape((frames, shape.height, shape.width, shape.channels))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let xs = self.patch_embed.forward(&xs)?;
        let (_, channels, fh, fw) = xs.dims4()?;

        xs.permute((0, 2, 3, 1))?
            .reshape((shape.batch, shape.num_frames, fh, fw, channels))
    }

    fn channels(&self) -> usize {
        self.config.channels
    }
}

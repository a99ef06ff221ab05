pub mod backbones;
pub mod cost_volume;
pub mod soft_argmax;
pub mod tapnet_base;
pub mod tapnet_utils;
pub mod transforms;

pub mod interpolation;

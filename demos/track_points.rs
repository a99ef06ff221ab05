use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ndarray::Array4;
use tapnet::{
    preprocess_frames, ConvStemBackbone, ConvStemConfig, TapNet, TapNetConfig, TapNetPredictor,
};

// Usage: track_points [weights.safetensors]
// Without weights the model runs with random parameters.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let device = Device::cuda_if_available(0)?;

    let varmap = VarMap::new();
    let vb = match std::env::args().nth(1) {
        Some(path) => unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? },
        None => VarBuilder::from_varmap(&varmap, DType::F32, &device),
    };

    let config = TapNetConfig::default();
    let backbone = ConvStemBackbone::new(
        ConvStemConfig {
            stride: config.feature_grid_stride,
            ..Default::default()
        },
        vb.pp("backbone"),
    )?;
    let model = TapNet::new(Box::new(backbone), config, vb)?;
    let predictor = TapNetPredictor::new(model, 64)?;

    // a bright square drifting right over a dark background
    let (t, h, w) = (8, 64, 96);
    let mut frames = Array4::<u8>::from_elem((t, h, w, 3), 20);
    for f in 0..t {
        let x0 = 8 + 6 * f;
        for y in 24..40 {
            for x in x0..x0 + 16 {
                frames[[f, y, x, 0]] = 230;
                frames[[f, y, x, 1]] = 180;
            }
        }
    }
    let video = preprocess_frames(frames.view(), &device)?;

    let query_points = Tensor::new(
        &[[[0.0f32, 32.0, 16.0], [0.0, 10.0, 80.0], [4.0, 30.0, 40.0]]],
        &device,
    )?;

    let features = predictor.compute_features(&video)?;
    let result = predictor.track_cached(&features, &query_points)?;

    let tracks = result.tracks.squeeze(0)?.to_vec3::<f32>()?;
    let visibles = result.visibles.squeeze(0)?.to_vec2::<u8>()?;
    for (i, (track, visible)) in tracks.iter().zip(visibles.iter()).enumerate() {
        println!("query {i}");
        for (f, (xy, v)) in track.iter().zip(visible.iter()).enumerate() {
            println!("  frame {f}: x={:.1} y={:.1} visible={}", xy[0], xy[1], v);
        }
    }

    let mut debug: HashMap<String, Tensor> = HashMap::new();
    debug.insert("tracks".to_string(), result.tracks);
    debug.insert("occlusion".to_string(), result.occlusion);
    debug.insert("visibles".to_string(), result.visibles);
    candle_core::safetensors::save(&debug, "tracks.safetensors")?;
    features.save("features.safetensors")?;

    Ok(())
}

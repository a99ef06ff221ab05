use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tapnet::{
    ConvStemBackbone, ConvStemConfig, FeatureBackbone, TapNet, TapNetConfig, TapNetError,
    TapNetInputs,
};

fn random_model(varmap: &VarMap, channels: usize) -> TapNet {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    let backbone = ConvStemBackbone::new(
        ConvStemConfig {
            in_channels: 3,
            channels,
            stride: 8,
        },
        vb.pp("backbone"),
    )
    .unwrap();
    TapNet::new(Box::new(backbone), TapNetConfig::default(), vb).unwrap()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

fn queries() -> Tensor {
    Tensor::new(
        &[[
            [0.0f32, 3.0, 5.0],
            [1.0, 20.5, 11.0],
            [2.0, 31.0, 0.0],
            [3.0, 15.0, 28.25],
            [1.4, 8.0, 8.0],
        ]],
        &Device::Cpu,
    )
    .unwrap()
}

#[test]
fn chunking_does_not_change_results() {
    let varmap = VarMap::new();
    let model = random_model(&varmap, 16);
    let video = Tensor::randn(0f32, 1.0, (1, 4, 32, 32, 3), &Device::Cpu).unwrap();
    let queries = queries();

    let full = model
        .forward(&video, &TapNetInputs::tracking(&queries, 5))
        .unwrap();
    let full_tracks = values(full.tracks.as_ref().unwrap());
    let full_occ = values(full.occlusion.as_ref().unwrap());
    assert_eq!(model.cost_volume_calls(), 1);

    for (chunk, expected_calls) in [(1, 5), (2, 3), (64, 1)] {
        let before = model.cost_volume_calls();
        let out = model
            .forward(&video, &TapNetInputs::tracking(&queries, chunk))
            .unwrap();
        assert_eq!(model.cost_volume_calls() - before, expected_calls);

        let tracks = out.tracks.unwrap();
        let occlusion = out.occlusion.unwrap();
        assert_eq!(tracks.dims(), &[1, 5, 4, 2]);
        assert_eq!(occlusion.dims(), &[1, 5, 4]);
        for (a, b) in values(&tracks).iter().zip(full_tracks.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
        for (a, b) in values(&occlusion).iter().zip(full_occ.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }
}

#[test]
fn tracks_start_at_their_queries() {
    let varmap = VarMap::new();
    let model = random_model(&varmap, 16);
    let video = Tensor::randn(0f32, 1.0, (1, 4, 32, 32, 3), &Device::Cpu).unwrap();
    let queries = queries();

    let tracks = model
        .forward(&video, &TapNetInputs::tracking(&queries, 2))
        .unwrap()
        .tracks
        .unwrap()
        .squeeze(0)
        .unwrap();
    let q = queries.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
    for (i, query) in q.iter().enumerate() {
        let frame = query[0].round() as usize;
        let xy = tracks.get(i).unwrap().get(frame).unwrap().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(xy[0], query[2], epsilon = 1e-5);
        assert_abs_diff_eq!(xy[1], query[1], epsilon = 1e-5);
    }
}

#[test]
fn feature_only_mode_skips_cost_volume() {
    let varmap = VarMap::new();
    let model = random_model(&varmap, 16);
    let video = Tensor::randn(0f32, 1.0, (1, 4, 32, 24, 3), &Device::Cpu).unwrap();
    let queries = queries();

    let inputs = TapNetInputs {
        query_points: Some(&queries),
        get_query_feats: true,
        ..TapNetInputs::features_only()
    };
    let out = model.forward(&video, &inputs).unwrap();
    assert!(out.tracks.is_none());
    assert!(out.occlusion.is_none());
    assert_eq!(out.feature_grid.dims(), &[1, 4, 4, 3, 16]);
    assert_eq!(out.query_feats.unwrap().dims(), &[1, 5, 16]);
    assert_eq!(model.cost_volume_calls(), 0);

    // grid cells are unit vectors
    let norms = out
        .feature_grid
        .sqr()
        .unwrap()
        .sum(4)
        .unwrap()
        .sqrt()
        .unwrap();
    for n in values(&norms) {
        assert_abs_diff_eq!(n, 1.0, epsilon = 1e-4);
    }
}

#[test]
fn stacked_frames_match_video() {
    let varmap = VarMap::new();
    let model = random_model(&varmap, 8);
    let video = Tensor::randn(0f32, 1.0, (2, 3, 16, 16, 3), &Device::Cpu).unwrap();
    let stacked = video.reshape((6, 16, 16, 3)).unwrap();
    let queries = Tensor::new(
        &[[[0.0f32, 4.0, 4.0]], [[2.0, 12.0, 3.0]]],
        &Device::Cpu,
    )
    .unwrap();

    let a = model
        .forward(&video, &TapNetInputs::tracking(&queries, 1))
        .unwrap();
    let inputs = TapNetInputs {
        num_frames: Some(3),
        ..TapNetInputs::tracking(&queries, 1)
    };
    let b = model.forward(&stacked, &inputs).unwrap();

    assert_eq!(b.tracks.as_ref().unwrap().dims(), &[2, 1, 3, 2]);
    for (x, y) in values(&a.tracks.unwrap())
        .iter()
        .zip(values(&b.tracks.unwrap()).iter())
    {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
    }
}

#[test]
fn solid_color_video_with_uniform_grid() {
    let varmap = VarMap::new();
    let model = random_model(&varmap, 16);
    let video = Tensor::full(0.25f32, (1, 4, 40, 40, 3), &Device::Cpu).unwrap();
    let grid = (Tensor::ones((1, 4, 5, 5, 16), DType::F32, &Device::Cpu).unwrap() * 0.25)
        .unwrap();
    let queries = Tensor::new(&[[[0.0f32, 10.0, 10.0]]], &Device::Cpu).unwrap();

    let inputs = TapNetInputs {
        feature_grid: Some(&grid),
        ..TapNetInputs::tracking(&queries, 4)
    };
    let out = model.forward(&video, &inputs).unwrap();
    let tracks = out.tracks.unwrap().to_dtype(DType::F32).unwrap();
    assert_eq!(tracks.dims(), &[1, 1, 4, 2]);

    let xy = values(&tracks);
    assert_abs_diff_eq!(xy[0], 10.0, epsilon = 1e-5);
    assert_abs_diff_eq!(xy[1], 10.0, epsilon = 1e-5);
    assert!(xy.iter().all(|v| v.is_finite()));
    assert!(values(&out.occlusion.unwrap()).iter().all(|v| v.is_finite()));
}

/// Returns a fixed grid and counts how often it is asked for features.
struct FixedBackbone {
    grid: Tensor,
    calls: Arc<AtomicUsize>,
}

impl FeatureBackbone for FixedBackbone {
    fn extract(
        &self,
        _video: &Tensor,
        _is_training: bool,
        _stride: usize,
        _target_num_frames: Option<usize>,
    ) -> candle_core::Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.grid.clone())
    }

    fn channels(&self) -> usize {
        self.grid.dims()[4]
    }
}

#[test]
fn supplied_grid_bypasses_backbone() {
    let calls = Arc::new(AtomicUsize::new(0));
    let grid = Tensor::randn(0f32, 1.0, (1, 2, 4, 4, 8), &Device::Cpu).unwrap();
    let backbone = FixedBackbone {
        grid: grid.clone(),
        calls: calls.clone(),
    };
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let model = TapNet::new(Box::new(backbone), TapNetConfig::default(), vb).unwrap();
    let video = Tensor::zeros((1, 2, 32, 32, 3), DType::F32, &Device::Cpu).unwrap();
    let queries = Tensor::new(&[[[1.0f32, 16.0, 16.0]]], &Device::Cpu).unwrap();

    let out = model
        .forward(&video, &TapNetInputs::tracking(&queries, 1))
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // backbone output is normalized before use
    let norm = values(&out.feature_grid.sqr().unwrap().sum(4).unwrap());
    assert_abs_diff_eq!(norm[0], 1.0, epsilon = 1e-4);

    let inputs = TapNetInputs {
        feature_grid: Some(&grid),
        ..TapNetInputs::tracking(&queries, 1)
    };
    let out = model.forward(&video, &inputs).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(values(&out.feature_grid), values(&grid));
}

#[test]
fn grid_that_does_not_fit_video_is_rejected() {
    let varmap = VarMap::new();
    let model = random_model(&varmap, 8);
    let video = Tensor::zeros((1, 3, 16, 16, 3), DType::F32, &Device::Cpu).unwrap();
    let grid = Tensor::zeros((1, 2, 2, 2, 8), DType::F32, &Device::Cpu).unwrap();
    let queries = Tensor::new(&[[[0.0f32, 1.0, 1.0]]], &Device::Cpu).unwrap();

    let inputs = TapNetInputs {
        feature_grid: Some(&grid),
        ..TapNetInputs::tracking(&queries, 1)
    };
    assert!(matches!(
        model.forward(&video, &inputs),
        Err(TapNetError::ShapeMismatch(_))
    ));
}

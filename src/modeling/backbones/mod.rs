pub mod feature_backbone;

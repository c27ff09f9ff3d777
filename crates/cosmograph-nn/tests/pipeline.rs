//! End-to-end runs: graph construction through layers, weight tying and
//! checkpoint restore.

use candle_core::{Device, Tensor};
use cosmograph_core::{Dataset, GraphBuilder, GraphConfig, TripletSegment};
use cosmograph_nn::conv::{RotInvConv, ShiftInvConv};
use cosmograph_nn::features::edge_features;
use cosmograph_nn::params::ParamStore;
use cosmograph_nn::{
    EdgeTensors, GraphTensors, InputMode, LayerKind, Model, ModelConfig, RedshiftPair, Trainer, TrainingConfig,
};
use ndarray::Array3;

fn grid_batch() -> Array3<f32> {
    Array3::from_shape_fn((1, 8, 6), |(_, p, c)| {
        let cell = [p / 4, (p / 2) % 2, p % 2];
        if c < 3 {
            (cell[c] as f32 + 0.5) / 2.0
        } else {
            0.1 * (p as f32 - c as f32)
        }
    })
}

fn upload(batch: &Array3<f32>) -> Tensor {
    Tensor::from_iter(batch.iter().copied(), &Device::Cpu).unwrap().reshape(batch.dim()).unwrap()
}

#[test]
fn eight_particle_grid_through_one_layer() {
    let batch = grid_batch();
    let builder = GraphBuilder::new(GraphConfig::default().with_k(3).with_boundary_threshold(0.3)).unwrap();
    let graph = builder.batch_graph(batch.view()).unwrap();
    assert_eq!(graph.num_edges(), 8 * 3);

    let edges = EdgeTensors::from_graph(&graph, &Device::Cpu).unwrap();
    let features = edge_features(&upload(&batch), &edges).unwrap();
    let params = ParamStore::new(&ModelConfig::new(LayerKind::ShiftInvariant, vec![9, 3]), 0, &Device::Cpu).unwrap();

    let out = ShiftInvConv::new(9, 3).forward(&features, &edges, params.layer(0).unwrap(), true).unwrap();
    assert_eq!(out.dims(), &[1, 8, 3]);
    let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn velocity_models_predict_both_channels() {
    let batch = grid_batch();
    let builder = GraphBuilder::new(GraphConfig::default().with_k(3).with_boundary_threshold(0.3)).unwrap();
    let graph = GraphTensors::Edges(EdgeTensors::from_graph(&builder.batch_graph(batch.view()).unwrap(), &Device::Cpu).unwrap());
    let config = ModelConfig::new(LayerKind::ShiftInvariant, vec![9, 8, 6]).with_velocity_coefficient(true);
    let model = Model::new(config, 1, &Device::Cpu).unwrap();

    let prediction = model.forward(&upload(&batch), &graph).unwrap();
    assert_eq!(prediction.location.dims(), &[1, 8, 3]);
    assert_eq!(prediction.velocity.map(|v| v.dims().to_vec()), Some(vec![1, 8, 3]));
}

#[test]
fn forward_rejects_mismatched_batches() {
    let batch = grid_batch();
    let builder = GraphBuilder::new(GraphConfig::default().with_k(3).with_boundary_threshold(0.3)).unwrap();
    let graph = GraphTensors::Edges(EdgeTensors::from_graph(&builder.batch_graph(batch.view()).unwrap(), &Device::Cpu).unwrap());
    let model = Model::new(ModelConfig::default(), 1, &Device::Cpu).unwrap();
    let short = upload(&grid_batch()).narrow(1, 0, 7).unwrap();
    assert!(model.forward(&short, &graph).is_err());
}

#[test]
fn rotation_invariant_operators_share_tied_weights() {
    let config = ModelConfig::new(LayerKind::RotationInvariant, vec![10, 4, 1]);
    let store = ParamStore::new(&config, 9, &Device::Cpu).unwrap();
    for layer in 0..store.num_layers() {
        let params = store.layer(layer).unwrap();
        let weight = |seg| RotInvConv::operator_weight(params, seg).unwrap();

        assert_eq!(weight(TripletSegment::RowDepth).id(), weight(TripletSegment::RowCol).id());
        assert_eq!(weight(TripletSegment::Depth).id(), weight(TripletSegment::Col).id());
        assert_ne!(weight(TripletSegment::RowDepth).id(), weight(TripletSegment::Row).id());

        let tied = weight(TripletSegment::RowDepth).to_vec2::<f32>().unwrap();
        let row = weight(TripletSegment::Row).to_vec2::<f32>().unwrap();
        assert_ne!(tied, row);
    }
}

#[test]
fn checkpoint_restores_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let data = Dataset::synthetic(3, 2, 2, 0.01, 4).unwrap();
    let graph_config = GraphConfig::default().with_k(4).with_boundary_threshold(0.2);
    let model_config = ModelConfig::new(LayerKind::ShiftInvariant, vec![9, 4, 3]);

    let model = Model::new(model_config.clone(), 1, &Device::Cpu).unwrap();
    let training = TrainingConfig::default().with_batch_size(2).with_boundary(None);
    let mut trainer = Trainer::new(model, graph_config.clone(), training, Device::Cpu).unwrap();
    trainer.step(data.redshift(0), data.redshift(1)).unwrap();
    let path = trainer.checkpoint(dir.path()).unwrap();
    assert!(path.ends_with("checkpoint_1.safetensors"));

    let (particles, graph) = trainer.prepare(data.redshift(0)).unwrap();
    let want = trainer.model().forward(&particles, &graph).unwrap().location.flatten_all().unwrap();

    let mut restored = Model::new(model_config, 99, &Device::Cpu).unwrap();
    let before = restored.forward(&particles, &graph).unwrap().location.flatten_all().unwrap();
    assert_ne!(before.to_vec1::<f32>().unwrap(), want.to_vec1::<f32>().unwrap());

    restored.params_mut().load(&path).unwrap();
    let got = restored.forward(&particles, &graph).unwrap().location.flatten_all().unwrap();
    let diff = (got - want).unwrap().abs().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
    assert!(diff < 1e-6, "{diff}");
}

#[test]
fn zeldovich_model_reads_grid_and_displacement() {
    let batch = grid_batch();
    let builder = GraphBuilder::new(GraphConfig::default().with_k(3).with_boundary_threshold(0.3)).unwrap();
    let graph = GraphTensors::Edges(EdgeTensors::from_graph(&builder.batch_graph(batch.view()).unwrap(), &Device::Cpu).unwrap());
    let config = ModelConfig::new(LayerKind::ShiftInvariant, vec![9, 8, 3]).with_input(InputMode::Zeldovich);
    let model = Model::new(config, 3, &Device::Cpu).unwrap();

    let particles = upload(&batch);
    assert_eq!(model.features(&particles, &graph).unwrap().dims(), &[24, 3]);
    let prediction = model.forward(&particles, &graph).unwrap();
    assert_eq!(prediction.location.dims(), &[1, 8, 3]);
    assert!(prediction.velocity.is_none());
    let values = prediction.location.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn redshift_conditioned_model_trains() {
    let config = ModelConfig::new(LayerKind::Vanilla, vec![9, 4, 3])
        .with_redshifts(Some(RedshiftPair::new(18, 19)))
        .with_redshift_channel(true);
    let model = Model::new(config, 0, &Device::Cpu).unwrap();
    let graph = GraphConfig::default().with_k(4).with_boundary_threshold(0.2);
    let mut trainer = Trainer::new(model, graph, TrainingConfig::default().with_batch_size(2), Device::Cpu).unwrap();
    let data = Dataset::synthetic(3, 2, 2, 0.01, 1).unwrap();
    assert!(trainer.step(data.redshift(0), data.redshift(1)).unwrap().is_finite());

    let (particles, graph) = trainer.prepare(data.redshift(0)).unwrap();
    let features = trainer.model().features(&particles, &graph).unwrap();
    assert_eq!(features.dims(), &[2 * 27 * 4, 10]);
    let column = features.narrow(1, 9, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(column.iter().all(|&z| z == 18.0));
    assert!(trainer.model().features_at(&particles, &graph, None).is_err());
    assert!(trainer.model().forward_at(&particles, &graph, Some(6.0)).is_ok());
}

mod common;

use burn::backend::Autodiff;
use burn::module::Module;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn_ndarray::NdArray;
use optreg_model::{NetworkVariant, RegistrationNetwork, VoxelMorph};
use optreg_train::{CheckpointMeta, CheckpointStore, TrainError};

type B = Autodiff<NdArray<f32>>;

#[test]
fn test_bundle_round_trip_restores_weights_and_optimizer() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());

    let pair = common::sample(0.0).into_pair::<B>(&device).unwrap();
    let mut model = common::tiny_voxelmorph::<B>(&device);
    let mut optimizer = AdamConfig::new().init::<B, VoxelMorph<B>>();

    let output = model.register(&pair);
    let loss = (output.warped - pair.fixed.clone()).powf_scalar(2.0).mean();
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    model = optimizer.step(1e-3, model.clone(), grads);

    let meta = CheckpointMeta {
        epoch: 4,
        best_dice: 0.61,
        dice: 0.58,
        network: NetworkVariant::VoxelMorph,
    };
    let bundle = store.save(&model, &optimizer, &meta, 3).unwrap();
    assert!(bundle.ends_with("dsc0.580_epoch3"));
    assert_eq!(store.list().unwrap(), vec![bundle.clone()]);
    assert_eq!(store.load_meta(&bundle).unwrap(), meta);

    let restored = store
        .load_model(&bundle, common::tiny_voxelmorph::<B>(&device), &device)
        .unwrap();
    let expected = model.register(&pair).flow;
    let actual = restored.register(&pair).flow;
    let diff: f32 = (expected - actual).abs().max().into_scalar();
    assert!(diff < 1e-6, "restored network differs by {}", diff);

    let fresh = AdamConfig::new().init::<B, VoxelMorph<B>>();
    assert!(fresh.to_record().is_empty());
    let loaded = store.load_optimizer(&bundle, fresh, &device).unwrap();
    assert_eq!(loaded.to_record().len(), optimizer.to_record().len());
    assert_eq!(restored.num_params(), model.num_params());
}

#[test]
fn test_resume_index_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let err = store.select(-1).unwrap_err();
    assert!(matches!(err, TrainError::CheckpointIndex { index: -1, available: 0, .. }));
}

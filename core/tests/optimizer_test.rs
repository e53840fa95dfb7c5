use rand::rngs::StdRng;
use rand::SeedableRng;
use vidtext::optim::strategy::debias_momentum;
use vidtext::optim::{LinearWarmup, Optimizer, Pipeline};
use vidtext::store::{Init, ParameterStore};
use vidtext::{Dimension, Error, Shape, Tensor};

fn shape(n: usize) -> Shape {
    Shape::new(vec![Dimension::new("x", n)]).unwrap()
}

fn param(store: &ParameterStore, name: &str, value: Vec<f32>, grad: Vec<f32>) {
    let shape = shape(value.len());
    let mut rng = StdRng::seed_from_u64(0);
    store.get_or_create(name, &shape, Init::Zeros, &mut rng).unwrap();
    store
        .set_value(name, Tensor::new(value, shape.clone()).unwrap())
        .unwrap();
    store
        .get(name)
        .unwrap()
        .backward_with(Tensor::new(grad, shape).unwrap())
        .unwrap();
}

fn optimizer(names: &[&str], lr: f32) -> Optimizer {
    Optimizer::new(
        Pipeline::parse(names).unwrap(),
        0.9,
        0.999,
        Box::new(LinearWarmup::new(lr, 0, 0)),
    )
}

fn values(store: &ParameterStore, name: &str) -> Vec<f32> {
    store.get(name).unwrap().data.data().to_vec()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{actual:?} vs {expected:?}");
    }
}

#[test]
fn test_adaptive_clip_scales_only_large_ratios() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = ParameterStore::new();
    param(&store, "large", vec![3.0, 4.0], vec![0.3, 0.4]);
    param(&store, "small", vec![3.0, 4.0], vec![0.003, 0.004]);

    let mut opt = optimizer(&["adaptive_clip:0.01", "learning_rate"], 0.5);
    opt.step(&store).unwrap();

    // ‖g‖/‖w‖ = 0.1 is pulled down to 0.01.
    assert_close(&values(&store, "large"), &[2.985, 3.98]);
    // 0.001 is within the threshold.
    assert_close(&values(&store, "small"), &[2.9985, 3.998]);
}

#[test]
fn test_global_norm_is_shared_by_all_parameters() {
    let store = ParameterStore::new();
    param(&store, "a", vec![3.0, 0.0], vec![3.0, 0.0]);
    param(&store, "b", vec![0.0, 4.0], vec![0.0, 4.0]);

    let mut opt = optimizer(&["global_l2norm_clip:1.0", "learning_rate"], 1.0);
    let report = opt.step(&store).unwrap();

    assert!((report.global_norm_reciprocal.unwrap() - 0.2).abs() < 1e-6);
    assert_close(&values(&store, "a"), &[2.4, 0.0]);
    assert_close(&values(&store, "b"), &[0.0, 3.2]);
}

#[test]
fn test_global_norm_first_clip_wins() {
    let store = ParameterStore::new();
    param(&store, "a", vec![0.0, 0.0], vec![3.0, 4.0]);

    let mut opt = optimizer(
        &["global_l2norm_clip:1.0", "global_l2norm_clip:100.0", "learning_rate"],
        1.0,
    );
    let report = opt.step(&store).unwrap();

    // The second clip reuses 1/5 instead of recomputing from its own threshold.
    assert_eq!(report.global_norm_reciprocal, Some(0.2));
    // g * 1 * 0.2 * 100 * 0.2
    assert_close(&values(&store, "a"), &[-12.0, -16.0]);
}

#[test]
fn test_global_norm_not_computed_without_global_clip() {
    let store = ParameterStore::new();
    param(&store, "a", vec![1.0], vec![1.0]);
    let report = optimizer(&["sgd", "learning_rate"], 0.1).step(&store).unwrap();
    assert_eq!(report.global_norm_reciprocal, None);
}

#[test]
fn test_adam_debiasing() {
    assert!((debias_momentum(0.9, 1) - 10.0).abs() < 1e-4);
    assert!((debias_momentum(0.999, 1) - 1000.0).abs() < 0.1);
    assert!((debias_momentum(0.9, 1000) - 1.0).abs() < 1e-6);
    assert!(debias_momentum(0.9, 2) < debias_momentum(0.9, 1));

    // The first debiased Adam step has magnitude 1 regardless of the gradient's scale.
    let store = ParameterStore::new();
    param(&store, "w", vec![1.0, 1.0, 1.0], vec![0.5, -2.0, 1e-3]);
    let mut opt = optimizer(&["adam", "learning_rate"], 0.1);
    opt.step(&store).unwrap();
    assert_close(&values(&store, "w"), &[0.9, 1.1, 0.9]);
}

#[test]
fn test_adam_state_is_committed_after_the_step() {
    let store = ParameterStore::new();
    param(&store, "w", vec![0.0, 0.0], vec![1.0, -1.0]);
    let mut opt = optimizer(&["adam", "learning_rate"], 0.01);
    assert!(store.aux("w/exp_avg_p1").is_none());

    opt.step(&store).unwrap();
    assert_eq!(opt.step_count(), 1);
    assert_close(store.aux("w/exp_avg_p1").unwrap().data(), &[0.1, -0.1]);
    assert_close(store.aux("w/exp_avg_p2").unwrap().data(), &[0.001, 0.001]);

    // A committed parameter starts without a gradient; a second step skips it.
    let report = opt.step(&store).unwrap();
    assert_eq!(report.parameters, 0);
    assert_eq!(report.step, 2);
}

#[test]
fn test_sm3_keeps_one_buffer_per_axis() {
    let store = ParameterStore::new();
    let shape = Shape::new(vec![Dimension::new("rows", 2), Dimension::new("cols", 3)]).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let w = store
        .get_or_create("w", &shape, Init::Ones, &mut rng)
        .unwrap();
    w.backward_with(Tensor::from_fn(shape, |i| i as f32)).unwrap();

    optimizer(&["sm3", "learning_rate"], 0.1).step(&store).unwrap();
    assert_eq!(store.aux("w/dim0").unwrap().shape().sizes(), vec![2]);
    assert_eq!(store.aux("w/dim1").unwrap().shape().sizes(), vec![3]);
}

#[test]
fn test_pipeline_parse_errors() {
    assert!(matches!(
        Pipeline::parse(&["adam", "lion"]),
        Err(Error::UnknownStrategy(name)) if name == "lion"
    ));
    assert!(matches!(
        Pipeline::parse(&["l2norm_clip"]),
        Err(Error::MissingArgument(_))
    ));
    assert!(matches!(
        Pipeline::parse(&["value_clip:abc"]),
        Err(Error::InvalidThreshold { .. })
    ));
    assert_eq!(Pipeline::parse(&["adam", "learning_rate"]).unwrap().strategies().len(), 2);
}

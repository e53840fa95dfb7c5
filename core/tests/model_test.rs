use std::rc::Rc;
use vidtext::config::{
    BlockConfig, MemoryReductionStrategy, ModelParameter, COLOR_CHANNELS, TOKEN_PATCH,
};
use vidtext::model::{self, output::partition, BuildInputs};
use vidtext::scope::BuildContext;
use vidtext::store::ParameterStore;
use vidtext::{Dimension, Error, Shape, Tensor};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn video(dims: &[(&str, usize)]) -> Tensor {
    let shape = Shape::new(dims.iter().map(|(n, s)| Dimension::new(*n, *s)).collect()).unwrap();
    Tensor::from_fn(shape, |i| ((i * 53 + 11) % 256) as f32)
}

fn text(batch: usize, sequence: usize, context: usize, vocab: usize, offset: usize) -> Tensor {
    let shape = Shape::new(vec![
        Dimension::new("batch", batch),
        Dimension::new("sequence", sequence),
        Dimension::new("context", context),
        Dimension::new(TOKEN_PATCH, 1),
    ])
    .unwrap();
    Tensor::new_integer(
        (0..shape.size())
            .map(|i| ((i * 7 + offset) % vocab) as f32)
            .collect(),
        shape,
    )
    .unwrap()
}

fn video_only(strategy: MemoryReductionStrategy) -> ModelParameter {
    ModelParameter {
        use_language: false,
        n_embd: 8,
        n_head: 2,
        n_blocks: 1,
        memory_reduction_strategy: strategy,
        ..Default::default()
    }
}

fn language_only(strategy: MemoryReductionStrategy) -> ModelParameter {
    ModelParameter {
        use_video: false,
        vocab_size: 16,
        n_embd: 8,
        n_head: 2,
        n_blocks: 2,
        memory_reduction_strategy: strategy,
        train: false,
        ..Default::default()
    }
}

fn text_inputs() -> BuildInputs {
    BuildInputs {
        txt_src: Some(text(2, 3, 1, 16, 0)),
        txt_tgt: Some(text(2, 3, 1, 16, 5)),
        ..Default::default()
    }
}

fn total_loss(params: &Rc<ModelParameter>, store: &ParameterStore, inputs: &BuildInputs) -> f32 {
    let mut ctx = BuildContext::new(params.clone(), store.clone());
    model::build(&mut ctx, inputs)
        .unwrap()
        .total_loss
        .data
        .item()
        .unwrap()
}

#[test]
fn test_video_only_end_to_end() {
    init_tracing();
    let params = Rc::new(video_only(MemoryReductionStrategy::None));
    let store = ParameterStore::new();
    let mut ctx = BuildContext::new(params, store.clone());
    let inputs = BuildInputs {
        vid: Some(video(&[
            ("batch", 2),
            ("sequence", 5),
            ("height", 4),
            ("width", 4),
            (COLOR_CHANNELS, 3),
        ])),
        ..Default::default()
    };

    let out = model::build(&mut ctx, &inputs).unwrap();
    let frames = out.frame_out.as_ref().unwrap();
    assert_eq!(frames.shape().get("sequence").unwrap().size, 4);
    assert_eq!(frames.shape().sizes(), vec![2, 4, 4, 4, 3]);
    assert!(out.total_loss.shape().is_scalar());
    assert_eq!(out.loss_list.len(), 1);
    assert!(out.token_loss.is_none());
    assert!(out.token_out.is_none());
    assert!(out.accuracy.is_none());

    let loss = out.total_loss.data.item().unwrap();
    assert!(loss.is_finite() && loss > 0.0);
    assert_eq!(ctx.attention_idx(), 0);
    assert!(!store.is_empty());
}

#[test]
fn test_checkpoint_matches_none_end_to_end() {
    let inputs = BuildInputs {
        vid: Some(video(&[("batch", 1), ("sequence", 4), ("height", 3), (COLOR_CHANNELS, 3)])),
        ..Default::default()
    };

    let run = |strategy| {
        let params = Rc::new(video_only(strategy));
        let store = ParameterStore::new();
        let mut ctx = BuildContext::new(params, store.clone());
        let out = model::build(&mut ctx, &inputs).unwrap();
        out.total_loss.backward().unwrap();
        let grads: Vec<(String, Vec<f32>)> = store
            .parameters()
            .into_iter()
            .map(|(name, var)| (name, var.grad().unwrap().data().to_vec()))
            .collect();
        (out.total_loss.data.item().unwrap(), grads)
    };

    let (plain_loss, plain_grads) = run(MemoryReductionStrategy::None);
    let (ckpt_loss, ckpt_grads) = run(MemoryReductionStrategy::Checkpoint);
    assert_eq!(plain_loss, ckpt_loss);
    assert_eq!(plain_grads.len(), ckpt_grads.len());
    for ((name_a, a), (name_b, b)) in plain_grads.iter().zip(&ckpt_grads) {
        assert_eq!(name_a, name_b);
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{name_a}: {x} vs {y}");
        }
    }
}

#[test]
fn test_parameter_names_are_stable_across_builds() {
    let params = Rc::new(video_only(MemoryReductionStrategy::None));
    let store = ParameterStore::new();
    let inputs = BuildInputs {
        vid: Some(video(&[("batch", 1), ("sequence", 3), ("height", 2), (COLOR_CHANNELS, 3)])),
        ..Default::default()
    };

    let first = total_loss(&params, &store, &inputs);
    let names = store.names();
    let second = total_loss(&params, &store, &inputs);
    assert_eq!(store.names(), names);
    assert_eq!(first, second);
    assert!(names.iter().any(|n| n == "jannet0/body0/0_0/norm_0/scale"));
    assert!(names.iter().all(|n| n.starts_with("jannet0/")));
}

#[test]
fn test_combined_mode_slices_tokens_then_frames() {
    init_tracing();
    let params = Rc::new(ModelParameter {
        vocab_size: 16,
        n_embd: 8,
        n_head: 2,
        n_blocks: 1,
        calc_accuracy: true,
        ..Default::default()
    });
    let store = ParameterStore::new();
    let mut ctx = BuildContext::new(params, store);
    let inputs = BuildInputs {
        vid: Some(video(&[("batch", 1), ("sequence", 5), ("context", 3), (COLOR_CHANNELS, 3)])),
        txt_src: Some(text(1, 4, 1, 16, 0)),
        txt_tgt: Some(text(1, 4, 1, 16, 3)),
        ..Default::default()
    };

    let out = model::build(&mut ctx, &inputs).unwrap();
    let tokens = out.token_out.as_ref().unwrap();
    let frames = out.frame_out.as_ref().unwrap();
    assert_eq!(tokens.shape().get("context").unwrap().size, 1);
    assert_eq!(tokens.shape().get("vocab").unwrap().size, 16);
    assert_eq!(frames.shape().sizes(), vec![1, 4, 3, 3]);

    assert_eq!(out.loss_list.len(), 2);
    let parts: f32 = out
        .loss_list
        .iter()
        .map(|l| l.data.item().unwrap())
        .sum();
    let total = out.total_loss.data.item().unwrap();
    assert!((total - parts).abs() < 1e-5);

    let accuracy = out.accuracy.unwrap().item().unwrap();
    assert!((0.0..=1.0).contains(&accuracy));
}

#[test]
fn test_language_loss_starts_near_uniform() {
    let params = Rc::new(language_only(MemoryReductionStrategy::None));
    let store = ParameterStore::new();
    let loss = total_loss(&params, &store, &text_inputs());
    assert!((loss - 16f32.ln()).abs() < 0.5, "loss {loss}");
}

#[test]
fn test_partition_rejects_mismatched_context() {
    let params = ModelParameter {
        use_video: false,
        ..Default::default()
    };
    assert_eq!(partition(&params, 1).unwrap(), (1, 0));
    assert!(partition(&params, 2).is_err());

    let params = Rc::new(ModelParameter {
        language_token_patch: 1,
        ..language_only(MemoryReductionStrategy::None)
    });
    let mut ctx = BuildContext::new(params, ParameterStore::new());
    let inputs = BuildInputs {
        txt_src: Some(text(1, 3, 2, 16, 0)),
        txt_tgt: Some(text(1, 3, 2, 16, 1)),
        ..Default::default()
    };
    let err = model::build(&mut ctx, &inputs).unwrap_err();
    assert_eq!(err.scope_path(), vec!["jannet0", "output0"]);
    assert!(matches!(err.root(), Error::Config(_)));
}

#[test]
fn test_missing_input_is_reported_with_scope() {
    let params = Rc::new(language_only(MemoryReductionStrategy::None));
    let mut ctx = BuildContext::new(params, ParameterStore::new());
    let inputs = BuildInputs {
        txt_tgt: Some(text(1, 3, 1, 16, 0)),
        ..Default::default()
    };
    let err = model::build(&mut ctx, &inputs).unwrap_err();
    assert_eq!(err.scope_path(), vec!["jannet0", "input0"]);
    assert!(matches!(err.root(), Error::MissingArgument(name) if name == "txt_src"));
    assert_eq!(ctx.attention_idx(), 0);
}

#[test]
fn test_discrete_video_loss_end_to_end() {
    let params = Rc::new(ModelParameter {
        use_language: false,
        use_discrete_video_loss: true,
        color_quantization_value: 8,
        n_embd: 8,
        n_head: 4,
        n_blocks: 1,
        ..Default::default()
    });
    let store = ParameterStore::new();
    let mut ctx = BuildContext::new(params, store.clone());
    let shape = Shape::new(vec![
        Dimension::new("batch", 1),
        Dimension::new("sequence", 5),
        Dimension::new("height", 2),
        Dimension::new(COLOR_CHANNELS, 3),
    ])
    .unwrap();
    let vid = Tensor::new_integer(
        (0..shape.size()).map(|i| (i % 8) as f32).collect(),
        shape,
    )
    .unwrap();
    let inputs = BuildInputs {
        vid: Some(vid),
        ..Default::default()
    };

    let out = model::build(&mut ctx, &inputs).unwrap();
    let frames = out.frame_out.as_ref().unwrap();
    assert_eq!(
        frames.shape().names(),
        vec![
            "batch",
            "sequence_per_head",
            "heads",
            "height",
            COLOR_CHANNELS,
            "discrete_color"
        ]
    );
    let loss = out.total_loss.data.item().unwrap();
    assert!(loss.is_finite() && loss > 0.0);

    out.total_loss.backward().unwrap();
    assert!(store.parameters().iter().all(|(_, v)| v.grad().is_some()));
}

#[test]
fn test_bit_fold_widens_color_channels() {
    let params = Rc::new(ModelParameter {
        use_language: false,
        use_bit_fold_input_pipeline: true,
        bit_fold_value: 4,
        fold_count: 2,
        color_channels: 6,
        n_embd: 8,
        n_head: 2,
        n_blocks: 1,
        ..Default::default()
    });
    let mut ctx = BuildContext::new(params, ParameterStore::new());
    let inputs = BuildInputs {
        vid: Some(video(&[("batch", 1), ("sequence", 3), ("height", 2), (COLOR_CHANNELS, 3)])),
        ..Default::default()
    };
    let out = model::build(&mut ctx, &inputs).unwrap();
    assert_eq!(
        out.frame_out.unwrap().shape().get(COLOR_CHANNELS).unwrap().size,
        6
    );
}

#[test]
fn test_empty_frame_embedding_uses_masks() {
    let params = Rc::new(ModelParameter {
        use_empty_frame_embedding: true,
        ..video_only(MemoryReductionStrategy::None)
    });
    let store = ParameterStore::new();
    let mut ctx = BuildContext::new(params, store.clone());
    let vid = video(&[("batch", 1), ("sequence", 3), ("height", 2), (COLOR_CHANNELS, 3)]);
    let mask_shape = Shape::new(vec![Dimension::new("batch", 1), Dimension::new("sequence", 2)])
        .unwrap();
    let inputs = BuildInputs {
        vid: Some(vid),
        vid_msk_src: Some(Tensor::new(vec![1.0, 0.0], mask_shape).unwrap()),
        ..Default::default()
    };
    let out = model::build(&mut ctx, &inputs).unwrap();
    assert!(out.total_loss.data.item().unwrap().is_finite());
    let embeddings: Vec<String> = store
        .names()
        .into_iter()
        .filter(|n| n.contains("empty_frame_embedding"))
        .collect();
    assert_eq!(embeddings.len(), 2);
}

fn check_gradients_numerically(strategy: MemoryReductionStrategy) {
    let params = Rc::new(language_only(strategy));
    let store = ParameterStore::new();
    let inputs = text_inputs();

    let mut ctx = BuildContext::new(params.clone(), store.clone());
    let out = model::build(&mut ctx, &inputs).unwrap();
    out.total_loss.backward().unwrap();

    let mut checked = 0;
    for (name, var) in store.parameters() {
        let Some(grad) = var.grad() else { continue };
        let grad = grad.broadcast_to(var.shape()).unwrap();
        let (idx, analytic) = grad
            .data()
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .unwrap();
        if analytic.abs() < 1e-3 {
            continue;
        }

        let eps = 1e-2;
        let original = var.data.clone();
        let mut plus = original.clone();
        plus.data_mut()[idx] += eps;
        store.set_value(&name, plus).unwrap();
        let up = total_loss(&params, &store, &inputs);
        let mut minus = original.clone();
        minus.data_mut()[idx] -= eps;
        store.set_value(&name, minus).unwrap();
        let down = total_loss(&params, &store, &inputs);
        store.set_value(&name, original).unwrap();

        let numeric = (up - down) / (2.0 * eps);
        assert!(
            (numeric - analytic).abs() < 2e-3 + 0.1 * analytic.abs(),
            "{strategy}: {name}[{idx}] analytic {analytic} numeric {numeric}"
        );
        checked += 1;
    }
    assert!(checked > 0);
}

#[test]
fn test_revnet_gradients_match_finite_differences() {
    check_gradients_numerically(MemoryReductionStrategy::Revnet);
}

#[test]
fn test_momentum_gradients_match_finite_differences() {
    check_gradients_numerically(MemoryReductionStrategy::Momentum);
}

#[test]
fn test_momentum_rejects_zero_alpha() {
    let params = Rc::new(ModelParameter {
        momentumnet_alpha: 0.0,
        ..language_only(MemoryReductionStrategy::Momentum)
    });
    let mut ctx = BuildContext::new(params, ParameterStore::new());
    let err = model::build(&mut ctx, &text_inputs()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(ctx.attention_idx(), 0);
}

#[test]
fn test_build_rejects_bad_head_split() {
    let zero_heads = ModelParameter {
        use_language: false,
        use_discrete_video_loss: true,
        color_quantization_value: 8,
        n_embd: 8,
        n_head: 0,
        n_blocks: 1,
        ..Default::default()
    };
    let uneven = ModelParameter {
        n_embd: 30,
        n_head: 4,
        ..language_only(MemoryReductionStrategy::None)
    };
    for params in [zero_heads, uneven] {
        let store = ParameterStore::new();
        let mut ctx = BuildContext::new(Rc::new(params), store.clone());
        let inputs = BuildInputs {
            vid: Some(video(&[("batch", 1), ("sequence", 3), ("height", 2), (COLOR_CHANNELS, 3)])),
            ..text_inputs()
        };
        let err = model::build(&mut ctx, &inputs).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(store.names().is_empty());
    }
}

#[test]
fn test_reversible_blocks_share_parameter_layout() {
    let names = |strategy| {
        let params = Rc::new(language_only(strategy));
        let store = ParameterStore::new();
        total_loss(&params, &store, &text_inputs());
        store.names()
    };
    assert_eq!(
        names(MemoryReductionStrategy::Revnet),
        names(MemoryReductionStrategy::None)
    );
}

#[test]
fn test_custom_block_config() {
    let params = Rc::new(ModelParameter {
        block_config: vec![BlockConfig::new(
            ["norm", "linear", "activation-tanh", "rezero"],
            true,
        )],
        ..language_only(MemoryReductionStrategy::Checkpoint)
    });
    let store = ParameterStore::new();
    let loss = total_loss(&params, &store, &text_inputs());
    assert!(loss.is_finite());
    assert!(store.names().iter().any(|n| n.ends_with("rezero_0/rezero")));
}

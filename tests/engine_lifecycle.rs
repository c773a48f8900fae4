use std::time::Duration;

use image::{Rgba, RgbaImage};

use shadertoy_lab::image_loader::encode_png;
use shadertoy_lab::{
    Engine, EngineConfig, EngineError, HeadlessBackend, NodeId, NodeKind, NodeOutcome,
    ShaderStage,
};

const BROKEN_SOURCE: &str = "void mainImage(out vec4 c, in vec2 p) {\n    c = vec4(1.0);\n";

fn headless(present: bool) -> Engine<HeadlessBackend> {
    Engine::new(
        HeadlessBackend::new(),
        EngineConfig::default()
            .with_default_resolution(8, 8)
            .with_presentation(present),
    )
}

fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 60) as u8, (y * 90) as u8, 200, 255])
    })
}

#[test]
fn removing_every_node_frees_its_gpu_objects() {
    let mut engine = headless(false);
    let a = engine.create_node().unwrap();
    let b = engine.create_node().unwrap();
    let c = engine.create_node().unwrap();
    engine.connect(a, b, 0).unwrap();
    engine.connect(b, c, 1).unwrap();
    engine.set_kind(c, NodeKind::Const).unwrap();
    engine.render_frame_at(0.5);

    assert_eq!(engine.backend().live_textures(), 3);
    assert_eq!(engine.backend().live_framebuffers(), 3);
    assert_eq!(engine.backend().live_programs(), 3);

    engine.remove_node(b).unwrap();
    engine.remove_node(a).unwrap();
    engine.remove_node(c).unwrap();

    let backend = engine.backend();
    assert_eq!(backend.live_textures(), 0);
    assert_eq!(backend.live_framebuffers(), 0);
    assert_eq!(backend.live_programs(), 0);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn shutdown_returns_a_clean_context() {
    let mut engine = headless(true);
    let a = engine.create_node().unwrap();
    let t = engine.create_node().unwrap();
    engine.set_kind(t, NodeKind::Texture).unwrap();
    engine.upload_image(t, &gradient(4, 4)).unwrap();
    engine.connect(t, a, 0).unwrap();
    engine.render_frame_at(0.0);
    engine.render_frame_at(0.1);

    let backend = engine.shutdown();
    assert_eq!(backend.live_objects(), 0);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn removing_a_producer_clears_consumer_slots_but_keeps_positions() {
    let mut engine = headless(false);
    let a = engine.create_node().unwrap();
    let b = engine.create_node().unwrap();
    let c = engine.create_node().unwrap();
    engine.connect(a, c, 0).unwrap();
    engine.connect(b, c, 1).unwrap();

    engine.remove_node(a).unwrap();
    assert_eq!(engine.node(c).unwrap().inputs, vec![None, Some(b)]);
    assert!(matches!(engine.remove_node(a), Err(EngineError::UnknownNode(id)) if id == a));

    let d = engine.create_node().unwrap();
    assert!(d.0 > c.0, "ids must not be reused");
    let report = engine.render_frame_at(0.0);
    assert_eq!(report.outcome(c), Some(NodeOutcome::Rendered));
    assert_eq!(report.outcome(a), None);
}

#[test]
fn recompiling_keeps_exactly_one_program() {
    let mut engine = headless(false);
    let id = engine.create_node().unwrap();
    for i in 0..10 {
        if i % 2 == 0 {
            engine.recompile(id).unwrap();
        } else {
            let source = format!(
                "void mainImage(out vec4 c, in vec2 p) {{ c = vec4(float({i}) * 0.1); }}"
            );
            engine.set_source(id, source).unwrap();
        }
    }
    assert_eq!(engine.programs().len(), 1);
    assert_eq!(engine.backend().live_programs(), 1);
    // Only the shared vertex stage stays alive between links.
    assert_eq!(engine.backend().live_shaders(), 1);
}

#[test]
fn failed_compile_keeps_the_previous_program() {
    let mut engine = headless(false);
    let id = engine.create_node().unwrap();
    let before = engine.programs().program(id).map(|p| p.raw());
    assert!(before.is_some());

    let err = engine.set_source(id, BROKEN_SOURCE).unwrap_err();
    match &err {
        EngineError::Compile { node, source } => {
            assert_eq!(*node, id);
            assert_eq!(source.stage(), Some(ShaderStage::Fragment));
            assert!(source.log().contains("unbalanced"), "{}", source.log());
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
    assert_eq!(engine.node(id).unwrap().source, BROKEN_SOURCE);
    assert_eq!(engine.programs().program(id).map(|p| p.raw()), before);
    assert_eq!(engine.backend().live_programs(), 1);
    assert_eq!(engine.backend().live_shaders(), 1);

    let diagnostics = engine.take_diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].node, id);
    assert!(engine.diagnostics().is_empty());

    let report = engine.render_frame_at(0.0);
    assert_eq!(report.outcome(id), Some(NodeOutcome::Rendered));
}

#[test]
fn node_without_any_good_program_is_skipped() {
    let mut engine = headless(false);
    let good = engine.create_node().unwrap();
    let broken = engine.create_node().unwrap();
    engine.set_kind(broken, NodeKind::Texture).unwrap();
    engine.set_source(broken, BROKEN_SOURCE).unwrap();
    assert!(matches!(
        engine.set_kind(broken, NodeKind::Shader),
        Err(EngineError::Compile { .. })
    ));
    assert!(!engine.has_program(broken));

    let report = engine.render_frame_at(0.0);
    assert_eq!(report.outcome(good), Some(NodeOutcome::Rendered));
    assert_eq!(report.outcome(broken), Some(NodeOutcome::SkippedNoProgram));
}

#[test]
fn allocation_failure_names_the_node_and_recovers_on_resize() {
    let mut backend = HeadlessBackend::new();
    backend.set_texture_limit(Some(1));
    let mut engine = Engine::new(
        backend,
        EngineConfig::default()
            .with_default_resolution(8, 8)
            .with_presentation(false),
    );
    let first = engine.create_node().unwrap();
    let err = engine.create_node().unwrap_err();
    let second = match err {
        EngineError::ResourceAllocation { node, ref message } => {
            assert!(message.contains("GL_OUT_OF_MEMORY"), "{message}");
            node
        }
        other => panic!("expected an allocation error, got {other:?}"),
    };
    assert!(engine.graph().contains(second));
    assert!(engine.has_program(second));

    let report = engine.render_frame_at(0.0);
    assert_eq!(report.outcome(first), Some(NodeOutcome::Rendered));
    assert_eq!(report.outcome(second), Some(NodeOutcome::SkippedNoResources));

    engine.backend_mut().set_texture_limit(None);
    engine.set_resolution(second, 4, 4).unwrap();
    let report = engine.render_frame_at(0.1);
    assert_eq!(report.outcome(second), Some(NodeOutcome::Rendered));
}

#[test]
fn oversized_resolution_is_an_allocation_error() {
    let mut engine = headless(false);
    let id = engine.create_node().unwrap();
    let err = engine.set_resolution(id, 100_000, 4).unwrap_err();
    assert!(matches!(err, EngineError::ResourceAllocation { node, .. } if node == id));
    assert_eq!(engine.node(id).unwrap().resolution(), [100_000, 4]);
    assert!(engine.resources().get(id).is_none());
}

#[test]
fn texture_node_keeps_its_image() {
    let mut engine = headless(true);
    let id = engine.create_node().unwrap();
    engine.set_kind(id, NodeKind::Texture).unwrap();

    let img = gradient(3, 2);
    engine.upload_image(id, &img).unwrap();
    assert_eq!(engine.node(id).unwrap().resolution(), [3, 2]);
    assert!(engine.resources().image(id).unwrap().loaded);

    let report = engine.render_frame_at(0.0);
    assert_eq!(report.outcome(id), Some(NodeOutcome::Presented));
    assert_eq!(engine.surface(id), Some(&img));

    engine.set_resolution(id, 64, 64).unwrap();
    let texture = engine.resources().texture(id).unwrap();
    assert_eq!(engine.backend().texture_size(texture), Some([3, 2]));
    assert!(!engine.has_program(id));
}

#[test]
fn rendered_output_survives_switch_to_texture() {
    let mut engine = headless(false);
    let id = engine.create_node().unwrap();
    engine.render_frame_at(0.0);
    let texture = engine.resources().texture(id).map(|t| t.raw());

    engine.set_kind(id, NodeKind::Texture).unwrap();
    assert_eq!(engine.resources().texture(id).map(|t| t.raw()), texture);
    assert!(engine.resources().image(id).unwrap().loaded);
    assert_eq!(engine.backend().live_framebuffers(), 0);
}

#[test]
fn upload_into_a_shader_node_is_refused() {
    let mut engine = headless(false);
    let id = engine.create_node().unwrap();
    let err = engine.upload_image(id, &gradient(2, 2)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::WrongKind {
            actual: NodeKind::Shader,
            expected: NodeKind::Texture,
            ..
        }
    ));
    assert!(matches!(
        engine.queue_image_bytes(id, vec![1, 2, 3]),
        Err(EngineError::WrongKind { .. })
    ));
    assert!(matches!(
        engine.upload_image(NodeId(77), &gradient(1, 1)),
        Err(EngineError::UnknownNode(_))
    ));
}

#[test]
fn queued_images_upload_after_decoding() {
    let mut engine = headless(false);
    let good = engine.create_node().unwrap();
    let bad = engine.create_node().unwrap();
    engine.set_kind(good, NodeKind::Texture).unwrap();
    engine.set_kind(bad, NodeKind::Texture).unwrap();

    let png = encode_png(&gradient(5, 3)).unwrap();
    engine.queue_image_bytes(good, png).unwrap();
    engine.queue_image_bytes(bad, b"definitely not an image".to_vec()).unwrap();
    assert!(engine.pending_image_uploads() <= 2);

    let mut results = engine.wait_image_uploads(Duration::from_secs(10));
    results.sort_by_key(|(node, _)| *node);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, good);
    assert!(results[0].1.is_ok());
    assert_eq!(results[1].0, bad);
    assert!(matches!(results[1].1, Err(EngineError::Image(_))));

    assert_eq!(engine.pending_image_uploads(), 0);
    assert_eq!(engine.node(good).unwrap().resolution(), [5, 3]);
    assert_eq!(engine.node(bad).unwrap().resolution(), [8, 8]);
    assert!(engine.poll_image_uploads().is_empty());
}

#[test]
fn const_nodes_take_picker_colors() {
    let mut engine = headless(false);
    let id = engine.create_node().unwrap();
    engine.set_kind(id, NodeKind::Const).unwrap();
    assert_eq!(engine.const_hex(id).as_deref(), Some("#ffffff"));

    engine.set_const_hex(id, "#ff8000").unwrap();
    assert_eq!(engine.const_hex(id).as_deref(), Some("#ff8000"));
    assert!(engine.node(id).unwrap().source.contains("vec4(1.000, 0.502, 0.000, 1.0)"));

    assert!(matches!(
        engine.set_const_hex(id, "#ff80zz"),
        Err(EngineError::InvalidColor(_))
    ));
    assert_eq!(engine.const_hex(id).as_deref(), Some("#ff8000"));

    let shader = engine.create_node().unwrap();
    assert!(matches!(
        engine.set_const_hex(shader, "#000000"),
        Err(EngineError::WrongKind { .. })
    ));
    assert_eq!(engine.const_hex(shader), None);
}

#[test]
fn setting_the_current_kind_changes_nothing() {
    let mut engine = headless(false);
    let id = engine.create_node().unwrap();
    let program = engine.programs().program(id).map(|p| p.raw());
    let texture = engine.resources().texture(id).map(|t| t.raw());

    engine.set_kind(id, NodeKind::Shader).unwrap();
    assert_eq!(engine.programs().program(id).map(|p| p.raw()), program);
    assert_eq!(engine.resources().texture(id).map(|t| t.raw()), texture);
    assert_eq!(engine.backend().live_programs(), 1);
    assert!(engine.take_diagnostics().is_empty());
}

use shadertoy_lab::renderer::headless::StoredUniform;
use shadertoy_lab::{
    Engine, EngineConfig, FragmentInput, GraphSnapshot, HeadlessBackend, NodeOutcome,
};

const SIZE: u32 = 16;

const DEFAULT_MARKER: &str = "0.5 + 0.5*cos(iTime+uv.xyx+vec3(0,2,4))";

const PRODUCER_SOURCE: &str = "void mainImage(out vec4 fragColor, in vec2 fragCoord) {
    fragColor = vec4(iTime, iTime * 0.5, 0.25, 1.0);
}
";
const PRODUCER_MARKER: &str = "vec4(iTime, iTime * 0.5, 0.25, 1.0)";

const PASSTHROUGH_SOURCE: &str = "void mainImage(out vec4 fragColor, in vec2 fragCoord) {
    fragColor = texture(iChannel0, fragCoord / iResolution.xy);
}
";
const PASSTHROUGH_MARKER: &str = "texture(iChannel0, fragCoord / iResolution.xy)";

fn palette(input: &FragmentInput<'_>) -> [f32; 4] {
    let [u, v] = input.uv();
    let t = input.uniform_f32("iTime");
    let channel = |offset: f32, x: f32| 0.5 + 0.5 * (t + x + offset).cos();
    [channel(0.0, u), channel(2.0, v), channel(4.0, u), 1.0]
}

fn backend() -> HeadlessBackend {
    let mut backend = HeadlessBackend::new();
    backend.register_kernel(DEFAULT_MARKER, palette);
    backend.register_kernel(PRODUCER_MARKER, |input: &FragmentInput<'_>| {
        let t = input.uniform_f32("iTime");
        [t, t * 0.5, 0.25, 1.0]
    });
    backend.register_kernel(PASSTHROUGH_MARKER, |input: &FragmentInput<'_>| {
        input.sample(0, input.uv())
    });
    backend
}

fn engine_with(backend: HeadlessBackend) -> Engine<HeadlessBackend> {
    Engine::new(
        backend,
        EngineConfig::default().with_default_resolution(SIZE, SIZE),
    )
}

#[test]
fn default_shader_paints_a_gradient() {
    let mut engine = engine_with(backend());
    let id = engine.create_node().unwrap();

    let report = engine.render_frame_at(1.0);
    assert_eq!(report.outcome(id), Some(NodeOutcome::Rendered));
    assert_eq!(report.frame, 0);

    let surface = engine.surface(id).expect("presented surface");
    assert_eq!(surface.dimensions(), (SIZE, SIZE));
    let first = surface.get_pixel(0, 0);
    assert!(
        surface.pixels().any(|p| p != first),
        "default shader output should not be uniform"
    );

    // Top-left of the surface is the last GL row.
    let u = 0.5 / SIZE as f32;
    let expected_red = ((0.5 + 0.5 * (1.0f32 + u).cos()) * 255.0).round() as i32;
    assert!((first[0] as i32 - expected_red).abs() <= 1);
    assert_eq!(first[3], 255);

    let node_draw = engine
        .backend()
        .draws()
        .iter()
        .find(|d| d.framebuffer.is_some())
        .expect("node draw recorded");
    assert_eq!(node_draw.uniforms.get("iTime"), Some(&StoredUniform::Float(1.0)));
    assert_eq!(
        node_draw.uniforms.get("iResolution"),
        Some(&StoredUniform::Vec3([SIZE as f32, SIZE as f32, 1.0]))
    );
    assert_eq!(node_draw.viewport, [SIZE, SIZE]);
    assert!(engine.backend().violations().is_empty());
}

#[test]
fn consumer_before_producer_sees_the_previous_frame() {
    let mut engine = engine_with(backend());
    let consumer = engine.create_node().unwrap();
    let producer = engine.create_node().unwrap();
    engine.set_source(consumer, PASSTHROUGH_SOURCE).unwrap();
    engine.set_source(producer, PRODUCER_SOURCE).unwrap();
    engine.connect(producer, consumer, 0).unwrap();
    assert!(engine.feedback_nodes().is_empty());

    engine.render_frame_at(0.2);
    let consumer_first = engine.surface(consumer).unwrap().clone();
    let producer_first = engine.surface(producer).unwrap().clone();
    assert!(consumer_first.pixels().all(|p| p.0 == [0, 0, 0, 0]));
    assert_eq!(producer_first.get_pixel(3, 3).0, [51, 26, 64, 255]);

    engine.render_frame_at(0.6);
    assert_eq!(engine.surface(consumer).unwrap(), &producer_first);
    assert_ne!(engine.surface(producer).unwrap(), &producer_first);
    assert!(engine.backend().violations().is_empty());
}

#[test]
fn producer_before_consumer_is_seen_in_the_same_frame() {
    let mut engine = engine_with(backend());
    let producer = engine.create_node().unwrap();
    let consumer = engine.create_node().unwrap();
    engine.set_source(producer, PRODUCER_SOURCE).unwrap();
    engine.set_source(consumer, PASSTHROUGH_SOURCE).unwrap();
    engine.connect(producer, consumer, 0).unwrap();

    engine.render_frame_at(0.4);
    assert_eq!(engine.surface(consumer), engine.surface(producer));
}

#[test]
fn channel_bank_follows_the_slots() {
    let mut engine = engine_with(backend());
    let producer = engine.create_node().unwrap();
    engine.set_resolution(producer, 8, 4).unwrap();
    let consumer = engine.create_node().unwrap();
    engine.connect(producer, consumer, 1).unwrap();
    let producer_texture = engine.resources().texture(producer).unwrap().raw();

    engine.backend_mut().take_draws();
    engine.render_frame_at(0.0);
    let consumer_target = engine.resources().target(consumer).unwrap().framebuffer.raw();
    let draw = engine
        .backend()
        .draws()
        .iter()
        .find(|d| d.framebuffer == Some(consumer_target))
        .expect("consumer draw");

    assert_eq!(draw.channels, [None, Some(producer_texture), None, None]);
    assert_eq!(draw.uniforms.get("iChannel1"), Some(&StoredUniform::Int(1)));
    assert_eq!(
        draw.uniforms.get("iChannelResolution"),
        Some(&StoredUniform::Vec3Array(vec![
            [0.0, 0.0, 0.0],
            [8.0, 4.0, 1.0],
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0],
        ]))
    );
}

#[test]
fn input_without_storage_reads_as_black() {
    let mut backend = backend();
    backend.set_texture_limit(Some(1));
    let mut engine = engine_with(backend);
    let consumer = engine.create_node().unwrap();
    engine.set_source(consumer, PASSTHROUGH_SOURCE).unwrap();
    let producer = engine.create_node().unwrap_err();
    let producer = match producer {
        shadertoy_lab::EngineError::ResourceAllocation { node, .. } => node,
        other => panic!("unexpected {other:?}"),
    };
    engine.connect(producer, consumer, 0).unwrap();

    let report = engine.render_frame_at(0.0);
    assert_eq!(report.outcome(consumer), Some(NodeOutcome::Rendered));
    assert_eq!(report.outcome(producer), Some(NodeOutcome::SkippedNoResources));
    let surface = engine.surface(consumer).unwrap();
    assert!(surface.pixels().all(|p| p.0 == [0, 0, 0, 255]));
    assert!(engine.surface(producer).is_none());
}

#[test]
fn invalid_glsl_is_skipped_without_stopping_the_frame() {
    let json = r#"{
        "nodes": [
            { "id": 1, "width": 16, "height": 16, "source": "void mainImage(out vec4 c, in vec2 p) { c = vec4(undefinedThing); }}" },
            { "id": 2, "width": 16, "height": 16, "inputs": [1] }
        ]
    }"#;
    let snapshot = GraphSnapshot::parse(json).unwrap();
    let mut engine = Engine::from_snapshot(backend(), EngineConfig::default(), &snapshot).unwrap();

    let diagnostics = engine.take_diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].node.0, 1);

    for time in [0.0, 0.5] {
        let report = engine.render_frame_at(time);
        assert_eq!(report.outcome(diagnostics[0].node), Some(NodeOutcome::SkippedNoProgram));
        assert_eq!(report.rendered(), 1);
    }
}

#[test]
fn frame_counter_and_mouse_reach_the_program() {
    let mut engine = engine_with(backend());
    let id = engine.create_node().unwrap();
    engine.set_mouse([3.0, 4.0, 1.0, 0.0]);

    assert_eq!(engine.render_frame().frame, 0);
    engine.backend_mut().take_draws();
    let report = engine.render_frame();
    assert_eq!(report.frame, 1);
    assert_eq!(report.outcome(id), Some(NodeOutcome::Rendered));

    let draw = &engine.backend().draws()[0];
    assert_eq!(draw.uniforms.get("iFrame"), Some(&StoredUniform::Float(1.0)));
    assert_eq!(
        draw.uniforms.get("iMouse"),
        Some(&StoredUniform::Vec4([3.0, 4.0, 1.0, 0.0]))
    );
    assert_eq!(draw.uniforms.get("iSampleRate"), Some(&StoredUniform::Float(44_100.0)));
}

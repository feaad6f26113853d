//! Drives a whole device through the public hooks: module and pipeline creation, recording on
//! several command buffers, submission and readback.

use std::sync::Arc;

use gpuav_printf::pipeline::{PipelineCreateDesc, PipelineStages, ShaderStageModule};
use gpuav_printf::submit::SubmitState;
use gpuav_printf::test_utils::{MockDevice, MockRewriter, OutputBufferBuilder, RecordingSink};
use gpuav_printf::{vk, DebugPrintf, DebugPrintfConfig, DeviceCapabilities, DeviceDispatch};
use gpuav_spirv::test_utils::printf_module;
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn device(config: DebugPrintfConfig) -> (DebugPrintf, Arc<MockDevice>, Arc<RecordingSink>) {
    init_tracing();
    let device = Arc::new(MockDevice::new());
    let sink = Arc::new(RecordingSink::new());
    let capabilities = DeviceCapabilities {
        api_version: vk::API_VERSION_1_2,
        vertex_pipeline_stores_and_atomics: true,
        fragment_stores_and_atomics: true,
        max_bound_descriptor_sets: 32,
    };
    let printf = DebugPrintf::new(
        device.clone(),
        capabilities,
        config,
        sink.clone(),
        Arc::new(MockRewriter::appending()),
    );
    (printf, device, sink)
}

fn create_module(printf: &DebugPrintf, device: &MockDevice, code: &[u32]) -> vk::ShaderModule {
    let plan = printf.pre_create_shader_module(code);
    let module = device.create_shader_module(plan.code(code)).unwrap();
    printf.post_create_shader_module(plan, Some(module));
    module
}

fn create_pipeline(
    printf: &DebugPrintf,
    device: &MockDevice,
    stages: PipelineStages,
) -> vk::Pipeline {
    let set_layouts = [device.layout_handle()];
    let layout_plan = printf.pre_create_pipeline_layout(&set_layouts);
    assert_eq!(layout_plan.set_layouts().len(), 32);
    let layout = device.handle();
    printf.post_create_pipeline_layout(&layout_plan, Some(layout));

    let mut desc = PipelineCreateDesc { layout, stages };
    let plan = printf.pre_create_pipeline(&mut desc);
    assert!(plan.replacement_modules().is_empty());
    let pipeline = device.handle();
    printf.post_create_pipeline(plan, Some(pipeline));
    pipeline
}

#[test]
fn graphics_and_compute_output_in_one_submission() {
    let config = DebugPrintfConfig::from_json_str(r#"{ "buffer_size": 510 }"#).unwrap();
    assert_eq!(config.buffer_size, 512);
    let (printf, device, sink) = device(config);
    assert_eq!(printf.bind_index(), 31);

    let (frag_code, frag_pos, frag_fmt) =
        printf_module("color = %v3f", "void main() {\n  debugPrintfEXT();\n}\n", 2);
    let (comp_code, comp_pos, comp_fmt) = printf_module("id %u of %lu", "", 1);
    let frag = create_module(&printf, &device, &frag_code);
    let comp = create_module(&printf, &device, &comp_code);
    let frag_id = printf.registry().shader_for_module(frag).unwrap();
    let comp_id = printf.registry().shader_for_module(comp).unwrap();
    assert_ne!(frag_id, comp_id);

    let graphics = create_pipeline(
        &printf,
        &device,
        PipelineStages::Graphics(vec![ShaderStageModule {
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: frag,
        }]),
    );
    let compute = create_pipeline(
        &printf,
        &device,
        PipelineStages::Compute(ShaderStageModule {
            stage: vk::ShaderStageFlags::COMPUTE,
            module: comp,
        }),
    );

    let draws: vk::CommandBuffer = device.handle();
    let dispatches: vk::CommandBuffer = device.handle();
    printf.pre_begin_command_buffer(draws);
    printf.post_cmd_bind_pipeline(draws, vk::PipelineBindPoint::GRAPHICS, graphics);
    printf.pre_cmd_draw(draws);
    printf.pre_begin_command_buffer(dispatches);
    printf.post_cmd_bind_pipeline(dispatches, vk::PipelineBindPoint::COMPUTE, compute);
    printf.pre_cmd_dispatch(dispatches);

    let draw_memory = printf.resources().state(draws).unwrap().resources()[0]
        .block
        .memory;
    let mut out = OutputBufferBuilder::new();
    for (x, y) in [(0.5f32, 1.0f32), (0.25, 0.0)] {
        out.record(
            frag_id,
            frag_pos as u32,
            4,
            [x.to_bits(), y.to_bits(), 0],
            frag_fmt,
            &[1.0f32.to_bits(), 0.5f32.to_bits(), 0.0f32.to_bits()],
        );
    }
    device.write_words(draw_memory, &out.finish(0));

    let dispatch_memory = printf.resources().state(dispatches).unwrap().resources()[0]
        .block
        .memory;
    let mut out = OutputBufferBuilder::new();
    out.record(comp_id, comp_pos as u32, 5, [3, 0, 0], comp_fmt, &[3, 1, 0]);
    device.write_words(dispatch_memory, &out.finish(0));

    let queue: vk::Queue = device.handle();
    let report = printf.post_queue_submit(queue, 0, &[draws, dispatches]);
    assert_eq!(report.state, SubmitState::Decoded);
    assert_eq!(report.buffers_decoded, 2);
    assert_eq!(
        sink.texts(),
        vec![
            "color = 1.000000, 0.500000, 0.000000".to_owned(),
            "color = 1.000000, 0.500000, 0.000000".to_owned(),
            "id 3 of 4294967296".to_owned(),
        ]
    );
    let messages = sink.messages();
    assert_eq!(messages[0].location.as_ref().map(|l| l.line), Some(2));
    assert!(sink.diagnostics().is_empty());
    assert_eq!(device.wait_idle_count(), 1);

    // Submitting again without re-recording reads the now-empty buffers.
    let report = printf.post_queue_submit(queue, 0, &[draws, dispatches]);
    assert_eq!(report.messages, 0);
    assert_eq!(sink.texts().len(), 3);

    let stats = printf.stats().snapshot();
    assert_eq!(stats.pipelines_tracked, 2);
    assert_eq!(stats.records_decoded, 3);
    assert!(stats.to_json().contains("\"barriers_submitted\":2"));

    printf.destroy();
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_descriptor_pools(), 0);
}

#[test]
fn hooks_are_shareable_across_recording_threads() {
    let (printf, device, _sink) = device(DebugPrintfConfig {
        descriptor_chunk_size: 4,
        ..DebugPrintfConfig::default()
    });
    let printf = Arc::new(printf);
    let (code, _, _) = printf_module("x", "", 1);
    let module = create_module(&printf, &device, &code);
    let pipeline = create_pipeline(
        &printf,
        &device,
        PipelineStages::Graphics(vec![ShaderStageModule {
            stage: vk::ShaderStageFlags::FRAGMENT,
            module,
        }]),
    );

    let command_buffers: Vec<vk::CommandBuffer> = (0..4).map(|_| device.handle()).collect();
    std::thread::scope(|scope| {
        for &cb in &command_buffers {
            let printf = printf.clone();
            scope.spawn(move || {
                printf.post_cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
                for _ in 0..5 {
                    printf.pre_cmd_draw(cb);
                }
            });
        }
    });

    assert!(!printf.is_aborted());
    assert_eq!(device.live_buffers(), 20);
    assert_eq!(device.live_descriptor_pools(), 5);

    printf.pre_free_command_buffers(&command_buffers);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_descriptor_pools(), 0);
}

//! # Device Profiler Tests
//!
//! End-to-end frames through the device profiler on a headless device.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use ash::vk::{self, Handle};
use proptest::prelude::*;

use vkprof_core::data::{Command, PipelineSource, RegionDetail, RegionKind, Timestamp};
use vkprof_core::error::ProfilerError;
use vkprof_core::profiler::{
    DeviceProfiler, MetricProperty, MetricsBackend, ProfilerConfig, ProfilerMode, SyncMode,
    VendorMetrics,
};
use vkprof_core::registry::{
    AttachmentDesc, PipelineDesc, RenderPassDesc, ShaderStageDesc, ShaderTuple, SubpassDesc,
};
use vkprof_core::util::hash::fingerprint32_words;
use vkprof_core::vulkan::{FaultInjection, HeadlessDevice};

const QUEUE: u64 = 0x1;
const POOL: u64 = 0x10;
const RENDER_PASS: u64 = 0x20;
const VERT: u64 = 0x30;
const FRAG: u64 = 0x31;
const COMP: u64 = 0x32;
const P1: u64 = 0x40;
const P2: u64 = 0x41;

fn profiler_with(config: ProfilerConfig) -> (Arc<HeadlessDevice>, DeviceProfiler) {
    let device = Arc::new(HeadlessDevice::new());
    let profiler = DeviceProfiler::new(device.clone(), config, MetricsBackend::None).unwrap();
    (device, profiler)
}

fn profiler() -> (Arc<HeadlessDevice>, DeviceProfiler) {
    profiler_with(ProfilerConfig::default())
}

/// Register shaders, one graphics pipeline P1 and one compute pipeline P2
fn register_objects(profiler: &DeviceProfiler) {
    profiler.create_shader_module(vk::ShaderModule::from_raw(VERT), &[0x0723_0203, 1, 2, 3]);
    profiler.create_shader_module(vk::ShaderModule::from_raw(FRAG), &[0x0723_0203, 4, 5, 6]);
    profiler.create_shader_module(vk::ShaderModule::from_raw(COMP), &[0x0723_0203, 7, 8, 9]);

    profiler
        .create_pipelines(
            &[vk::Pipeline::from_raw(P1), vk::Pipeline::from_raw(P2)],
            &[
                PipelineDesc::graphics(vec![
                    ShaderStageDesc::new(
                        vk::ShaderStageFlags::VERTEX,
                        vk::ShaderModule::from_raw(VERT),
                        "main",
                    ),
                    ShaderStageDesc::new(
                        vk::ShaderStageFlags::FRAGMENT,
                        vk::ShaderModule::from_raw(FRAG),
                        "main",
                    ),
                ]),
                PipelineDesc::compute(vk::ShaderModule::from_raw(COMP), "main"),
            ],
        )
        .unwrap();

    profiler.create_render_pass(
        vk::RenderPass::from_raw(RENDER_PASS),
        &RenderPassDesc {
            attachments: vec![AttachmentDesc {
                format: vk::Format::R8G8B8A8_UNORM,
                load_op: vk::AttachmentLoadOp::CLEAR,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            }],
            subpasses: vec![SubpassDesc {
                resolve_attachments: vec![],
                depth_stencil_resolve: None,
            }],
        },
    );
}

/// Record a render pass with `draws` draws using P1
fn record_draws(profiler: &DeviceProfiler, cb: vk::CommandBuffer, draws: u32) {
    profiler
        .begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap();
    profiler.pre_begin_render_pass(cb, vk::RenderPass::from_raw(RENDER_PASS));
    profiler.post_begin_render_pass(cb, vk::SubpassContents::INLINE);
    profiler.bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, vk::Pipeline::from_raw(P1));
    for _ in 0..draws {
        profiler.pre_command(cb, Command::Draw);
        profiler.post_command(cb);
    }
    profiler.pre_end_render_pass(cb);
    profiler.post_end_render_pass(cb);
    profiler.end_command_buffer(cb);
}

fn allocate(profiler: &DeviceProfiler, raws: &[u64]) -> Vec<vk::CommandBuffer> {
    let cbs: Vec<vk::CommandBuffer> = raws.iter().map(|&raw| vk::CommandBuffer::from_raw(raw)).collect();
    profiler.allocate_command_buffers(
        vk::CommandPool::from_raw(POOL),
        vk::CommandBufferLevel::PRIMARY,
        &cbs,
    );
    cbs
}

fn submit(profiler: &DeviceProfiler, cbs: &[vk::CommandBuffer]) -> vkprof_core::Result<()> {
    let queue = vk::Queue::from_raw(QUEUE);
    profiler.pre_submit(queue)?;
    profiler.post_submit(queue, &[cbs])
}

#[test_log::test]
fn test_single_draw_frame() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    record_draws(&profiler, cbs[0], 1);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    assert_eq!(data.frame_index, 0);
    assert_eq!(data.stats.draw_count, 1);
    assert_eq!(data.stats.clear_color_implicit_count, 1);
    assert_eq!(data.incomplete_command_buffers, 0);
    assert!(data.total_ticks > 0);

    assert_eq!(data.top_pipelines.len(), 1);
    assert_eq!(data.top_pipelines[0].handle, vk::Pipeline::from_raw(P1));

    assert_eq!(data.submit_batches.len(), 1);
    assert_eq!(data.submit_batches[0].queue, vk::Queue::from_raw(QUEUE));
    assert_eq!(data.submit_batches[0].submits.len(), 1);
    assert_eq!(data.submit_batches[0].submits[0].command_buffers.len(), 1);

    let root = &data.submit_batches[0].submits[0].command_buffers[0].region;
    assert_eq!(root.kind, RegionKind::CommandBuffer);
    let render_pass = &root.children[0];
    assert_eq!(render_pass.kind, RegionKind::RenderPass);
    let subpass = &render_pass.children[0];
    assert_eq!(subpass.kind, RegionKind::Subpass);
    let pipeline = &subpass.children[0];
    assert_eq!(pipeline.kind, RegionKind::Pipeline);
    assert_eq!(pipeline.handle, Some(P1));
    assert_eq!(pipeline.children.len(), 1);
    assert_eq!(pipeline.children[0].kind, RegionKind::Drawcall);
}

#[test_log::test]
fn test_get_data_returns_last_finished_frame() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    record_draws(&profiler, cbs[0], 2);
    submit(&profiler, &cbs).unwrap();
    assert_eq!(profiler.get_data().stats.draw_count, 0);

    profiler.finish_frame().unwrap();
    let first = profiler.get_data();
    assert_eq!(first.stats.draw_count, 2);

    // Recording of the next frame does not touch the published data
    record_draws(&profiler, cbs[0], 5);
    submit(&profiler, &cbs).unwrap();
    assert_eq!(profiler.get_data().stats.draw_count, 2);

    profiler.finish_frame().unwrap();
    let second = profiler.get_data();
    assert_eq!(second.frame_index, 1);
    assert_eq!(second.stats.draw_count, 5);
    assert_eq!(first.stats.draw_count, 2);
    assert_eq!(profiler.current_frame(), 2);
}

#[test_log::test]
fn test_concurrent_recording() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let profiler = Arc::new(profiler);
    let cbs = allocate(&profiler, &[0x100, 0x101]);

    let handles: Vec<_> = cbs
        .iter()
        .enumerate()
        .map(|(i, &cb)| {
            let profiler = profiler.clone();
            thread::spawn(move || record_draws(&profiler, cb, 3 + i as u32))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    assert_eq!(data.stats.draw_count, 7);
    assert_eq!(data.command_buffers().count(), 2);
    for snapshot in data.command_buffers() {
        assert!(snapshot.complete);
        assert!(snapshot.region.is_resolved());
    }
}

#[test_log::test]
fn test_freed_command_buffer_still_contributes() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    record_draws(&profiler, cbs[0], 4);
    submit(&profiler, &cbs).unwrap();
    profiler.free_command_buffers(&cbs);
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    assert_eq!(data.stats.draw_count, 4);
    assert_eq!(data.incomplete_command_buffers, 0);
}

#[test_log::test]
fn test_rerecording_flushes_pending_data() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    record_draws(&profiler, cbs[0], 1);
    submit(&profiler, &cbs).unwrap();
    record_draws(&profiler, cbs[0], 2);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    assert_eq!(data.submit_batches.len(), 2);
    assert_eq!(data.stats.draw_count, 3);
}

#[test_log::test]
fn test_destroy_pool_removes_only_its_command_buffers() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let own = allocate(&profiler, &[0x100, 0x101]);

    let other = vk::CommandBuffer::from_raw(0x200);
    profiler.allocate_command_buffers(
        vk::CommandPool::from_raw(0x11),
        vk::CommandBufferLevel::PRIMARY,
        &[other],
    );

    profiler.destroy_command_pool(vk::CommandPool::from_raw(POOL));

    // Commands on destroyed command buffers are ignored
    profiler.pre_command(own[0], Command::Draw);
    profiler.post_command(own[0]);

    record_draws(&profiler, other, 2);
    submit(&profiler, &[other]).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    assert_eq!(data.stats.draw_count, 2);
    assert_eq!(data.command_buffers().count(), 1);
}

#[test_log::test]
fn test_merged_depth_stencil_clear_counts_once() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let render_pass = vk::RenderPass::from_raw(0x21);
    profiler.create_render_pass(
        render_pass,
        &RenderPassDesc {
            attachments: vec![AttachmentDesc {
                format: vk::Format::D24_UNORM_S8_UINT,
                load_op: vk::AttachmentLoadOp::CLEAR,
                stencil_load_op: vk::AttachmentLoadOp::CLEAR,
            }],
            subpasses: vec![SubpassDesc {
                resolve_attachments: vec![],
                depth_stencil_resolve: None,
            }],
        },
    );
    assert_eq!(profiler.render_pass(render_pass).unwrap().clear_depth_stencil_count, 1);

    let cbs = allocate(&profiler, &[0x100]);
    profiler
        .begin_command_buffer(cbs[0], vk::CommandBufferUsageFlags::empty())
        .unwrap();
    profiler.pre_begin_render_pass(cbs[0], render_pass);
    profiler.post_begin_render_pass(cbs[0], vk::SubpassContents::INLINE);
    profiler.pre_end_render_pass(cbs[0]);
    profiler.post_end_render_pass(cbs[0]);
    profiler.end_command_buffer(cbs[0]);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    assert_eq!(data.stats.clear_depth_stencil_implicit_count, 1);
    assert_eq!(data.stats.clear_color_implicit_count, 0);
}

#[test_log::test]
fn test_shader_tuple_identity() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);

    let p1 = profiler.pipeline(vk::Pipeline::from_raw(P1)).unwrap();
    let vert = ShaderTuple::stage_hash(fingerprint32_words(&[0x0723_0203, 1, 2, 3]), "main");
    let frag = ShaderTuple::stage_hash(fingerprint32_words(&[0x0723_0203, 4, 5, 6]), "main");
    assert_eq!(p1.shader_tuple.vert, vert);
    assert_eq!(p1.shader_tuple.frag, frag);
    assert_eq!(p1.shader_tuple.comp, 0);

    // Same shaders, same identity
    let twin = vk::Pipeline::from_raw(0x50);
    profiler
        .create_pipelines(
            &[twin],
            &[PipelineDesc::graphics(vec![
                ShaderStageDesc::new(
                    vk::ShaderStageFlags::VERTEX,
                    vk::ShaderModule::from_raw(VERT),
                    "main",
                ),
                ShaderStageDesc::new(
                    vk::ShaderStageFlags::FRAGMENT,
                    vk::ShaderModule::from_raw(FRAG),
                    "main",
                ),
            ])],
        )
        .unwrap();
    assert_eq!(profiler.pipeline(twin).unwrap().shader_tuple, p1.shader_tuple);

    // Another entry point changes the stage hash
    let other = vk::Pipeline::from_raw(0x51);
    profiler
        .create_pipelines(
            &[other],
            &[PipelineDesc::compute(vk::ShaderModule::from_raw(COMP), "other")],
        )
        .unwrap();
    let p2 = profiler.pipeline(vk::Pipeline::from_raw(P2)).unwrap();
    assert_ne!(
        profiler.pipeline(other).unwrap().shader_tuple.comp,
        p2.shader_tuple.comp
    );
}

fn compute_tuple(code: &[u32], entry: &str) -> ShaderTuple {
    let (_device, profiler) = profiler();
    let module = vk::ShaderModule::from_raw(COMP);
    profiler.create_shader_module(module, code);
    profiler
        .create_pipelines(
            &[vk::Pipeline::from_raw(P2)],
            &[PipelineDesc::compute(module, entry)],
        )
        .unwrap();
    profiler.pipeline(vk::Pipeline::from_raw(P2)).unwrap().shader_tuple
}

proptest! {
    #[test]
    fn prop_shader_tuple_is_content_identity(
        code in prop::collection::vec(any::<u32>(), 1..32),
        entry in "[a-z_]{1,12}",
        flip in any::<u32>().prop_filter("non-zero", |v| *v != 0),
    ) {
        let tuple = compute_tuple(&code, &entry);
        prop_assert_eq!(compute_tuple(&code, &entry), tuple);

        let mut changed = code.clone();
        changed[0] ^= flip;
        prop_assert_ne!(compute_tuple(&changed, &entry).hash, tuple.hash);

        let renamed = format!("{}x", entry);
        prop_assert_ne!(compute_tuple(&code, &renamed).hash, tuple.hash);
    }
}

#[test_log::test]
fn test_pipeline_with_unregistered_module() {
    let (_device, profiler) = profiler();

    let err = profiler
        .create_pipelines(
            &[vk::Pipeline::from_raw(P2)],
            &[PipelineDesc::compute(vk::ShaderModule::from_raw(0x99), "main")],
        )
        .unwrap_err();
    assert!(matches!(err, ProfilerError::NotFound { .. }));
    assert!(profiler.pipeline(vk::Pipeline::from_raw(P2)).is_err());

    let err = profiler
        .create_pipelines(&[vk::Pipeline::from_raw(P2)], &[])
        .unwrap_err();
    assert!(matches!(err, ProfilerError::InvalidArgument(_)));
}

#[test_log::test]
fn test_default_and_debug_pipeline_names() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);

    let p1 = profiler.pipeline(vk::Pipeline::from_raw(P1)).unwrap();
    let p2 = profiler.pipeline(vk::Pipeline::from_raw(P2)).unwrap();
    assert_eq!(
        profiler.object_name(vk::ObjectType::PIPELINE, P1),
        Some(format!(
            "VS={:08x},PS={:08x}",
            p1.shader_tuple.vert, p1.shader_tuple.frag
        ))
    );
    assert_eq!(
        profiler.object_name(vk::ObjectType::PIPELINE, P2),
        Some(format!("CS={:08x}", p2.shader_tuple.comp))
    );

    profiler.set_debug_object_name(vk::ObjectType::PIPELINE, P1, "GBuffer");

    let cbs = allocate(&profiler, &[0x100]);
    record_draws(&profiler, cbs[0], 1);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();
    assert_eq!(
        profiler.get_data().top_pipelines[0].name.as_deref(),
        Some("GBuffer")
    );

    profiler.destroy_pipeline(vk::Pipeline::from_raw(P1));
    assert_eq!(profiler.object_name(vk::ObjectType::PIPELINE, P1), None);
}

#[test_log::test]
fn test_compute_outside_render_pass() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);
    let cb = cbs[0];

    profiler
        .begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
        .unwrap();
    profiler.bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, vk::Pipeline::from_raw(P2));
    profiler.pre_command(cb, Command::Dispatch);
    profiler.post_command(cb);
    profiler.pre_command(cb, Command::CopyBuffer);
    profiler.post_command(cb);
    profiler.end_command_buffer(cb);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    let subpass = &data.submit_batches[0].submits[0].command_buffers[0].region.children[0].children[0];
    assert!(matches!(
        subpass.children[0].detail,
        RegionDetail::Pipeline {
            source: PipelineSource::Application(p),
            ..
        } if p.as_raw() == P2
    ));
    assert_eq!(data.top_pipelines.len(), 1);
    assert_eq!(data.top_pipelines[0].handle.as_raw(), P2);
}

#[test_log::test]
fn test_unknown_command_buffer_is_adopted() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cb = vk::CommandBuffer::from_raw(0x300);

    record_draws(&profiler, cb, 1);
    submit(&profiler, &[cb]).unwrap();
    profiler.finish_frame().unwrap();

    assert_eq!(profiler.get_data().stats.draw_count, 1);
}

#[test_log::test]
fn test_secondary_command_buffer_in_render_pass() {
    let (device, profiler) = profiler();
    register_objects(&profiler);
    let primary = allocate(&profiler, &[0x100])[0];
    let secondary = vk::CommandBuffer::from_raw(0x200);
    profiler.allocate_command_buffers(
        vk::CommandPool::from_raw(POOL),
        vk::CommandBufferLevel::SECONDARY,
        &[secondary],
    );

    profiler
        .begin_command_buffer(
            secondary,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
        )
        .unwrap();
    profiler.bind_pipeline(secondary, vk::PipelineBindPoint::GRAPHICS, vk::Pipeline::from_raw(P1));
    profiler.pre_command(secondary, Command::Draw);
    profiler.post_command(secondary);
    profiler.end_command_buffer(secondary);

    profiler
        .begin_command_buffer(primary, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap();
    profiler.pre_command(
        primary,
        Command::PipelineBarrier {
            memory_barrier_count: 0,
            buffer_barrier_count: 0,
            image_barrier_count: 1,
        },
    );
    profiler.post_command(primary);
    profiler.pre_begin_render_pass(primary, vk::RenderPass::from_raw(RENDER_PASS));

    let written = device.counters().timestamps_written;
    profiler.post_begin_render_pass(primary, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
    profiler.execute_commands(primary, &[secondary]);
    profiler.pre_end_render_pass(primary);
    assert_eq!(device.counters().timestamps_written, written);

    profiler.post_end_render_pass(primary);
    profiler.end_command_buffer(primary);
    submit(&profiler, &[primary]).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    assert_eq!(data.command_buffers().count(), 1);
    assert_eq!(data.incomplete_command_buffers, 0);
    assert_eq!(data.stats.draw_count, 1);
    assert_eq!(data.stats.execute_commands_count, 1);
    assert_eq!(data.top_pipelines.len(), 1);
    assert_eq!(data.top_pipelines[0].handle, vk::Pipeline::from_raw(P1));
    assert_eq!(data.top_pipelines[0].stats.draw_count, 1);

    let primary_data = &data.submit_batches[0].submits[0].command_buffers[0];
    assert_eq!(primary_data.handle, primary);
    assert_eq!(primary_data.region.count(RegionKind::Drawcall), 2);

    let render_pass = &primary_data.region.children[1];
    assert_eq!(render_pass.handle, Some(RENDER_PASS));
    assert!(render_pass.is_resolved());

    let subpass = &render_pass.children[0];
    assert_eq!(
        subpass.detail,
        RegionDetail::Subpass {
            index: Some(0),
            contents: vk::SubpassContents::SECONDARY_COMMAND_BUFFERS
        }
    );
    assert_eq!(subpass.begin, Timestamp::Untimed);
    assert!(subpass.children.is_empty());
    assert_eq!(subpass.stats.draw_count, 1);
    assert_eq!(subpass.secondaries.len(), 1);

    let executed = &subpass.secondaries[0];
    assert_eq!(executed.handle, secondary);
    assert_eq!(executed.level, vk::CommandBufferLevel::SECONDARY);
    assert!(executed.complete);
    assert_eq!(executed.region.stats.draw_count, 1);

    let inherited = &executed.region.children[0];
    assert_eq!(inherited.kind, RegionKind::RenderPass);
    assert_eq!(inherited.handle, None);
    let inherited_subpass = &inherited.children[0];
    assert_eq!(
        inherited_subpass.detail,
        RegionDetail::Subpass {
            index: None,
            contents: vk::SubpassContents::INLINE
        }
    );
    assert!(inherited_subpass.secondaries.is_empty());

    let pipeline = &inherited_subpass.children[0];
    assert_eq!(pipeline.handle, Some(P1));
    assert_eq!(pipeline.stats.draw_count, 1);
    assert_eq!(
        pipeline.children[0].detail,
        RegionDetail::Drawcall {
            command: Command::Draw
        }
    );
}

#[test_log::test]
fn test_concurrent_submit_waits() {
    let device = Arc::new(HeadlessDevice::new());
    let config = ProfilerConfig {
        sync_mode: SyncMode::Submit,
        ..Default::default()
    };
    let profiler = Arc::new(DeviceProfiler::new(device.clone(), config, MetricsBackend::None).unwrap());
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100, 0x101]);

    let handles: Vec<_> = cbs
        .iter()
        .map(|&cb| {
            let profiler = profiler.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    record_draws(&profiler, cb, 1);
                    submit(&profiler, &[cb]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(device.counters().fence_signals, 400);
    assert_eq!(device.counters().fence_waits, 400);

    profiler.finish_frame().unwrap();
    let data = profiler.get_data();
    assert_eq!(data.submit_batches.len(), 400);
    assert_eq!(data.stats.draw_count, 400);
}

#[test_log::test]
fn test_mode_from_raw_value() {
    let (_device, profiler) = profiler();

    profiler.set_mode_raw(2).unwrap();
    assert_eq!(profiler.mode(), ProfilerMode::PerRenderPass);

    let err = profiler.set_mode_raw(6).unwrap_err();
    assert!(matches!(err, ProfilerError::InvalidArgument(_)));
    assert_eq!(profiler.mode(), ProfilerMode::PerRenderPass);
}

#[test_log::test]
fn test_sync_modes() {
    let (device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    assert_eq!(profiler.sync_mode(), SyncMode::Present);
    record_draws(&profiler, cbs[0], 1);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();
    assert_eq!(device.counters().idle_waits, 1);
    assert_eq!(device.counters().fence_waits, 0);

    profiler.set_sync_mode_raw(1).unwrap();
    assert_eq!(profiler.sync_mode(), SyncMode::Submit);
    record_draws(&profiler, cbs[0], 1);
    submit(&profiler, &cbs).unwrap();
    assert_eq!(device.counters().fence_signals, 1);
    assert_eq!(device.counters().fence_waits, 1);
    let readbacks = device.counters().readbacks;
    assert!(readbacks >= 2);

    profiler.finish_frame().unwrap();
    assert_eq!(device.counters().idle_waits, 1);
    assert_eq!(device.counters().readbacks, readbacks);
    assert_eq!(profiler.get_data().stats.draw_count, 1);
}

#[test_log::test]
fn test_invalid_sync_mode_is_rejected() {
    let (_device, profiler) = profiler();

    let err = profiler.set_sync_mode_raw(2).unwrap_err();
    assert!(matches!(err, ProfilerError::InvalidArgument(_)));
    assert_eq!(err.as_vk_result(), vk::Result::ERROR_VALIDATION_FAILED_EXT);
    assert_eq!(profiler.sync_mode(), SyncMode::Present);
}

#[test_log::test]
fn test_mode_applies_from_next_recording() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    profiler.set_mode(ProfilerMode::PerRenderPass);
    assert_eq!(profiler.mode(), ProfilerMode::PerRenderPass);
    record_draws(&profiler, cbs[0], 3);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();

    let data = profiler.get_data();
    let root = &data.submit_batches[0].submits[0].command_buffers[0].region;
    assert_eq!(root.count(RegionKind::RenderPass), 1);
    assert_eq!(root.count(RegionKind::Subpass), 0);
    assert_eq!(root.count(RegionKind::Drawcall), 0);
    assert_eq!(data.stats.draw_count, 3);
    // No pipeline regions, so nothing to rank
    assert!(data.top_pipelines.is_empty());
}

#[test_log::test]
fn test_device_lost_propagates() {
    let device = Arc::new(HeadlessDevice::new());
    let config = ProfilerConfig {
        sync_mode: SyncMode::Submit,
        ..Default::default()
    };
    let profiler = DeviceProfiler::new(device.clone(), config, MetricsBackend::None).unwrap();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    record_draws(&profiler, cbs[0], 1);
    device.set_faults(FaultInjection {
        device_lost: true,
        ..Default::default()
    });

    let err = submit(&profiler, &cbs).unwrap_err();
    assert_eq!(err, ProfilerError::DeviceLost);
    assert!(err.is_fatal());

    profiler.finish_frame().unwrap();
    assert_eq!(profiler.get_data().incomplete_command_buffers, 1);
}

#[test_log::test]
fn test_fence_creation_failure() {
    let device = Arc::new(HeadlessDevice::new());
    device.set_faults(FaultInjection {
        fail_fence_creation: true,
        ..Default::default()
    });

    let result = DeviceProfiler::new(device, ProfilerConfig::default(), MetricsBackend::None);
    assert!(matches!(result, Err(ProfilerError::ResourceExhausted(_))));
}

#[test_log::test]
fn test_memory_stats_attached() {
    let (_device, profiler) = profiler();

    profiler.on_allocate_memory(vk::DeviceMemory::from_raw(0x1), 4096, 0);
    profiler.on_allocate_memory(vk::DeviceMemory::from_raw(0x2), 1024, 2);
    profiler.on_free_memory(vk::DeviceMemory::from_raw(0x2));
    profiler.finish_frame().unwrap();

    let memory = &profiler.get_data().memory;
    assert_eq!(memory.total_allocated, 4096);
    assert_eq!(memory.device_local_allocated, 4096);
    assert_eq!(memory.allocation_count, 2);
    assert_eq!(memory.deallocation_count, 1);
}

#[test_log::test]
fn test_frame_json_export() {
    let (_device, profiler) = profiler();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    record_draws(&profiler, cbs[0], 1);
    submit(&profiler, &cbs).unwrap();
    profiler.finish_frame().unwrap();

    let json: serde_json::Value = serde_json::from_str(&profiler.get_data().to_json()).unwrap();
    assert_eq!(json["frame_index"], 0);
    assert_eq!(json["command_buffer_count"], 1);
    assert_eq!(json["stats"]["draw_count"], 1);
    assert!(json["top_pipelines"].is_array());
    assert!(json["registry_access"].is_array());
}

#[derive(Default)]
struct ConfigurationCounts {
    acquired: AtomicU32,
    released: AtomicU32,
}

struct TestMetrics(Arc<ConfigurationCounts>);

impl VendorMetrics for TestMetrics {
    fn metric_properties(&self) -> Vec<MetricProperty> {
        vec![MetricProperty {
            name: "GpuBusy".into(),
            category: "GPU".into(),
            description: "Percentage of time the GPU was busy".into(),
            unit: "percent".into(),
        }]
    }

    fn acquire_configuration(
        &self,
        _queue: vk::Queue,
    ) -> vkprof_core::Result<vk::PerformanceConfigurationINTEL> {
        let n = self.0.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(vk::PerformanceConfigurationINTEL::from_raw(0x900 + n as u64))
    }

    fn release_configuration(&self, _configuration: vk::PerformanceConfigurationINTEL) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[test_log::test]
fn test_vendor_configuration_is_paired() {
    let counts = Arc::new(ConfigurationCounts::default());
    let device = Arc::new(HeadlessDevice::new());
    let profiler = DeviceProfiler::new(
        device,
        ProfilerConfig::default(),
        MetricsBackend::IntelMetricsDiscovery(Box::new(TestMetrics(counts.clone()))),
    )
    .unwrap();
    register_objects(&profiler);
    let cbs = allocate(&profiler, &[0x100]);

    assert_eq!(profiler.metric_properties().len(), 1);

    for _ in 0..3 {
        record_draws(&profiler, cbs[0], 1);
        submit(&profiler, &cbs).unwrap();
    }
    profiler.finish_frame().unwrap();

    assert_eq!(counts.acquired.load(Ordering::SeqCst), 3);
    assert_eq!(counts.released.load(Ordering::SeqCst), 3);
}

#[test_log::test]
fn test_config_validation_on_create() {
    let device = Arc::new(HeadlessDevice::new());
    let config = ProfilerConfig {
        queries_per_command_buffer: 1,
        ..Default::default()
    };

    let result = DeviceProfiler::new(device, config, MetricsBackend::None);
    assert!(matches!(result, Err(ProfilerError::InvalidArgument(_))));
}

//! End-to-end dispatch tests.
//!
//! These need a real adapter.  On machines without one (CI containers
//! without a software rasteriser, for instance) every test returns early
//! after printing a note.

use gridlaunch::{
    compute_grid, discover_device, enqueue, read_back, read_back_vec, resolve_entry_point,
    AccessMode, ComputeSession, Device, DeviceBuffer, DispatchError, DispatchPipeline, DispatchPlan,
    ElementType, Extent2, HarnessConfig, HostMatrix, KernelArg, MatrixShape, PipelineStage, PlanArg,
    ProgramBuilder, Released, TileSpec,
};

const FILL: &str = include_str!("../kernels/fill_constant.wgsl");
const MATRIX_INDEX: &str = include_str!("../kernels/matrix_index.wgsl");

const SCALE: &str = r#"
@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<uniform> factor: f32;

@compute @workgroup_size(4, 4)
fn scale(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.y * 8u + id.x;
    output[i] = input[i] * factor;
}
"#;

fn device() -> Option<Device> {
    match discover_device(&HarnessConfig::default()) {
        Ok(device) => Some(device),
        Err(e) => {
            eprintln!("skipping: no usable adapter ({e})");
            None
        }
    }
}

fn session() -> Option<ComputeSession> {
    let device = device()?;
    match ComputeSession::open(device, &HarnessConfig::default()) {
        Ok(session) => Some(session),
        Err(e) => {
            eprintln!("skipping: could not open a session ({e})");
            None
        }
    }
}

#[test]
fn fills_a_16x16_image_over_16_groups() {
    let Some(device) = device() else { return };
    let plan = DispatchPlan::<f32>::new(FILL, "fill_constant", MatrixShape::new(16, 16))
        .arg(0, PlanArg::Output(AccessMode::ReadWrite));
    let mut pipeline = DispatchPipeline::new(HarnessConfig::default());

    let outcome = pipeline.run_on(device, &plan).unwrap();
    assert_eq!(outcome.grid.local(), Extent2::new(4, 4));
    assert_eq!(outcome.grid.group_count(), 16);
    assert_eq!(outcome.result.as_slice().len(), 256);
    assert!(outcome.result.as_slice().iter().all(|&v| v == 42.0));

    assert_eq!(pipeline.stage(), PipelineStage::TornDown);
    assert_eq!(
        pipeline.teardown_journal(),
        &[
            Released::Buffer("output@0".into()),
            Released::Queue,
            Released::Context
        ]
    );
}

#[test]
fn scalar_arguments_reach_the_kernel() {
    let Some(device) = device() else { return };
    let shape = MatrixShape::new(16, 16);
    let plan = DispatchPlan::<i32>::new(MATRIX_INDEX, "matrix_index", shape)
        .element(ElementType::I32)
        .arg(0, PlanArg::Output(AccessMode::ReadWrite))
        .arg(1, PlanArg::scalar(16u32));

    let outcome = DispatchPipeline::new(HarnessConfig::default())
        .run_on(device, &plan)
        .unwrap();
    let expected = HostMatrix::from_fn(shape, |row, col| (row * 16 + col) as i32);
    assert_eq!(outcome.result, expected);
}

#[test]
fn default_tile_handles_shapes_other_than_16x16() {
    let Some(device) = device() else { return };
    let shape = MatrixShape::new(32, 32);
    let plan = DispatchPlan::<i32>::new(MATRIX_INDEX, "matrix_index", shape)
        .arg(0, PlanArg::Output(AccessMode::ReadWrite))
        .arg(1, PlanArg::scalar(32u32));

    let outcome = DispatchPipeline::new(HarnessConfig::default())
        .run_on(device, &plan)
        .unwrap();
    assert_eq!(outcome.grid.local(), Extent2::new(4, 4));
    assert_eq!(outcome.grid.group_count(), 64);
    assert_eq!(outcome.result.get(31, 31), Some(32 * 32 - 1));
}

#[test]
fn mismatched_element_type_is_rejected() {
    let Some(device) = device() else { return };
    let plan = DispatchPlan::<f32>::new(MATRIX_INDEX, "matrix_index", MatrixShape::new(16, 16))
        .element(ElementType::F32)
        .arg(0, PlanArg::Output(AccessMode::ReadWrite))
        .arg(1, PlanArg::scalar(16u32));
    let mut pipeline = DispatchPipeline::new(HarnessConfig::default());

    let err = pipeline.run_on(device, &plan).unwrap_err();
    assert!(matches!(err, DispatchError::ArgumentBind { index: 0, .. }));
    assert_eq!(pipeline.stage(), PipelineStage::TornDown);
}

#[test]
fn inputs_are_uploaded_before_the_dispatch() {
    let Some(device) = device() else { return };
    let shape = MatrixShape::new(8, 8);
    let input = HostMatrix::from_fn(shape, |row, col| (row * 8 + col) as f32);
    let plan = DispatchPlan::<f32>::new(SCALE, "scale", shape)
        .tile(TileSpec::Divide(2))
        .arg(0, PlanArg::Input(input.clone()))
        .arg(1, PlanArg::Output(AccessMode::ReadWrite))
        .arg(2, PlanArg::scalar(0.5f32));

    let mut pipeline = DispatchPipeline::new(HarnessConfig::default());
    let outcome = pipeline.run_on(device, &plan).unwrap();
    for (got, src) in outcome.result.as_slice().iter().zip(input.as_slice()) {
        assert_eq!(*got, src * 0.5);
    }
    // Newest buffer first.
    assert_eq!(
        &pipeline.teardown_journal()[..2],
        &[
            Released::Buffer("output@1".into()),
            Released::Buffer("input@0".into())
        ]
    );
}

#[test]
fn build_failure_carries_the_log_and_releases_the_session_once() {
    let Some(device) = device() else { return };
    let plan = DispatchPlan::<f32>::new("fn broken( {", "broken", MatrixShape::new(16, 16))
        .arg(0, PlanArg::Output(AccessMode::ReadWrite));
    let mut pipeline = DispatchPipeline::new(HarnessConfig::default());

    let err = pipeline.run_on(device, &plan).unwrap_err();
    let log = err.build_log().expect("build errors carry a log");
    assert!(!log.is_empty());
    assert!(log.len() <= 4096);

    assert_eq!(pipeline.stage(), PipelineStage::TornDown);
    assert_eq!(
        pipeline.teardown_journal(),
        &[Released::Queue, Released::Context]
    );
}

#[test]
fn missing_entry_point_tears_down_allocated_buffers() {
    let Some(device) = device() else { return };
    let plan = DispatchPlan::<f32>::new(FILL, "does_not_exist", MatrixShape::new(16, 16))
        .arg(0, PlanArg::Output(AccessMode::ReadWrite));
    let mut pipeline = DispatchPipeline::new(HarnessConfig::default());

    let err = pipeline.run_on(device, &plan).unwrap_err();
    assert!(matches!(err, DispatchError::EntryPointNotFound { .. }));
    // The build itself succeeded, so its log outlives the failed run.
    assert!(err.build_log().is_none());
    assert!(pipeline.build_log().is_some());
    assert_eq!(
        pipeline.teardown_journal(),
        &[
            Released::Buffer("output@0".into()),
            Released::Queue,
            Released::Context
        ]
    );
}

#[test]
fn binding_past_the_parameter_list_is_rejected() {
    let Some(session) = session() else { return };
    let program = ProgramBuilder::default().build(&session, FILL).unwrap();
    let image =
        DeviceBuffer::allocate_for::<f32>(&session, MatrixShape::new(16, 16), AccessMode::ReadWrite)
            .unwrap();

    let mut kernel = resolve_entry_point(&program, "fill_constant").unwrap();
    let err = kernel
        .bind_argument(3, KernelArg::buffer(&image))
        .unwrap_err();
    assert!(matches!(err, DispatchError::ArgumentBind { index: 3, .. }));
    assert_eq!(kernel.unbound(), vec![0]);

    kernel.bind_argument(0, KernelArg::buffer(&image)).unwrap();
    assert!(kernel.is_fully_bound());
}

#[test]
fn unbound_arguments_block_the_enqueue() {
    let Some(session) = session() else { return };
    let program = ProgramBuilder::default().build(&session, FILL).unwrap();
    let kernel = resolve_entry_point(&program, "fill_constant").unwrap();
    let grid = compute_grid(Extent2::new(16, 16), TileSpec::Divide(4)).unwrap();

    let err = enqueue(&session, &kernel, &grid).unwrap_err();
    assert!(matches!(err, DispatchError::Enqueue { .. }));
}

#[test]
fn tile_must_match_the_kernel_workgroup() {
    let Some(session) = session() else { return };
    let program = ProgramBuilder::default().build(&session, FILL).unwrap();
    let image =
        DeviceBuffer::allocate_for::<f32>(&session, MatrixShape::new(16, 16), AccessMode::ReadWrite)
            .unwrap();
    let mut kernel = resolve_entry_point(&program, "fill_constant").unwrap();
    kernel.bind_argument(0, KernelArg::buffer(&image)).unwrap();

    let grid = compute_grid(Extent2::new(16, 16), TileSpec::Fixed(Extent2::new(8, 8))).unwrap();
    let err = enqueue(&session, &kernel, &grid).unwrap_err();
    assert!(matches!(err, DispatchError::Config(_)));
}

#[test]
fn read_back_checks_the_destination_size() {
    let Some(session) = session() else { return };
    let shape = MatrixShape::new(16, 16);
    let program = ProgramBuilder::default().build(&session, FILL).unwrap();
    let image = DeviceBuffer::allocate_for::<f32>(&session, shape, AccessMode::ReadWrite).unwrap();
    let mut kernel = resolve_entry_point(&program, "fill_constant").unwrap();
    kernel.bind_argument(0, KernelArg::buffer(&image)).unwrap();
    let grid = compute_grid(shape.extent().unwrap(), TileSpec::Divide(4)).unwrap();
    enqueue(&session, &kernel, &grid).unwrap().wait(&session).unwrap();

    let mut short = vec![0.0f32; 255];
    let err = read_back(&session, &image, &mut short).unwrap_err();
    assert!(matches!(err, DispatchError::Transfer(_)));

    let mut host = HostMatrix::<f32>::zeroed(shape);
    read_back(&session, &image, host.as_mut_slice()).unwrap();
    assert_eq!(host.get(15, 15), Some(42.0));
}

#[test]
fn write_only_buffers_cannot_be_read_back() {
    let Some(session) = session() else { return };
    let sink = DeviceBuffer::allocate(&session, 64, AccessMode::WriteOnly).unwrap();
    let err = read_back_vec::<u32>(&session, &sink).unwrap_err();
    assert!(matches!(err, DispatchError::Transfer(_)));
}

#[test]
fn written_buffers_read_back_unchanged() {
    let Some(session) = session() else { return };
    let data: Vec<u32> = (0..37).collect();
    let buffer = DeviceBuffer::allocate(&session, 37 * 4, AccessMode::ReadOnly).unwrap();
    buffer.write(&session, &data).unwrap();
    assert_eq!(read_back_vec::<u32>(&session, &buffer).unwrap(), data);

    let err = DeviceBuffer::allocate(&session, 0, AccessMode::ReadWrite).unwrap_err();
    assert!(matches!(err, DispatchError::Allocation { size: 0, .. }));
}

#[test]
fn closing_twice_is_harmless() {
    let Some(mut session) = session() else { return };
    assert!(session.is_open());
    assert!(session.close());
    assert!(!session.close());
    assert!(!session.is_open());
    assert!(matches!(session.gpu(), Err(DispatchError::SessionClosed)));
}

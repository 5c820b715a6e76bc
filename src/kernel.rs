//! Kernel resolution, argument binding and dispatch.
//!
//! A [`KernelHandle`] is one compute entry point of a built program plus
//! the arguments bound to it so far.  Arguments are positional: index
//! `n` is the variable declared with `@group(0) @binding(n)`.  Buffers
//! bind to storage parameters and scalars bind to uniform parameters.
//! Each binding is checked on its own and a rejected binding leaves the
//! rest of the table untouched.
//!
//! [`enqueue`] turns the handle into a compute pipeline and a bind group,
//! records a 2-D dispatch and submits it to the session's queue.  The
//! submission is asynchronous; wait on the returned [`PendingExecution`]
//! or read a buffer back to synchronise.

use std::collections::BTreeMap;

use bytemuck::Pod;
use log::debug;
use wgpu::util::DeviceExt;

use crate::buffer::{AccessMode, DeviceBuffer};
use crate::error::{DispatchError, Result};
use crate::grid::WorkGridSpec;
use crate::program::{CompiledProgram, EntryPointInfo, KernelParam, ParamKind};
use crate::session::ComputeSession;

/// Uniform blocks are padded to this many bytes.
const UNIFORM_ALIGNMENT: usize = 16;

/// A value bound to a kernel parameter.
#[derive(Debug, Clone)]
pub enum KernelArg<'a> {
    /// A device buffer, bound to a storage parameter.
    Buffer(&'a DeviceBuffer),
    /// Raw bytes of a scalar, bound to a uniform parameter.
    Scalar(Vec<u8>),
}

impl<'a> KernelArg<'a> {
    pub fn buffer(buffer: &'a DeviceBuffer) -> Self {
        KernelArg::Buffer(buffer)
    }

    /// A scalar argument such as `1.0f32` or `16u32`.
    pub fn scalar<T: Pod>(value: T) -> Self {
        KernelArg::Scalar(bytemuck::bytes_of(&value).to_vec())
    }

    fn view(&self) -> ArgView {
        match self {
            KernelArg::Buffer(b) => ArgView::Buffer(b.access()),
            KernelArg::Scalar(bytes) => ArgView::Scalar(bytes.len()),
        }
    }
}

/// The properties of an argument that binding rules look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgView {
    Buffer(AccessMode),
    Scalar(usize),
}

/// Check that an argument of shape `arg` may be bound to `param`.
fn check_binding(param: &KernelParam, arg: ArgView) -> Result<()> {
    let index = param.index;
    match (param.kind, arg) {
        (ParamKind::Storage { writable }, ArgView::Buffer(access)) => {
            if writable && !access.kernel_writes() {
                return Err(DispatchError::bind(
                    index,
                    format!("kernel writes this parameter but the buffer is {access}"),
                ));
            }
            if !writable && !access.kernel_reads() {
                return Err(DispatchError::bind(
                    index,
                    format!("kernel only reads this parameter but the buffer is {access}"),
                ));
            }
            Ok(())
        }
        (ParamKind::Uniform { size }, ArgView::Scalar(len)) => {
            if len != size as usize {
                return Err(DispatchError::bind(
                    index,
                    format!("parameter is {size} bytes but the scalar is {len}"),
                ));
            }
            Ok(())
        }
        (ParamKind::Storage { .. }, ArgView::Scalar(_)) => Err(DispatchError::bind(
            index,
            "parameter is a storage buffer but a scalar was given",
        )),
        (ParamKind::Uniform { .. }, ArgView::Buffer(_)) => Err(DispatchError::bind(
            index,
            "parameter is a uniform scalar but a buffer was given",
        )),
    }
}

/// Positional bindings for one entry point.
#[derive(Debug, Clone)]
pub(crate) struct ArgumentTable<'a> {
    entry: EntryPointInfo,
    args: BTreeMap<u32, KernelArg<'a>>,
}

impl<'a> ArgumentTable<'a> {
    pub(crate) fn new(entry: EntryPointInfo) -> Self {
        Self {
            entry,
            args: BTreeMap::new(),
        }
    }

    fn bind(&mut self, index: u32, arg: KernelArg<'a>) -> Result<()> {
        let param = self.entry.param(index).ok_or_else(|| {
            DispatchError::bind(
                index,
                format!(
                    "kernel '{}' declares {} parameter(s) at indices {:?}",
                    self.entry.name,
                    self.entry.params.len(),
                    self.entry.params.iter().map(|p| p.index).collect::<Vec<_>>()
                ),
            )
        })?;
        check_binding(param, arg.view())?;
        self.args.insert(index, arg);
        Ok(())
    }

    fn unbound(&self) -> Vec<u32> {
        self.entry
            .params
            .iter()
            .map(|p| p.index)
            .filter(|i| !self.args.contains_key(i))
            .collect()
    }
}

/// A resolved compute entry point and its bound arguments.
#[derive(Debug)]
pub struct KernelHandle<'a> {
    program: &'a CompiledProgram,
    table: ArgumentTable<'a>,
}

/// Look up the compute entry point `name` in `program`.
///
/// Fails with [`DispatchError::EntryPointNotFound`] when the program has
/// no such entry point, and with [`DispatchError::UnsupportedKernel`] when
/// it uses resources the launcher cannot bind.
pub fn resolve_entry_point<'a>(program: &'a CompiledProgram, name: &str) -> Result<KernelHandle<'a>> {
    let entry = program.interface().entry_point(name)?.clone();
    if let Some(reason) = &entry.unsupported {
        return Err(DispatchError::UnsupportedKernel {
            name: name.to_string(),
            reason: reason.clone(),
        });
    }
    debug!("resolved kernel '{name}' with {} parameter(s)", entry.params.len());
    Ok(KernelHandle {
        program,
        table: ArgumentTable::new(entry),
    })
}

impl<'a> KernelHandle<'a> {
    /// Entry point name.
    pub fn name(&self) -> &str {
        &self.table.entry.name
    }

    /// Declared parameters, sorted by index.
    pub fn params(&self) -> &[KernelParam] {
        &self.table.entry.params
    }

    /// The entry point's `@workgroup_size`.
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.table.entry.workgroup_size
    }

    /// Bind `arg` at positional `index`, replacing any earlier binding.
    ///
    /// Fails with [`DispatchError::ArgumentBind`] naming `index` when the
    /// kernel declares no such parameter or the argument does not fit it.
    /// A failed call leaves every existing binding as it was.
    pub fn bind_argument(&mut self, index: u32, arg: KernelArg<'a>) -> Result<()> {
        self.table.bind(index, arg)
    }

    /// The argument currently bound at `index`.
    pub fn argument(&self, index: u32) -> Option<&KernelArg<'a>> {
        self.table.args.get(&index)
    }

    /// Indices of declared parameters with no binding yet.
    pub fn unbound(&self) -> Vec<u32> {
        self.table.unbound()
    }

    /// Whether every declared parameter has a binding.
    pub fn is_fully_bound(&self) -> bool {
        self.unbound().is_empty()
    }
}

/// A submitted dispatch that may still be running.
#[derive(Debug)]
#[must_use = "a dispatch is only known to be complete after waiting or reading back"]
pub struct PendingExecution {
    kernel: String,
    submission: wgpu::SubmissionIndex,
}

impl PendingExecution {
    /// Name of the dispatched kernel.
    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    /// Block until this submission has finished on the device.
    pub fn wait(self, session: &ComputeSession) -> Result<()> {
        session
            .gpu()?
            .poll(wgpu::PollType::WaitForSubmissionIndex(self.submission))
            .map(|_| ())
            .map_err(|e| DispatchError::enqueue(&self.kernel, format!("waiting for completion failed: {e}")))
    }
}

/// Check `grid` against the entry point's workgroup size and the
/// per-dimension group limit of the device.
fn check_grid(entry: &EntryPointInfo, grid: &WorkGridSpec, max_groups: u32) -> Result<()> {
    let local = grid.local();
    let declared = entry.workgroup_size;
    if [local.x, local.y, 1] != declared {
        return Err(DispatchError::Config(format!(
            "tile {local} does not match the @workgroup_size({}, {}, {}) of kernel '{}'",
            declared[0], declared[1], declared[2], entry.name
        )));
    }
    let groups = grid.groups();
    if groups.x > max_groups || groups.y > max_groups {
        return Err(DispatchError::Config(format!(
            "{groups} work-groups exceed the device limit of {max_groups} per dimension"
        )));
    }
    Ok(())
}

/// Submit `kernel` for execution over `grid` on the session's queue.
///
/// Every declared parameter must be bound and the grid's tile must equal
/// the kernel's workgroup size.  Grid defects are reported as
/// [`DispatchError::Config`]; everything else as [`DispatchError::Enqueue`].
pub fn enqueue(
    session: &ComputeSession,
    kernel: &KernelHandle<'_>,
    grid: &WorkGridSpec,
) -> Result<PendingExecution> {
    let gpu = session.gpu()?;
    let queue = session.queue()?;
    let name = kernel.name();

    let unbound = kernel.unbound();
    if !unbound.is_empty() {
        return Err(DispatchError::enqueue(
            name,
            format!("arguments {unbound:?} are not bound"),
        ));
    }
    check_grid(
        &kernel.table.entry,
        grid,
        gpu.limits().max_compute_workgroups_per_dimension,
    )?;

    gpu.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = gpu.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(name),
        layout: None,
        module: kernel.program.module(),
        entry_point: Some(name),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });

    // Scalars become small uniform buffers that live until submission.
    let uniforms: BTreeMap<u32, wgpu::Buffer> = kernel
        .table
        .args
        .iter()
        .filter_map(|(&index, arg)| match arg {
            KernelArg::Scalar(bytes) => {
                let mut contents = bytes.clone();
                contents.resize(bytes.len().div_ceil(UNIFORM_ALIGNMENT) * UNIFORM_ALIGNMENT, 0);
                let buffer = gpu.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("kernel_scalar"),
                    contents: &contents,
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                Some((index, buffer))
            }
            KernelArg::Buffer(_) => None,
        })
        .collect();

    let bind_group = if kernel.params().is_empty() {
        None
    } else {
        let entries: Vec<wgpu::BindGroupEntry<'_>> = kernel
            .params()
            .iter()
            .filter_map(|param| {
                let buffer = match kernel.argument(param.index)? {
                    KernelArg::Buffer(b) => b.raw(),
                    KernelArg::Scalar(_) => uniforms.get(&param.index)?,
                };
                Some(wgpu::BindGroupEntry {
                    binding: param.index,
                    resource: buffer.as_entire_binding(),
                })
            })
            .collect();
        let layout = pipeline.get_bind_group_layout(0);
        Some(gpu.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_arguments"),
            layout: &layout,
            entries: &entries,
        }))
    };

    let groups = grid.groups();
    let mut encoder = gpu.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("dispatch_encoder"),
    });
    {
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("dispatch_pass"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&pipeline);
        if let Some(bind_group) = &bind_group {
            cpass.set_bind_group(0, bind_group, &[]);
        }
        cpass.dispatch_workgroups(groups.x, groups.y, 1);
    }
    let submission = queue.submit([encoder.finish()]);
    if let Some(e) = pollster::block_on(gpu.pop_error_scope()) {
        return Err(DispatchError::enqueue(name, e.to_string()));
    }
    debug!("enqueued '{name}': {grid}");
    Ok(PendingExecution {
        kernel: name.to_string(),
        submission,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{compute_grid, Extent2, TileSpec};
    use crate::program::ProgramInterface;

    const SCALED_FILL: &str = r#"
@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<uniform> scale: f32;

@compute @workgroup_size(4, 4)
fn scaled_fill(@builtin(global_invocation_id) id: vec3<u32>) {
    output[id.y * 16u + id.x] = input[id.y * 16u + id.x] * scale;
}
"#;

    fn entry() -> EntryPointInfo {
        ProgramInterface::reflect(SCALED_FILL)
            .unwrap()
            .entry_point("scaled_fill")
            .unwrap()
            .clone()
    }

    #[test]
    fn storage_parameters_respect_access_modes() {
        let e = entry();
        let input = e.param(0).unwrap();
        let output = e.param(1).unwrap();

        assert!(check_binding(input, ArgView::Buffer(AccessMode::ReadOnly)).is_ok());
        assert!(check_binding(input, ArgView::Buffer(AccessMode::ReadWrite)).is_ok());
        assert!(check_binding(output, ArgView::Buffer(AccessMode::WriteOnly)).is_ok());
        assert!(check_binding(output, ArgView::Buffer(AccessMode::ReadWrite)).is_ok());

        // Read-only buffers must never be a kernel write target.
        let err = check_binding(output, ArgView::Buffer(AccessMode::ReadOnly)).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentBind { index: 1, .. }));
        // Write-only buffers hold nothing a kernel could meaningfully read.
        let err = check_binding(input, ArgView::Buffer(AccessMode::WriteOnly)).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentBind { index: 0, .. }));
    }

    #[test]
    fn scalars_must_match_the_declared_size() {
        let e = entry();
        let scale = e.param(2).unwrap();
        assert!(check_binding(scale, KernelArg::scalar(2.0f32).view()).is_ok());
        let err = check_binding(scale, KernelArg::scalar(2.0f64).view()).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentBind { index: 2, .. }));
        assert!(check_binding(e.param(0).unwrap(), KernelArg::scalar(1u32).view()).is_err());
        assert!(check_binding(scale, ArgView::Buffer(AccessMode::ReadOnly)).is_err());
    }

    #[test]
    fn binding_past_the_parameter_count_names_the_index() {
        let mut table = ArgumentTable::new(entry());
        table.bind(2, KernelArg::scalar(3.0f32)).unwrap();

        let err = table.bind(3, KernelArg::scalar(1.0f32)).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentBind { index: 3, .. }));
        let err = table.bind(7, KernelArg::scalar(1.0f32)).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentBind { index: 7, .. }));

        // The earlier binding survives the failures.
        match table.args.get(&2) {
            Some(KernelArg::Scalar(bytes)) => assert_eq!(bytes, &3.0f32.to_ne_bytes()),
            other => panic!("binding 2 was disturbed: {other:?}"),
        }
        assert_eq!(table.unbound(), [0, 1]);
    }

    #[test]
    fn rejected_rebinding_keeps_the_previous_value() {
        let mut table = ArgumentTable::new(entry());
        table.bind(2, KernelArg::scalar(3.0f32)).unwrap();
        assert!(table.bind(2, KernelArg::scalar(3.0f64)).is_err());
        assert!(matches!(table.args.get(&2), Some(KernelArg::Scalar(b)) if b.len() == 4));
        table.bind(2, KernelArg::scalar(5.0f32)).unwrap();
        assert!(matches!(table.args.get(&2), Some(KernelArg::Scalar(b)) if b == &5.0f32.to_ne_bytes()));
    }

    #[test]
    fn grid_must_match_workgroup_size() {
        let e = entry();
        let grid = compute_grid(Extent2::new(16, 16), TileSpec::Divide(4)).unwrap();
        assert!(check_grid(&e, &grid, 65535).is_ok());

        let wrong = compute_grid(Extent2::new(16, 16), TileSpec::Fixed(Extent2::new(8, 8))).unwrap();
        assert!(matches!(check_grid(&e, &wrong, 65535), Err(DispatchError::Config(_))));

        let huge = compute_grid(Extent2::new(4 * 70_000, 16), TileSpec::Fixed(Extent2::new(4, 4))).unwrap();
        assert!(matches!(check_grid(&e, &huge, 65535), Err(DispatchError::Config(_))));
    }
}

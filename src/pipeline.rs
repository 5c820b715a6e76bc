//! The end-to-end dispatch pipeline.
//!
//! [`DispatchPipeline`] runs every stage in order: enumerate platforms,
//! select a device, open a session, build the program, allocate and fill
//! buffers, resolve the kernel, bind its arguments, enqueue it over the
//! work grid and read the result back.  What varies between programs is
//! described by a [`DispatchPlan`]: the kernel source, the entry point,
//! the result shape, the tile and the positional arguments.
//!
//! Whatever happens, the pipeline ends in [`PipelineStage::TornDown`]:
//! buffers are released in reverse allocation order, then the session
//! releases its queue and its context.  Each release is recorded in the
//! teardown journal.

use std::fmt;

use bytemuck::Pod;
use log::{debug, error, info, warn};

use crate::buffer::{AccessMode, DeviceBuffer};
use crate::config::HarnessConfig;
use crate::device::{select_device, Device};
use crate::error::{DispatchError, Result};
use crate::grid::{compute_grid, TileSpec, WorkGridSpec};
use crate::kernel::{enqueue, resolve_entry_point, KernelArg};
use crate::matrix::{HostMatrix, MatrixShape};
use crate::platform::{create_instance, list_platforms};
use crate::program::{BuildLog, ElementType, KernelParam, ProgramBuilder};
use crate::session::ComputeSession;
use crate::transfer::read_back;

/// Where a pipeline run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Uninitialized,
    PlatformsEnumerated,
    DeviceSelected,
    SessionOpen,
    ProgramBuilt,
    KernelResolved,
    ArgumentsBound,
    Enqueued,
    Completed,
    Failed,
    TornDown,
}

/// One resource released during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    /// A device buffer, by label.
    Buffer(String),
    /// The session's command queue.
    Queue,
    /// The session's context (logical device).
    Context,
}

impl fmt::Display for Released {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Released::Buffer(label) => write!(f, "buffer {label}"),
            Released::Queue => write!(f, "queue"),
            Released::Context => write!(f, "context"),
        }
    }
}

/// A positional kernel argument in a [`DispatchPlan`].
#[derive(Debug, Clone)]
pub enum PlanArg<T> {
    /// The result buffer, sized from the plan's shape.  Exactly one per plan,
    /// and read-write since the host reads it back.
    Output(AccessMode),
    /// A host matrix uploaded into a read-only buffer.
    Input(HostMatrix<T>),
    /// Raw scalar bytes, see [`PlanArg::scalar`].
    Scalar(Vec<u8>),
}

impl<T> PlanArg<T> {
    /// A scalar argument of any plain-old-data type.
    pub fn scalar<S: Pod>(value: S) -> Self {
        PlanArg::Scalar(bytemuck::bytes_of(&value).to_vec())
    }
}

/// Everything that distinguishes one dispatch from another.
#[derive(Debug, Clone)]
pub struct DispatchPlan<T> {
    source: String,
    entry_point: String,
    shape: MatrixShape,
    tile: TileSpec,
    element: Option<ElementType>,
    args: Vec<(u32, PlanArg<T>)>,
}

impl<T: Pod> DispatchPlan<T> {
    /// A plan running `entry_point` from `source` over a `shape` result.
    /// The tile defaults to the kernel's `@workgroup_size`.
    pub fn new(source: impl Into<String>, entry_point: impl Into<String>, shape: MatrixShape) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
            shape,
            tile: TileSpec::Workgroup,
            element: None,
            args: Vec::new(),
        }
    }

    /// Choose how the tile is derived.
    pub fn tile(mut self, tile: TileSpec) -> Self {
        self.tile = tile;
        self
    }

    /// Require the kernel's output array to hold `element` values, so the
    /// result is not reinterpreted as a different type on read-back.
    pub fn element(mut self, element: ElementType) -> Self {
        self.element = Some(element);
        self
    }

    /// Add the argument bound at positional `index`.
    pub fn arg(mut self, index: u32, arg: PlanArg<T>) -> Self {
        self.args.push((index, arg));
        self
    }

    pub fn shape(&self) -> MatrixShape {
        self.shape
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Check the plan is self-consistent before anything is built.
    pub fn validate(&self) -> Result<()> {
        let outputs = self
            .args
            .iter()
            .filter(|(_, a)| matches!(a, PlanArg::Output(_)))
            .count();
        if outputs != 1 {
            return Err(DispatchError::Config(format!(
                "a plan needs exactly one output argument, found {outputs}"
            )));
        }
        let mut indices: Vec<u32> = self.args.iter().map(|(i, _)| *i).collect();
        indices.sort_unstable();
        if indices.windows(2).any(|w| w[0] == w[1]) {
            return Err(DispatchError::Config(format!(
                "argument indices {indices:?} contain duplicates"
            )));
        }
        if let Some((_, PlanArg::Output(access))) =
            self.args.iter().find(|(_, a)| matches!(a, PlanArg::Output(_)))
        {
            if *access != AccessMode::ReadWrite {
                return Err(DispatchError::Config(format!(
                    "the output buffer is read back, so it must be read-write, not {access}"
                )));
            }
        }
        self.shape.byte_len::<T>()?;
        if self.tile != TileSpec::Workgroup {
            compute_grid(self.shape.extent()?, self.tile)?;
        }
        Ok(())
    }

    /// The work grid for a kernel declaring `workgroup_size`.
    pub fn grid(&self, workgroup_size: [u32; 3]) -> Result<WorkGridSpec> {
        compute_grid(self.shape.extent()?, self.tile.resolve(workgroup_size))
    }

    fn output_index(&self) -> Option<u32> {
        self.args
            .iter()
            .find(|(_, a)| matches!(a, PlanArg::Output(_)))
            .map(|(index, _)| *index)
    }
}

/// Check that the parameter at `index` stores `expected` elements.
/// Parameters whose element type cannot be named are accepted.
fn check_element(params: &[KernelParam], index: u32, expected: ElementType) -> Result<()> {
    match params.iter().find(|p| p.index == index).and_then(|p| p.element) {
        Some(found) if found != expected => Err(DispatchError::bind(
            index,
            format!("kernel stores {found} elements but the host matrix holds {expected}"),
        )),
        _ => Ok(()),
    }
}

/// What a successful run hands back.
#[derive(Debug)]
pub struct DispatchOutcome<T> {
    /// The filled result matrix.
    pub result: HostMatrix<T>,
    /// Build diagnostics, possibly with warnings.
    pub build_log: BuildLog,
    /// Description of the device that ran the kernel.
    pub device: String,
    /// The grid the kernel ran over.
    pub grid: WorkGridSpec,
}

/// Runs [`DispatchPlan`]s from device discovery to teardown.
#[derive(Debug)]
pub struct DispatchPipeline {
    config: HarnessConfig,
    stage: PipelineStage,
    journal: Vec<Released>,
    build_log: Option<BuildLog>,
}

impl DispatchPipeline {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            stage: PipelineStage::Uninitialized,
            journal: Vec::new(),
            build_log: None,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The stage the last run reached.
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Resources released by the last run, in release order.
    pub fn teardown_journal(&self) -> &[Released] {
        &self.journal
    }

    /// Diagnostics of the last run's successful build.  Still available
    /// when a later stage failed; a failed build carries its log in
    /// [`DispatchError::Build`] instead.
    pub fn build_log(&self) -> Option<&BuildLog> {
        self.build_log.as_ref()
    }

    fn advance(&mut self, stage: PipelineStage) {
        debug!("pipeline: {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    fn fail(&mut self, err: &DispatchError) {
        error!("pipeline failed after {:?}: {err}", self.stage);
        self.advance(PipelineStage::Failed);
    }

    /// Discover a device and run `plan` on it.
    pub fn run<T: Pod>(&mut self, plan: &DispatchPlan<T>) -> Result<DispatchOutcome<T>> {
        self.reset();
        let instance = create_instance(self.config.backends);
        let device = match list_platforms(&instance, self.config.backends) {
            Ok(platforms) => {
                self.advance(PipelineStage::PlatformsEnumerated);
                select_device(&platforms, self.config.preferred_kind)
            }
            Err(e) => Err(e),
        };
        match device {
            Ok(device) => self.run_selected(device, plan),
            Err(e) => {
                self.fail(&e);
                self.advance(PipelineStage::TornDown);
                Err(e)
            }
        }
    }

    /// Run `plan` on an already selected device.
    pub fn run_on<T: Pod>(&mut self, device: Device, plan: &DispatchPlan<T>) -> Result<DispatchOutcome<T>> {
        self.reset();
        self.run_selected(device, plan)
    }

    fn reset(&mut self) {
        self.stage = PipelineStage::Uninitialized;
        self.journal.clear();
        self.build_log = None;
    }

    fn run_selected<T: Pod>(&mut self, device: Device, plan: &DispatchPlan<T>) -> Result<DispatchOutcome<T>> {
        self.advance(PipelineStage::DeviceSelected);
        let device_name = device.to_string();
        let session = match ComputeSession::open(device, &self.config) {
            Ok(session) => session,
            Err(e) => {
                self.fail(&e);
                self.advance(PipelineStage::TornDown);
                return Err(e);
            }
        };
        self.advance(PipelineStage::SessionOpen);

        let mut buffers = Vec::new();
        let outcome = self.drive(&session, plan, &mut buffers);
        if let Err(e) = &outcome {
            self.fail(e);
        }
        self.teardown(session, buffers);
        outcome.map(|(result, build_log, grid)| {
            info!("dispatch of '{}' completed on {device_name}", plan.entry_point);
            DispatchOutcome {
                result,
                build_log,
                device: device_name,
                grid,
            }
        })
    }

    /// The stages between an open session and a completed read-back.
    /// Every buffer allocated here is pushed onto `buffers` so teardown
    /// can release it whether or not a later stage fails.
    fn drive<T: Pod>(
        &mut self,
        session: &ComputeSession,
        plan: &DispatchPlan<T>,
        buffers: &mut Vec<DeviceBuffer>,
    ) -> Result<(HostMatrix<T>, BuildLog, WorkGridSpec)> {
        plan.validate()?;

        let program = ProgramBuilder::new(self.config.build_log_limit).build(session, &plan.source)?;
        self.build_log = Some(program.log().clone());
        self.advance(PipelineStage::ProgramBuilt);

        // Positional index -> slot in `buffers`.
        let mut slots = Vec::new();
        let mut output_slot = 0;
        for (index, arg) in &plan.args {
            match arg {
                PlanArg::Output(access) => {
                    output_slot = buffers.len();
                    slots.push((*index, buffers.len()));
                    buffers.push(DeviceBuffer::allocate_labeled(
                        session,
                        plan.shape.byte_len::<T>()?,
                        *access,
                        &format!("output@{index}"),
                    )?);
                }
                PlanArg::Input(matrix) => {
                    let buffer = DeviceBuffer::allocate_labeled(
                        session,
                        matrix.shape().byte_len::<T>()?,
                        AccessMode::ReadOnly,
                        &format!("input@{index}"),
                    )?;
                    slots.push((*index, buffers.len()));
                    buffers.push(buffer);
                    // Pushed first so a failed upload still reaches teardown.
                    if let Some(buffer) = buffers.last() {
                        buffer.write(session, matrix.as_slice())?;
                    }
                }
                PlanArg::Scalar(_) => {}
            }
        }
        let buffers: &[DeviceBuffer] = buffers;

        let mut kernel = resolve_entry_point(&program, &plan.entry_point)?;
        self.advance(PipelineStage::KernelResolved);
        let grid = plan.grid(kernel.workgroup_size())?;
        if let (Some(expected), Some(index)) = (plan.element, plan.output_index()) {
            check_element(kernel.params(), index, expected)?;
        }

        for (index, arg) in &plan.args {
            let value = match arg {
                PlanArg::Scalar(bytes) => KernelArg::Scalar(bytes.clone()),
                _ => {
                    let slot = slots
                        .iter()
                        .find(|(i, _)| i == index)
                        .map(|(_, slot)| *slot)
                        .ok_or_else(|| DispatchError::bind(*index, "no buffer allocated"))?;
                    KernelArg::Buffer(&buffers[slot])
                }
            };
            kernel.bind_argument(*index, value).inspect_err(|e| {
                warn!("binding argument {index} of '{}' failed: {e}", plan.entry_point);
            })?;
        }
        self.advance(PipelineStage::ArgumentsBound);

        let pending = enqueue(session, &kernel, &grid)?;
        self.advance(PipelineStage::Enqueued);
        pending.wait(session)?;

        let mut result = HostMatrix::zeroed(plan.shape);
        read_back(session, &buffers[output_slot], result.as_mut_slice())?;
        self.advance(PipelineStage::Completed);
        Ok((result, program.log().clone(), grid))
    }

    /// Release buffers newest first, then the session.
    fn teardown(&mut self, mut session: ComputeSession, buffers: Vec<DeviceBuffer>) {
        for buffer in buffers.into_iter().rev() {
            let label = buffer.label().to_string();
            if let Err(e) = buffer.release(&session) {
                warn!("releasing {label} reported: {e}");
            }
            self.journal.push(Released::Buffer(label));
        }
        if session.close() {
            self.journal.push(Released::Queue);
            self.journal.push(Released::Context);
        }
        self.advance(PipelineStage::TornDown);
    }
}

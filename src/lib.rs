//! A small host-side harness for dispatching compute kernels onto an
//! attached accelerator using [wgpu](https://github.com/gfx-rs/wgpu).
//! The harness discovers a usable device, compiles WGSL kernel source
//! into a program, allocates device buffers, binds positional kernel
//! arguments, partitions the problem into a 2-D work grid, launches the
//! kernel and synchronously reads the result back into host memory.
//!
//! Each stage is available on its own (see the modules below) and the
//! whole sequence is packaged as [`DispatchPipeline`], driven by a
//! [`DispatchPlan`].  Every stage reports failure through
//! [`DispatchError`]; nothing in the library aborts the process, and
//! resources acquired before a failure are always released.
//!
//! ```no_run
//! use gridlaunch::{AccessMode, DispatchPipeline, DispatchPlan, HarnessConfig, MatrixShape, PlanArg};
//!
//! const FILL: &str = r#"
//! @group(0) @binding(0) var<storage, read_write> out: array<f32>;
//! @compute @workgroup_size(4, 4)
//! fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
//!     out[id.y * 16u + id.x] = 7.0;
//! }
//! "#;
//!
//! let plan = DispatchPlan::<f32>::new(FILL, "fill", MatrixShape::new(16, 16))
//!     .arg(0, PlanArg::Output(AccessMode::ReadWrite));
//! let outcome = DispatchPipeline::new(HarnessConfig::default()).run(&plan)?;
//! assert!(outcome.result.as_slice().iter().all(|&v| v == 7.0));
//! # Ok::<(), gridlaunch::DispatchError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod grid;
pub mod kernel;
pub mod matrix;
pub mod pipeline;
pub mod platform;
pub mod program;
pub mod session;
pub mod source;
pub mod transfer;

// Re-export the most common types at the crate root so that users can
// simply `use gridlaunch::*;`.
pub use buffer::{AccessMode, DeviceBuffer};
pub use config::HarnessConfig;
pub use device::{discover_device, select_device, select_from_pool, Classify, Device, DeviceKind};
pub use error::{DispatchError, Result};
pub use grid::{compute_grid, Extent2, TileSpec, WorkGridSpec};
pub use kernel::{enqueue, resolve_entry_point, KernelArg, KernelHandle, PendingExecution};
pub use matrix::{HostMatrix, MatrixShape};
pub use pipeline::{DispatchOutcome, DispatchPipeline, DispatchPlan, PipelineStage, PlanArg, Released};
pub use platform::{list_platforms, Platform};
pub use program::{BuildLog, CompiledProgram, ElementType, ProgramBuilder, ProgramInterface};
pub use session::ComputeSession;
pub use source::load_kernel_source;
pub use transfer::{read_back, read_back_vec};

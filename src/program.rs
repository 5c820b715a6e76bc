//! Program compilation and kernel reflection.
//!
//! Building a program is a two step affair.  The WGSL source is first run
//! through the naga front end, which parses and validates it and tells us
//! which compute entry points exist and which resources each one uses.
//! The source is then handed to the device as a shader module, and the
//! driver's own compilation messages are collected.  Diagnostics from
//! both steps end up in a single bounded [`BuildLog`], which is kept on
//! success too since a successful build may still carry warnings.

use std::fmt;

use log::{info, warn};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, Handle, Module, ScalarKind, ShaderStage, StorageAccess, Type, TypeInner};

use crate::config::MIN_BUILD_LOG_LIMIT;
use crate::error::{DispatchError, Result};
use crate::session::ComputeSession;

/// Bounded build diagnostic text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildLog {
    text: String,
    limit: usize,
    truncated: bool,
}

impl BuildLog {
    /// An empty log that keeps at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append one diagnostic entry.  Entries beyond the limit are cut on a
    /// character boundary and the log is marked truncated.
    pub fn push(&mut self, entry: &str) {
        if self.truncated {
            return;
        }
        let entry = entry.trim_end();
        if entry.is_empty() {
            return;
        }
        let sep = usize::from(!self.text.is_empty());
        let room = self.limit.saturating_sub(self.text.len() + sep);
        if sep == 1 && room > 0 {
            self.text.push('\n');
        }
        if entry.len() <= room {
            self.text.push_str(entry);
            return;
        }
        let mut cut = room;
        while cut > 0 && !entry.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&entry[..cut]);
        self.truncated = true;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether entries were dropped or cut to respect the limit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl fmt::Display for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// What a kernel parameter is bound to on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A storage buffer; `writable` is true for `read_write` access.
    Storage { writable: bool },
    /// A uniform block holding `size` bytes, used for scalar arguments.
    Uniform { size: u32 },
}

/// 32-bit scalar element types a host matrix can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    I32,
    U32,
}

impl ElementType {
    /// The element type of a scalar or of an array of scalars.
    fn reflect(module: &Module, ty: Handle<Type>) -> Option<Self> {
        let mut inner = &module.types[ty].inner;
        if let TypeInner::Array { base, .. } = inner {
            inner = &module.types[*base].inner;
        }
        match inner {
            TypeInner::Scalar(scalar) => match (scalar.kind, scalar.width) {
                (ScalarKind::Float, 4) => Some(ElementType::F32),
                (ScalarKind::Sint, 4) => Some(ElementType::I32),
                (ScalarKind::Uint, 4) => Some(ElementType::U32),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::F32 => write!(f, "f32"),
            ElementType::I32 => write!(f, "i32"),
            ElementType::U32 => write!(f, "u32"),
        }
    }
}

/// One positional parameter of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    /// Positional index (the `@binding` number in group 0).
    pub index: u32,
    /// Variable name in the source, if any.
    pub name: Option<String>,
    pub kind: ParamKind,
    /// Scalar element type, when it is one of [`ElementType`].
    pub element: Option<ElementType>,
}

/// Reflected signature of one compute entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointInfo {
    pub name: String,
    /// `@workgroup_size` of the entry point.
    pub workgroup_size: [u32; 3],
    /// Parameters sorted by index.
    pub params: Vec<KernelParam>,
    /// Set when the entry point uses something the launcher cannot bind.
    pub unsupported: Option<String>,
}

impl EntryPointInfo {
    /// The parameter declared at `index`.
    pub fn param(&self, index: u32) -> Option<&KernelParam> {
        self.params.iter().find(|p| p.index == index)
    }
}

/// The entry points a program declares, as seen by the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInterface {
    entry_points: Vec<EntryPointInfo>,
}

impl ProgramInterface {
    /// Parse, validate and reflect `source` without touching a device.
    ///
    /// Parse and validation failures are rendered against the source and
    /// returned as [`DispatchError::Build`].
    pub fn reflect(source: &str) -> Result<Self> {
        let mut log = BuildLog::with_limit(crate::config::DEFAULT_BUILD_LOG_LIMIT);
        Self::reflect_into(source, &mut log).map_err(|()| DispatchError::Build {
            log: log.as_str().to_string(),
        })
    }

    /// Front-end pass writing diagnostics into `log`.
    fn reflect_into(source: &str, log: &mut BuildLog) -> std::result::Result<Self, ()> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| {
            log.push(&e.emit_to_string(source));
        })?;
        let info = Validator::new(ValidationFlags::all(), Capabilities::default())
            .validate(&module)
            .map_err(|e| {
                log.push(&e.emit_to_string(source));
            })?;

        let mut entry_points = Vec::new();
        for (ep_index, ep) in module.entry_points.iter().enumerate() {
            if ep.stage != ShaderStage::Compute {
                continue;
            }
            let usage = info.get_entry_point(ep_index);
            let mut params = Vec::new();
            let mut unsupported = None;
            for (handle, var) in module.global_variables.iter() {
                if usage[handle].is_empty() {
                    continue;
                }
                let Some(binding) = &var.binding else {
                    continue;
                };
                if binding.group != 0 {
                    unsupported = Some(format!(
                        "binding {} uses group {}; only group 0 is supported",
                        binding.binding, binding.group
                    ));
                    continue;
                }
                let kind = match var.space {
                    AddressSpace::Storage { access } => ParamKind::Storage {
                        writable: access.contains(StorageAccess::STORE),
                    },
                    AddressSpace::Uniform => ParamKind::Uniform {
                        size: module.types[var.ty].inner.size(module.to_ctx()),
                    },
                    other => {
                        unsupported = Some(format!(
                            "binding {} lives in the {other:?} address space",
                            binding.binding
                        ));
                        continue;
                    }
                };
                params.push(KernelParam {
                    index: binding.binding,
                    name: var.name.clone(),
                    kind,
                    element: ElementType::reflect(&module, var.ty),
                });
            }
            params.sort_by_key(|p| p.index);
            entry_points.push(EntryPointInfo {
                name: ep.name.clone(),
                workgroup_size: ep.workgroup_size,
                params,
                unsupported,
            });
        }
        Ok(Self { entry_points })
    }

    /// Every compute entry point, in declaration order.
    pub fn entry_points(&self) -> &[EntryPointInfo] {
        &self.entry_points
    }

    /// Look up a compute entry point by name.
    pub fn entry_point(&self, name: &str) -> Result<&EntryPointInfo> {
        self.entry_points
            .iter()
            .find(|ep| ep.name == name)
            .ok_or_else(|| DispatchError::EntryPointNotFound {
                name: name.to_string(),
                available: self.entry_points.iter().map(|ep| ep.name.clone()).collect(),
            })
    }
}

/// A program built for a session's device.
#[derive(Debug)]
pub struct CompiledProgram {
    module: wgpu::ShaderModule,
    interface: ProgramInterface,
    log: BuildLog,
}

impl CompiledProgram {
    /// The device shader module.
    pub fn module(&self) -> &wgpu::ShaderModule {
        &self.module
    }

    /// Reflected entry points.
    pub fn interface(&self) -> &ProgramInterface {
        &self.interface
    }

    /// Diagnostics produced by the build, possibly empty.
    pub fn log(&self) -> &BuildLog {
        &self.log
    }
}

/// Compiles kernel source for a session's device.
pub struct ProgramBuilder {
    log_limit: usize,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BUILD_LOG_LIMIT)
    }
}

impl ProgramBuilder {
    /// A builder keeping at most `log_limit` bytes of diagnostics.
    /// Limits below [`MIN_BUILD_LOG_LIMIT`] are raised to it.
    pub fn new(log_limit: usize) -> Self {
        Self {
            log_limit: log_limit.max(MIN_BUILD_LOG_LIMIT),
        }
    }

    /// The effective log cap in bytes.
    pub fn log_limit(&self) -> usize {
        self.log_limit
    }

    /// Compile `source` for the device of `session`.
    ///
    /// Returns [`DispatchError::Build`] with a non-empty log when the
    /// source does not parse, does not validate or is rejected by the
    /// driver.  Builds are never retried.
    pub fn build(&self, session: &ComputeSession, source: &str) -> Result<CompiledProgram> {
        let gpu = session.gpu()?;
        let mut log = BuildLog::with_limit(self.log_limit);
        let failed = |log: &mut BuildLog, fallback: &str| {
            if log.is_empty() {
                log.push(fallback);
            }
            warn!("program build failed");
            DispatchError::Build {
                log: log.as_str().to_string(),
            }
        };

        let interface = match ProgramInterface::reflect_into(source, &mut log) {
            Ok(interface) => interface,
            Err(()) => return Err(failed(&mut log, "front end rejected the source")),
        };

        gpu.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = gpu.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("kernel_program"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let scope_error = pollster::block_on(gpu.pop_error_scope());
        let compilation = pollster::block_on(module.get_compilation_info());
        let mut driver_errors = 0usize;
        for message in &compilation.messages {
            let severity = match message.message_type {
                wgpu::CompilationMessageType::Error => {
                    driver_errors += 1;
                    "error"
                }
                wgpu::CompilationMessageType::Warning => "warning",
                wgpu::CompilationMessageType::Info => "info",
            };
            match &message.location {
                Some(loc) => log.push(&format!(
                    "{severity}: {}:{}: {}",
                    loc.line_number, loc.line_position, message.message
                )),
                None => log.push(&format!("{severity}: {}", message.message)),
            }
        }
        if let Some(e) = scope_error {
            log.push(&e.to_string());
            return Err(failed(&mut log, "device rejected the shader module"));
        }
        if driver_errors > 0 {
            return Err(failed(&mut log, "device reported compilation errors"));
        }

        if log.is_empty() {
            info!(
                "built program with {} compute entry point(s)",
                interface.entry_points().len()
            );
        } else {
            warn!("program built with diagnostics:\n{log}");
        }
        Ok(CompiledProgram {
            module,
            interface,
            log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_KERNELS: &str = r#"
@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<uniform> scale: f32;

@compute @workgroup_size(8, 8)
fn scale_copy(@builtin(global_invocation_id) id: vec3<u32>) {
    output[id.x] = input[id.x] * scale;
}

@compute @workgroup_size(64)
fn clear(@builtin(global_invocation_id) id: vec3<u32>) {
    output[id.x] = 0.0;
}
"#;

    #[test]
    fn reflects_parameters_per_entry_point() {
        let interface = ProgramInterface::reflect(TWO_KERNELS).unwrap();
        let names: Vec<_> = interface.entry_points().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["scale_copy", "clear"]);

        let scale_copy = interface.entry_point("scale_copy").unwrap();
        assert_eq!(scale_copy.workgroup_size, [8, 8, 1]);
        let kinds: Vec<_> = scale_copy.params.iter().map(|p| (p.index, p.kind)).collect();
        assert_eq!(
            kinds,
            [
                (0, ParamKind::Storage { writable: false }),
                (1, ParamKind::Storage { writable: true }),
                (2, ParamKind::Uniform { size: 4 }),
            ]
        );

        // Only the bindings `clear` actually touches count as its parameters.
        let clear = interface.entry_point("clear").unwrap();
        assert_eq!(clear.params.len(), 1);
        assert_eq!(clear.params[0].index, 1);
        assert_eq!(clear.params[0].name.as_deref(), Some("output"));
    }

    #[test]
    fn element_types_are_reflected() {
        let source = r#"
@group(0) @binding(0) var<storage, read_write> ints: array<i32>;
@group(0) @binding(1) var<storage, read> words: array<u32>;
@group(0) @binding(2) var<uniform> scale: f32;
@group(0) @binding(3) var<storage, read> pairs: array<vec2<f32>>;

@compute @workgroup_size(1)
fn main() {
    ints[0] = i32(words[0]) + i32(scale) + i32(pairs[0].x);
}
"#;
        let interface = ProgramInterface::reflect(source).unwrap();
        let elements: Vec<_> = interface.entry_point("main").unwrap().params.iter().map(|p| p.element).collect();
        assert_eq!(
            elements,
            [
                Some(ElementType::I32),
                Some(ElementType::U32),
                Some(ElementType::F32),
                None
            ]
        );
    }

    #[test]
    fn tiny_log_limits_are_raised() {
        let builder = ProgramBuilder::new(0);
        assert_eq!(builder.log_limit(), MIN_BUILD_LOG_LIMIT);
        assert_eq!(ProgramBuilder::default().log_limit(), 4096);

        // Any build failure message fits, so the log cannot come back empty.
        let mut log = BuildLog::with_limit(builder.log_limit());
        log.push("front end rejected the source");
        assert!(!log.is_empty());
    }

    #[test]
    fn missing_entry_point_lists_alternatives() {
        let interface = ProgramInterface::reflect(TWO_KERNELS).unwrap();
        match interface.entry_point("transpose").unwrap_err() {
            DispatchError::EntryPointNotFound { name, available } => {
                assert_eq!(name, "transpose");
                assert_eq!(available, ["scale_copy", "clear"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_produce_a_diagnostic_log() {
        let err = ProgramInterface::reflect("@compute @workgroup_size(1) fn broken( {").unwrap_err();
        let log = err.build_log().expect("build error");
        assert!(!log.is_empty());
    }

    #[test]
    fn validation_errors_produce_a_diagnostic_log() {
        let source = r#"
@compute @workgroup_size(1)
fn main() {
    let x: u32 = 1.5;
}
"#;
        let err = ProgramInterface::reflect(source).unwrap_err();
        assert!(!err.build_log().unwrap().is_empty());
    }

    #[test]
    fn other_groups_are_flagged_unsupported() {
        let source = r#"
@group(1) @binding(0) var<storage, read_write> data: array<u32>;
@compute @workgroup_size(1)
fn main() { data[0] = 1u; }
"#;
        let interface = ProgramInterface::reflect(source).unwrap();
        assert!(interface.entry_point("main").unwrap().unsupported.is_some());
    }

    #[test]
    fn build_log_is_bounded_on_char_boundaries() {
        let mut log = BuildLog::with_limit(10);
        log.push("warning: ok");
        assert!(log.is_truncated());
        assert_eq!(log.as_str(), "warning: o");

        let mut log = BuildLog::with_limit(5);
        log.push("ééé");
        assert_eq!(log.as_str(), "éé");
        log.push("more");
        assert_eq!(log.as_str(), "éé");

        let mut log = BuildLog::with_limit(64);
        log.push("first");
        log.push("second\n");
        assert_eq!(log.as_str(), "first\nsecond");
        assert!(!log.is_truncated());
    }
}

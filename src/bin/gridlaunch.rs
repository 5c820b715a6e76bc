//! Command-line front end: run a WGSL kernel over a matrix and save the
//! result.
//!
//! Without `--kernel` the built-in `matrix_index` kernel fills an integer
//! matrix with each cell's row-major index.  The build log is printed to
//! stdout whether or not the build succeeds.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use bytemuck::Pod;
use clap::{Parser, ValueEnum};

use gridlaunch::{
    load_kernel_source, AccessMode, DeviceKind, DispatchError, DispatchPipeline, DispatchPlan,
    ElementType, Extent2, HarnessConfig, MatrixShape, PlanArg, TileSpec,
};

const BUILTIN_KERNEL: &str = include_str!("../../kernels/matrix_index.wgsl");
const BUILTIN_ENTRY: &str = "matrix_index";

#[derive(Parser, Debug)]
#[command(author, version, about = "Dispatch a WGSL kernel over a 2-D grid and save the result")]
struct Cli {
    /// File the result matrix is written to.
    #[arg(value_name = "OUTPUT_FILE")]
    output: PathBuf,
    /// WGSL kernel source; defaults to the built-in matrix_index kernel.
    #[arg(long, value_name = "PATH")]
    kernel: Option<PathBuf>,
    /// Entry point to launch.
    #[arg(long, value_name = "NAME")]
    entry: Option<String>,
    /// Number of columns.
    #[arg(long, default_value_t = 16)]
    width: usize,
    /// Number of rows.
    #[arg(long, default_value_t = 16)]
    height: usize,
    /// Tile (work-group) extent such as 4x4.  Must match the kernel's
    /// @workgroup_size, which is also the default.
    #[arg(long, value_name = "WxH")]
    tile: Option<Extent2>,
    /// Preferred device kind (accelerator or general).
    #[arg(long, value_name = "KIND")]
    device: Option<DeviceKind>,
    /// Element type of the result matrix.
    #[arg(long, value_enum, default_value_t = Element::I32)]
    element: Element,
    /// Extra scalar argument as INDEX:TYPE:VALUE, e.g. 1:u32:16.  Repeatable.
    #[arg(long = "scalar", value_name = "INDEX:TYPE:VALUE")]
    scalars: Vec<String>,
    /// Also print the result matrix to stdout.
    #[arg(long)]
    print: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Element {
    F32,
    I32,
    U32,
}

impl From<Element> for ElementType {
    fn from(element: Element) -> Self {
        match element {
            Element::F32 => ElementType::F32,
            Element::I32 => ElementType::I32,
            Element::U32 => ElementType::U32,
        }
    }
}

/// Parse `INDEX:TYPE:VALUE` into a positional scalar argument.
fn parse_scalar<T>(spec: &str) -> Result<(u32, PlanArg<T>), DispatchError> {
    let bad = || DispatchError::Config(format!("expected INDEX:TYPE:VALUE, got '{spec}'"));
    let mut parts = spec.splitn(3, ':');
    let (Some(index), Some(ty), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(bad());
    };
    let index: u32 = index.parse().map_err(|_| bad())?;
    let arg = match ty {
        "u32" => PlanArg::scalar(value.parse::<u32>().map_err(|_| bad())?),
        "i32" => PlanArg::scalar(value.parse::<i32>().map_err(|_| bad())?),
        "f32" => PlanArg::scalar(value.parse::<f32>().map_err(|_| bad())?),
        _ => return Err(bad()),
    };
    Ok((index, arg))
}

fn run<T: Pod + std::fmt::Display>(cli: &Cli, config: HarnessConfig) -> Result<(), DispatchError> {
    let (source, entry) = match &cli.kernel {
        Some(path) => (
            load_kernel_source(path)?,
            cli.entry.clone().unwrap_or_else(|| "main".to_string()),
        ),
        None => (
            BUILTIN_KERNEL.to_string(),
            cli.entry.clone().unwrap_or_else(|| BUILTIN_ENTRY.to_string()),
        ),
    };
    let shape = MatrixShape::new(cli.height, cli.width);
    let tile = cli.tile.map(TileSpec::Fixed).unwrap_or(TileSpec::Workgroup);

    let mut plan = DispatchPlan::<T>::new(source, entry, shape)
        .tile(tile)
        .element(cli.element.into())
        .arg(0, PlanArg::Output(AccessMode::ReadWrite));
    if cli.kernel.is_none() && cli.scalars.is_empty() {
        let cols = u32::try_from(cli.width)
            .map_err(|_| DispatchError::Config(format!("width {} is too large", cli.width)))?;
        plan = plan.arg(1, PlanArg::scalar(cols));
    }
    for spec in &cli.scalars {
        let (index, arg) = parse_scalar(spec)?;
        plan = plan.arg(index, arg);
    }

    let mut pipeline = DispatchPipeline::new(config);
    let outcome = match pipeline.run(&plan) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(log) = e.build_log() {
                println!("Build log:\n{log}");
            } else if let Some(log) = pipeline.build_log() {
                println!("Build log:\n{log}");
            }
            return Err(e);
        }
    };
    println!("Build log:\n{}", outcome.build_log);
    println!("Ran on {} ({})", outcome.device, outcome.grid);

    let precision = (cli.element == Element::F32).then_some(0);
    if cli.print {
        println!("Result:");
        print!("{}", outcome.result.render(precision));
    }
    let save_failed = |e: std::io::Error| {
        DispatchError::Transfer(format!("saving result to {:?} failed: {e}", cli.output))
    };
    let file = File::create(&cli.output).map_err(save_failed)?;
    outcome
        .result
        .write_to(BufWriter::new(file), precision)
        .map_err(save_failed)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match HarnessConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let config = match cli.device {
        Some(kind) => config.with_preferred_kind(kind),
        None => config,
    };

    let result = match cli.element {
        Element::F32 => run::<f32>(&cli, config),
        Element::I32 => run::<i32>(&cli, config),
        Element::U32 => run::<u32>(&cli, config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

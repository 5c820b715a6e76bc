//! Fill an integer matrix with each cell's row-major index and save it.
//!
//! Usage: `cargo run --example matrix_index -- <output_file>`
//!
//! The whole run goes through `DispatchPipeline`, so this is the shortest
//! way to drive the harness end to end.

use std::fs::File;
use std::io::BufWriter;
use std::process::ExitCode;

use gridlaunch::{
    AccessMode, DispatchError, DispatchPipeline, DispatchPlan, ElementType, HarnessConfig,
    MatrixShape, PlanArg,
};

const SHADER: &str = include_str!("../kernels/matrix_index.wgsl");
const ROWS: usize = 16;
const COLS: usize = 16;

fn run(output: &str) -> Result<(), DispatchError> {
    let config = HarnessConfig::from_env()?;
    let plan = DispatchPlan::<i32>::new(SHADER, "matrix_index", MatrixShape::new(ROWS, COLS))
        .element(ElementType::I32)
        .arg(0, PlanArg::Output(AccessMode::ReadWrite))
        .arg(1, PlanArg::scalar(COLS as u32));

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
    println!("Ran on {}", outcome.device);

    let save_failed = |e: std::io::Error| DispatchError::Transfer(format!("saving {output}: {e}"));
    let file = File::create(output).map_err(save_failed)?;
    outcome
        .result
        .write_to(BufWriter::new(file), None)
        .map_err(save_failed)?;
    println!("Wrote {} to {output}", outcome.result.shape());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        let program = args.first().map(String::as_str).unwrap_or("matrix_index");
        eprintln!("usage: {program} <output_file>");
        return ExitCode::FAILURE;
    }
    match run(&args[1]) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

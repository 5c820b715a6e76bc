//! Fill a 16x16 float image on the device and print it.
//!
//! This demo walks through the stages one by one instead of using
//! `DispatchPipeline`: discover a device, open a session, build the
//! program, allocate the image buffer, bind it, dispatch 4x4 tiles and
//! read the image back.  Every `?` below still releases what was
//! acquired, because the session closes itself when dropped.

use gridlaunch::{
    compute_grid, discover_device, enqueue, read_back, resolve_entry_point, AccessMode,
    ComputeSession, DeviceBuffer, DispatchError, HarnessConfig, HostMatrix, KernelArg, MatrixShape,
    ProgramBuilder, TileSpec,
};

const SHADER: &str = include_str!("../kernels/fill_constant.wgsl");

fn main() -> Result<(), DispatchError> {
    env_logger::init();
    let config = HarnessConfig::from_env()?;
    let shape = MatrixShape::new(16, 16);

    let device = discover_device(&config)?;
    let mut session = ComputeSession::open(device, &config)?;

    let program = ProgramBuilder::new(config.build_log_limit).build(&session, SHADER);
    let program = match program {
        Ok(program) => {
            println!("Build log:\n{}", program.log());
            program
        }
        Err(e) => {
            println!("Build log:\n{}", e.build_log().unwrap_or_default());
            return Err(e);
        }
    };

    let image = DeviceBuffer::allocate_for::<f32>(&session, shape, AccessMode::ReadWrite)?;
    let grid = compute_grid(shape.extent()?, TileSpec::Divide(4))?;
    let mut host = HostMatrix::<f32>::zeroed(shape);
    {
        let mut kernel = resolve_entry_point(&program, "fill_constant")?;
        kernel.bind_argument(0, KernelArg::buffer(&image))?;
        let pending = enqueue(&session, &kernel, &grid)?;
        pending.wait(&session)?;
    }
    read_back(&session, &image, host.as_mut_slice())?;

    println!("Result:");
    print!("{}", host.render(Some(0)));

    image.release(&session)?;
    session.close();
    Ok(())
}

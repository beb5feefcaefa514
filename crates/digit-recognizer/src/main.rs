#![recursion_limit = "256"]

use std::process::ExitCode;

use clap::Parser;
use digit_recognizer::{
    cli::{self, Cli},
    logging, Error,
};

#[cfg(not(any(feature = "ndarray", feature = "tch-cpu", feature = "wgpu")))]
compile_error!("enable one of the `ndarray`, `tch-cpu` or `wgpu` features");

#[cfg(feature = "wgpu")]
mod wgpu {
    use burn::backend::{
        wgpu::{Wgpu, WgpuDevice},
        Autodiff,
    };

    use super::{cli, Cli, Error};

    pub fn run(args: Cli) -> Result<(), Error> {
        cli::execute::<Autodiff<Wgpu<f32, i32>>>(args, WgpuDevice::default())
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };

    use super::{cli, Cli, Error};

    pub fn run(args: Cli) -> Result<(), Error> {
        cli::execute::<Autodiff<LibTorch<f32>>>(args, LibTorchDevice::Cpu)
    }
}

#[cfg(feature = "ndarray")]
mod ndarray {
    use burn::backend::{
        ndarray::{NdArray, NdArrayDevice},
        Autodiff,
    };

    use super::{cli, Cli, Error};

    pub fn run(args: Cli) -> Result<(), Error> {
        cli::execute::<Autodiff<NdArray<f32>>>(args, NdArrayDevice::Cpu)
    }
}

#[allow(unreachable_code)]
fn run(args: Cli) -> Result<(), Error> {
    #[cfg(feature = "wgpu")]
    return wgpu::run(args);

    #[cfg(feature = "tch-cpu")]
    return tch_cpu::run(args);

    #[cfg(feature = "ndarray")]
    return ndarray::run(args);

    unreachable!("At least one backend will be selected.")
}

fn main() -> ExitCode {
    let args = Cli::parse();
    logging::install(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

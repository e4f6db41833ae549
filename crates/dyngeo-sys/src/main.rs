// Entry point: parse the command line, pick a device and run the frame loop.

use std::process::ExitCode;

use dyngeo_renderer::raytracing::RecordingDevice;
use dyngeo_renderer::vulkan::VulkanDevice;
use dyngeo_sys::{run, CommandLine};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cmdline = match CommandLine::parse(std::env::args().skip(1)) {
        Ok(cmdline) => cmdline,
        Err(e) => {
            log::error!("{e}");
            eprintln!("usage: dyngeo [--frames N] [--null] [--validation] [+set name value] [+at frame name value]");
            return ExitCode::FAILURE;
        }
    };

    let result = if cmdline.null_device {
        log::info!("Running {} frames on the recording device", cmdline.frames);
        let mut device = RecordingDevice::new();
        run(&mut device, &cmdline)
    } else {
        match VulkanDevice::new(cmdline.validation) {
            Ok(mut device) => {
                log::info!("Running {} frames on Vulkan", cmdline.frames);
                run(&mut device, &cmdline)
            }
            Err(e) => {
                log::error!("Vulkan initialization failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// Sets up terminal logging unless a global subscriber is already configured.
///
/// Returns `false` when another subscriber was installed first.
pub fn install(verbose: bool) -> bool {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .with_filter(level)
        .with_filter(filter_fn(|m| {
            if let Some(path) = m.module_path() {
                // The wgpu crate is logging too much, so we skip `info` level.
                if path.starts_with("wgpu") && *m.level() >= Level::INFO {
                    return false;
                }
            }
            true
        }));

    if registry().with(layer).try_init().is_err() {
        return false;
    }

    update_panic_hook();
    true
}

fn update_panic_hook() {
    let hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        hook(info);
    }));
}

use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, registry};

/// If a global tracing subscriber is not already configured, set up logging to stderr,
/// and add our custom panic hook.
///
/// Stdout only carries results, so every diagnostic goes to stderr.
pub(crate) fn install_stderr_logger(silent: bool) {
    let level = match silent {
        true => LevelFilter::WARN,
        false => LevelFilter::INFO,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level)
        .with_filter(filter_fn(|m| {
            if let Some(path) = m.module_path() {
                // Backend crates are logging too much, so we skip `info` level.
                if (path.starts_with("wgpu") || path.starts_with("cubecl"))
                    && *m.level() >= Level::INFO
                {
                    return false;
                }
            }
            true
        }));

    if registry().with(layer).try_init().is_ok() {
        update_panic_hook();
    }
}

fn update_panic_hook() {
    let hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        hook(info);
    }));
}

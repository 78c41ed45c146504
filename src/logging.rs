//! Process-wide logging setup.

use log::LevelFilter;

/// Configures the global `log` dispatch. Call once at process start.
///
/// Logs go to stdout; there is no GUI to notify on failure and no
/// separate log file, so an error here is simply reported to stderr.
pub fn setup_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let init_log_result = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();

    if let Err(e) = init_log_result {
        eprintln!("failed to initialize logging: {e}");
    }

    log::info!("yubi-oath-vpn starting (version {})", env!("CARGO_PKG_VERSION"));
}

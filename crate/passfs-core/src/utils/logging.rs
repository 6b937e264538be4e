use env_logger::Builder;
use std::io::Write;

/// Initialize logging for a binary.
///
/// Everything logs at WARN and above, except for the modules in
/// `info_modules`, which also log at INFO. The env variable RUST_LOG
/// takes precedence over both.
///
/// Set RUST_LOG_FORMAT=SYSTEMD when running under systemd, so
/// journald can pick up log levels.
pub fn init_with_info_modules(info_modules: Vec<&str>) {
    let mut builder = Builder::new();
    if std::env::var("RUST_LOG_FORMAT").is_ok_and(|f| f == "SYSTEMD") {
        systemd_format(&mut builder);
    }

    builder.filter_level(log::LevelFilter::Warn);
    for module in info_modules {
        builder.filter_module(module, log::LevelFilter::Info);
    }
    builder.parse_default_env();
    builder.init();
}

/// Output `<priority>target: message` lines.
///
/// Priorities follow syslog (RFC 5424). No timestamp, journald
/// records its own.
fn systemd_format(builder: &mut Builder) {
    builder.format(|fmt, record| {
        let priority = match record.level() {
            log::Level::Error => 3,
            log::Level::Warn => 4,
            log::Level::Info => 5,
            log::Level::Debug | log::Level::Trace => 7,
        };
        writeln!(fmt, "<{priority}>{}: {}", record.target(), record.args())
    });
}

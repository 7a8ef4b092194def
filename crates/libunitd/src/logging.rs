use crate::config::{LogConfig, LogTarget};

pub fn setup_logging(conf: &LogConfig) -> Result<(), String> {
    let color = conf.color;
    let location = conf.location;

    let mut logger = fern::Dispatch::new()
        .format(move |out, message, record| {
            let level = record.level();
            let level_str = if color {
                match level {
                    log::Level::Error => format!("\x1b[31m{level}\x1b[0m"),
                    log::Level::Warn => format!("\x1b[33m{level}\x1b[0m"),
                    log::Level::Info => format!("\x1b[32m{level}\x1b[0m"),
                    log::Level::Debug => format!("\x1b[34m{level}\x1b[0m"),
                    log::Level::Trace => format!("\x1b[36m{level}\x1b[0m"),
                }
            } else {
                level.to_string()
            };
            if location {
                out.finish(format_args!(
                    "{}[{}][{}] ({}:{}) {}",
                    chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                    record.target(),
                    level_str,
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    message
                ));
            } else {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                    record.target(),
                    level_str,
                    message
                ));
            }
        })
        .level(conf.level);

    logger = match conf.target {
        LogTarget::Console => logger.chain(std::io::stdout()),
        LogTarget::Kmsg => {
            // /dev/kmsg expects one write per record; falling back to the
            // console when it cannot be opened keeps early boot visible.
            match fern::log_file("/dev/kmsg") {
                Ok(file) => logger.chain(file),
                Err(_) => logger.chain(std::io::stdout()),
            }
        }
        LogTarget::Null => logger,
    };

    logger
        .apply()
        .map_err(|e| format!("Error while setting up logger: {e}"))
}

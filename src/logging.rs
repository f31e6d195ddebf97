use std::path::PathBuf;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;

fn init_logging_smart(
    log_fp: Option<&PathBuf>,
    quiet_stdout: bool,
) -> Option<Handle> {
    let level = LevelFilter::Info;
    let console_appender = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l})} {m}{n}")))
        .build();
    let mut config_builder = Config::builder();
    let mut root_builder = Root::builder();
    if !quiet_stdout {
        config_builder = config_builder.appender(
            Appender::builder().build("stderr", Box::new(console_appender)),
        );
        root_builder = root_builder.appender("stderr");
    }
    if let Some(fp) = log_fp {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "[{f}::{L}][{d(%Y-%m-%d %H:%M:%S)}][{l}] {m}{n}",
            )))
            .append(false)
            .build(fp);
        match logfile {
            Ok(appender) => {
                config_builder = config_builder.appender(
                    Appender::builder().build("logfile", Box::new(appender)),
                );
                root_builder = root_builder.appender("logfile");
            }
            Err(e) => {
                eprintln!(
                    "failed to make log file at {fp:?}, {}",
                    e.to_string()
                );
                return None;
            }
        }
    }

    let config = config_builder.build(root_builder.build(level));
    match config {
        Ok(config) => match log4rs::init_config(config) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("failed to initialize logging, {}", e.to_string());
                None
            }
        },
        Err(e) => {
            eprintln!("failed to configure logging, {}", e.to_string());
            None
        }
    }
}

pub fn init_logging(log_fp: Option<&PathBuf>) -> Option<Handle> {
    init_logging_smart(log_fp, false)
}

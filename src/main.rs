use std::process;
use std::thread;
use std::time::Duration;

use async_messaged::broker::Broker;
use async_messaged::config::AppConfig;
use async_messaged::integration::driver::{BackendDrivers, BackendEngine};
use async_messaged::logging::{LogLevel, Logger, LoggerConfig};
use async_messaged::shutdown::ShutdownHooks;
use async_messaged::utils::runtime::ensure_posix_or_exit;
use async_messaged::utils::startup_banner::print_startup_banner;
use serde_json::json;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger = Logger::new(LoggerConfig {
        min_level: app_config.log_level(),
        human_friendly: app_config.logging.human_friendly,
    });

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info("main::shutdown", "Shutdown hooks installed for SIGINT/SIGTERM");

    let engine = BackendEngine::parse(&app_config.backend.engine).unwrap_or_else(|| {
        eprintln!("configuration error: unknown backend.engine '{}'", app_config.backend.engine);
        process::exit(2);
    });
    let drivers = BackendDrivers::for_engine(engine);

    let broker = Broker::bind(&app_config, &drivers, logger.clone(), shutdown_hooks.signal())
        .unwrap_or_else(|error| {
            eprintln!("broker startup error: {error}");
            process::exit(2);
        });
    logger.log(
        LogLevel::Info,
        "main::broker",
        &format!(
            "{} v{} accepting client requests",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": broker.local_addr().to_string(),
            "backend_engine": engine.as_str(),
            "poll_interval_ms": app_config.broker.poll_interval_ms,
            "drain_timeout_ms": app_config.broker.drain_timeout_ms,
            "max_frame_size_bytes": app_config.wire.max_frame_size_bytes
        })),
    );

    let handle = broker.start().unwrap_or_else(|error| {
        eprintln!("broker startup error: {error}");
        process::exit(2);
    });

    while !shutdown_hooks.is_triggered() && !handle.is_finished() {
        thread::sleep(Duration::from_millis(100));
    }
    logger.info(
        "main::shutdown",
        "Shutdown signal received, waiting for broker to drain",
    );

    if let Err(error) = handle.join() {
        logger.error("main::shutdown", &format!("broker stopped with error: {error}"));
        process::exit(1);
    }
    logger.info("main::shutdown", "Broker stopped and shutdown completed");
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

//! The RustyCast daemon: brings configured links under management and
//! runs the session control plane until a termination signal arrives.

use std::process;
use std::sync::Arc;
use std::time::Instant;

use rustycast::config::Config;
use rustycast::core::Manager;
use rustycast::core::manager::ifindex_of;
use rustycast::log::LogSink;
use rustycast::log::logger::Logger;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config_result = if args.len() > 1 {
        let path = &args[1];
        println!("Trying to load config: {path}");
        Config::load(path)
    } else {
        Config::load_first(&["rustycast.conf", "/etc/rustycast.conf"])
    };

    let config = config_result.unwrap_or_else(|e| {
        eprintln!("Error loading config: {e}. Using empty config.");
        Config::empty()
    });
    let config = Arc::new(config);

    // --- Process logger ----------------------------------------------
    let logger = match config.get_non_empty("Log", "dir") {
        Some(dir) => Logger::start_in_dir(dir, "rustycastd", 1024, true),
        None => Logger::start_default("rustycastd", 1024),
    };
    let log: Arc<dyn LogSink> = Arc::new(logger.handle());
    eprintln!("[rustycastd] logging to {}", logger.file_path().display());

    // --- Manager -----------------------------------------------------
    Manager::install_signal_handlers();
    let mut manager = Manager::new(config.clone(), log);
    let now = Instant::now();

    let Some(ifname) = config.get_non_empty("Wifi", "interface") else {
        eprintln!("You need to set the interface parameter in the config file");
        process::exit(1);
    };
    let ifindex = config
        .get("Wifi", "ifindex")
        .and_then(|s| s.parse().ok())
        .or_else(|| ifindex_of(ifname));
    let Some(ifindex) = ifindex else {
        eprintln!("Cannot resolve ifindex of {ifname}");
        process::exit(1);
    };

    if let Err(e) = manager.add_link(ifindex, ifname, now) {
        eprintln!("Cannot manage {ifname}: {e}");
        process::exit(1);
    }

    process::exit(manager.run());
}

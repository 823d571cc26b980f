mod settings;

use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{error, LevelFilter};

fn main() {
    let mut clog = colog::default_builder();

    #[cfg(debug_assertions)]
    clog.filter_level(LevelFilter::Debug);

    #[cfg(not(debug_assertions))]
    clog.filter_level(LevelFilter::Warn);

    clog.init();

    // 1st command line arg is the name of the environment
    let args: Vec<String> = env::args().collect();
    let environment = args.get(1).map_or("dev", |s| s.as_str());

    let settings = match settings::load(environment) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Perftest: Invalid configuration: {e}");
            return;
        }
    };

    // Handle SIGTERM by setting the stop_signal boolean
    let stop_signal = Arc::new(AtomicBool::new(false));
    let handler_signal = stop_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_signal.store(true, Ordering::Relaxed)) {
        error!("Perftest: Unable to install the Ctrl-C handler: {e}");
        return;
    }

    if let Err(e) = loopback_test::run_test(&settings, &stop_signal) {
        error!("Perftest: {e}");
    }
}

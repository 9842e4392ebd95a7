use clap::Parser;
use log::error;

use domain_recon::{init_logger, run_scan, Config};

#[tokio::main]
async fn main() {
    let mut config = Config::parse();

    if let Err(err) = config.validate() {
        eprintln!("{err}");
        std::process::exit(2);
    }

    if let Err(err) = init_logger(
        config.effective_log_level(),
        config.log_file.as_deref(),
        config.silent,
    ) {
        eprintln!("{err}");
        std::process::exit(2);
    }

    match run_scan(config).await {
        Ok(_) => {}
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}

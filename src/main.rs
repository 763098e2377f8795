mod cli;
mod clock;
mod dns;
mod icmp;
mod pinger;
mod stats;
mod utils;

use pinger::{Pinger, PingerState};

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    // Parse command line arguments
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            utils::exit_with_error(&format!("invalid arguments: {}", e), 2);
        }
    };

    // Resolve target hostname
    let target_ip = match dns::resolve_hostname(&args.target).await {
        Ok(ip) => ip,
        Err(e) => {
            utils::exit_with_error(&format!("failed to resolve host {}: {}", args.target, e), 2);
        }
    };

    let mut pinger = match Pinger::new(args.options()) {
        Ok(pinger) => pinger,
        Err(e) => {
            utils::exit_with_error(&e.to_string(), 2);
        }
    };
    let Some(mut report) = pinger.report() else {
        utils::exit_with_error("ping report already taken", 1);
    };

    log::debug!("using ICMP identifier {}", pinger.identifier());
    println!("{}", stats::format_header(target_ip, pinger.options().packet_size));

    // Ctrl+C or SIGTERM ends the run after the current attempt
    utils::setup_signal_handler(pinger.stop_handle());

    let task = tokio::spawn(async move {
        let state = pinger.ping(target_ip).await;
        (pinger, state)
    });

    while let Some(outcome) = report.outcomes.recv().await {
        println!("{}", stats::format_outcome(&outcome, target_ip));
    }

    if let Ok(e) = report.error.try_recv() {
        utils::exit_with_error(&format!("failed to ping {}: {}", args.target, e), 2);
    }

    let pinger = match task.await {
        Ok((pinger, Ok(PingerState::Stopped))) => pinger,
        Ok((_, state)) => {
            utils::exit_with_error(&format!("ping run ended unexpectedly: {:?}", state), 2);
        }
        Err(e) => {
            utils::exit_with_error(&format!("ping task failed: {}", e), 2);
        }
    };

    println!("{}", pinger.stats().format_summary(&args.target));
}

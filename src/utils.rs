use rand::Rng;
use crate::pinger::StopHandle;
use std::future::{self, Future};
use std::io;
use std::process;
use std::time::Duration;

/// Pick a random identifier for ICMP packets from the given source
pub fn generate_identifier<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    rng.r#gen()
}

/// Duration as fractional milliseconds
pub fn duration_millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("rping: {}", message);
    process::exit(code);
}

/// Resolves on the first Ctrl+C, or SIGTERM on unix. The SIGTERM listener is
/// registered before this returns.
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()> + Send> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Failed to listen for Ctrl+C: {}", e);
                future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        tokio::select! {
            _ = interrupt => log::info!("Interrupted, stopping"),
            _ = terminate.recv() => log::info!("Terminated, stopping"),
        }

        #[cfg(not(unix))]
        interrupt.await;
    })
}

/// Turn the first Ctrl+C or SIGTERM into a stop request
pub fn setup_signal_handler(stop: StopHandle) {
    let signal = match shutdown_signal() {
        Ok(signal) => signal,
        Err(e) => {
            log::warn!("Failed to install signal handlers: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        signal.await;
        stop.stop();
    });
}

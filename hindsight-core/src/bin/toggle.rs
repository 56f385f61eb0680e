//! `--toggle` delivery entry point.
//!
//! Host environments that sandbox global key events cannot reach a
//! running instance directly, so the hotkey binding launches this
//! program instead: it finds the instance via the PID file in the
//! runtime directory and delivers the platform toggle signal.

use hindsight_core::ipc::trigger;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--toggle") | None => {}
        Some("--help") | Some("-h") => {
            println!("Usage: toggle [--toggle]\n\nDeliver a record/stop toggle to the running hindsight instance.");
            return;
        }
        Some(other) => {
            eprintln!("unknown argument: {other}");
            std::process::exit(2);
        }
    }

    match trigger::send_toggle() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("toggle failed: {e}");
            std::process::exit(1);
        }
    }
}

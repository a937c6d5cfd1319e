mod printer;
mod shutdown;
mod verify_cli;

use std::sync::Arc;

use clap::Parser;

use nonceforge_engine::start_verify;

use crate::printer::Printer;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};
use crate::verify_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let printer = Printer::new("batch-verifier", cli.verbose);

    let mut handle = match start_verify(cli.verify_config()) {
        Ok(handle) => handle,
        Err(err) => anyhow::bail!("{err}"),
    };

    let controller = Arc::new(ShutdownController::default());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    spawn_ctrl_c_handler(controller, shutdown_tx);

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => printer.event(&event),
                None => break,
            },
            shutdown = shutdown_rx.recv() => match shutdown {
                Some(ShutdownEvent::Graceful) => {
                    eprintln!(
                        "Stop requested; cancelling in-flight work (press CTRL+C again to exit immediately)."
                    );
                    handle.request_stop();
                }
                Some(ShutdownEvent::Immediate) => {
                    eprintln!("Stop requested again; exiting immediately.");
                    std::process::exit(130);
                }
                None => {}
            },
        }
    }

    let report = handle.wait().await?;
    if report.success != cli.num_nonces {
        std::process::exit(1);
    }
    Ok(())
}

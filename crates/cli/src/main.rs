mod cli;
mod printer;
mod shutdown;

use std::sync::Arc;

use clap::Parser;

use nonceforge_engine::{start_batch, Mode};

use crate::cli::Cli;
use crate::printer::Printer;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode: Mode = cli.mode.into();
    let printer = Printer::new("batch-runner", cli.verbose);

    let mut handle = match start_batch(cli.batch_config()) {
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
    let ok = match mode {
        Mode::Strict | Mode::Lenient => report.success == cli.num_nonces,
        Mode::Explore => report.success > 0,
    };
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

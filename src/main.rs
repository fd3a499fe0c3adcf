use anyhow::Result;
use log::{error, info};
use redact_stream::backend::ReplayFactory;
use redact_stream::config::{self, RunConfig};
use redact_stream::error::PipelineError;
use redact_stream::pipeline;
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut command = config::command();
    let matches = command.clone().get_matches();

    let config = match RunConfig::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}\n", e);
            let _ = command.print_help();
            process::exit(1);
        }
    };

    let pipeline = pipeline::build(&config, &ReplayFactory)?;

    // first SIGINT ends the stream gracefully, the files get finalized
    let eos = pipeline.eos_handle();
    ctrlc::set_handler(move || {
        info!("Interrupted, ending stream");
        eos.cancel();
    })?;

    let report = match pipeline.run().await {
        Ok(report) => report,
        Err(e) => fail(&e),
    };

    info!("{}", report.summary);
    if let Err(e) = report.into_result() {
        fail(&e);
    }
    Ok(())
}

/// Report a pipeline failure on stderr and exit
fn fail(e: &PipelineError) -> ! {
    error!("{}", e);
    eprintln!("{}", e.diagnostic());
    process::exit(1);
}

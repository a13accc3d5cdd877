use std::process::ExitCode;

use bfs::BfsHooks;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
        )
        .init();

    let result = bfs::descriptor()
        .and_then(|desc| offload::launch(desc, &mut BfsHooks::default(), bfs::host_kernels()));
    match result {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Execution failed: {e}");
            ExitCode::FAILURE
        }
    }
}

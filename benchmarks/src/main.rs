mod harness;

use bfs::BfsHooks;
use hotspot::HotspotHooks;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vecadd::VecAddHooks;

fn print_usage() {
    eprintln!("Usage: benchmarks [OPTIONS]");
    eprintln!();
    eprintln!("  --bench <name>     Benchmark to run: vecadd, hotspot, bfs, all (default: all)");
    eprintln!("  --rounds <n>       Rounds per measurement (default: 10)");
    eprintln!("  --help             Show this help");
    eprintln!();
    eprintln!("The backend is chosen by {} (host, wgpu, opencl).", offload::BACKEND_ENV);
}

fn main() {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("info")),
                ),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut bench = "all".to_string();
    let mut rounds: usize = 10;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bench" => {
                i += 1;
                if i < args.len() { bench = args[i].clone(); }
            }
            "--rounds" => {
                i += 1;
                if i < args.len() { rounds = args[i].parse().unwrap_or(5); }
            }
            "--help" | "-h" => {
                print_usage();
                return;
            }
            other => {
                eprintln!("Unknown flag: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let run_vecadd = bench == "all" || bench == "vecadd";
    let run_hotspot = bench == "all" || bench == "hotspot";
    let run_bfs = bench == "all" || bench == "bfs";
    if !(run_vecadd || run_hotspot || run_bfs) {
        eprintln!("Unknown benchmark: {}", bench);
        print_usage();
        std::process::exit(1);
    }

    let mut results = Vec::new();

    if run_vecadd {
        results.push(harness::measure("vecadd", rounds, || {
            offload::launch(vecadd::descriptor()?, &mut VecAddHooks::default(), vecadd::host_kernels())
        }));
    }

    if run_hotspot {
        results.push(harness::measure("hotspot", rounds, || {
            offload::launch(hotspot::descriptor()?, &mut HotspotHooks::default(), hotspot::host_kernels())
        }));
    }

    if run_bfs {
        results.push(harness::measure("bfs", rounds, || {
            offload::launch(bfs::descriptor()?, &mut BfsHooks::default(), bfs::host_kernels())
        }));
    }

    harness::print_table(&results);
}

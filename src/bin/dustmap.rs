use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use dustmap::{BandPaths, DustMapper, FitConfig, FitStatus};

fn print_usage(program: &str) {
    eprintln!("Modified-blackbody SED fitting of four-band dust maps");
    eprintln!();
    eprintln!(
        "Usage: {} <70um.fits> <160um.fits> <250um.fits> <350um.fits> <output-stem> [OPTIONS]",
        program
    );
    eprintln!();
    eprintln!("Writes <output-stem>.fits (planes: T_dust, tau_160, beta) and");
    eprintln!("<output-stem>_status.fits (per-pixel fit status).");
    eprintln!("Coordinate keywords are copied from the 350um image.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <FILE>        Load options from a JSON file (flags below override)");
    eprintln!("  --no-fit               Skip fitting; write an empty cube");
    eprintln!("  --sed-plots <DIR>      Write per-pixel SED tables into DIR");
    eprintln!("  --no-plot              Do not render the summary T / tau maps");
    eprintln!("  --accept-unconverged   Keep solver output for unconverged pixels (default: NaN)");
    eprintln!("  --max-iter <N>         Solver iteration cap per pixel (default: 200)");
    eprintln!("  --threads <N>          Worker threads (default: all cores)");
    eprintln!("  --log                  Show per-pixel detail (RUST_LOG overrides)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!(
        "  {} ngc7538_70mu.fits ngc7538_160mu.fits ngc7538_250mu.fits ngc7538_350mu.fits NGC7538_beta_2p0",
        program
    );
    eprintln!("  {} a.fits b.fits c.fits d.fits out --sed-plots SED_plots --threads 4", program);
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage(&args[0]);
        return Ok(());
    }

    if args.len() < 6 {
        print_usage(&args[0]);
        return Err(anyhow::anyhow!("Missing required arguments"));
    }

    let inputs = BandPaths::new(&args[1], &args[2], &args[3], &args[4]);
    let output_stem = &args[5];

    // Parse optional arguments
    let mut config_path: Option<String> = None;
    let mut no_fit = false;
    let mut sed_dir: Option<String> = None;
    let mut no_plot = false;
    let mut accept_unconverged = false;
    let mut max_iter: Option<usize> = None;
    let mut threads: Option<usize> = None;
    let mut log_enabled = false;

    let mut i = 6;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 >= args.len() {
                    return Err(anyhow::anyhow!("--config requires a value"));
                }
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            "--no-fit" => {
                no_fit = true;
                i += 1;
            }
            "--sed-plots" => {
                if i + 1 >= args.len() {
                    return Err(anyhow::anyhow!("--sed-plots requires a directory"));
                }
                sed_dir = Some(args[i + 1].clone());
                i += 2;
            }
            "--no-plot" => {
                no_plot = true;
                i += 1;
            }
            "--accept-unconverged" => {
                accept_unconverged = true;
                i += 1;
            }
            "--max-iter" => {
                if i + 1 >= args.len() {
                    return Err(anyhow::anyhow!("--max-iter requires a value"));
                }
                let n = args[i + 1]
                    .parse::<usize>()
                    .context("Invalid max-iter value")?;
                if n == 0 {
                    return Err(anyhow::anyhow!("--max-iter must be >= 1"));
                }
                max_iter = Some(n);
                i += 2;
            }
            "--threads" => {
                if i + 1 >= args.len() {
                    return Err(anyhow::anyhow!("--threads requires a value"));
                }
                let n = args[i + 1]
                    .parse::<usize>()
                    .context("Invalid thread count")?;
                if n == 0 {
                    return Err(anyhow::anyhow!("--threads must be >= 1"));
                }
                threads = Some(n);
                i += 2;
            }
            "--log" => {
                log_enabled = true;
                i += 1;
            }
            _ => {
                return Err(anyhow::anyhow!("Unknown option: {}", args[i]));
            }
        }
    }

    let default_filter = if log_enabled { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = match &config_path {
        Some(p) => FitConfig::from_json_file(Path::new(p))?,
        None => FitConfig::default(),
    };

    let mut mapper = DustMapper::new().with_config(config);
    if no_fit {
        mapper = mapper.with_fitting(false);
    }
    if let Some(dir) = &sed_dir {
        mapper = mapper.with_sed_plotting(dir);
    }
    if no_plot {
        mapper = mapper.with_plotting(false);
    }
    if accept_unconverged {
        mapper = mapper.accept_unconverged();
    }
    if let Some(n) = max_iter {
        mapper = mapper.with_max_iterations(n);
    }
    if let Some(n) = threads {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .context("Failed to build thread pool")?;
        mapper = mapper.with_thread_pool(Arc::new(pool));
    }

    let report = mapper
        .run(&inputs, output_stem)
        .context("SED fitting failed")?;

    println!("Output: {}", report.cube_path.display());
    for p in &report.map_paths {
        println!("Map:    {}", p.display());
    }
    let failed = report.summary.failed();
    if failed > 0 {
        println!(
            "{} pixels without a usable fit ({} not converged, {} invalid flux, {} domain)",
            failed,
            report.summary.count(FitStatus::NotConverged),
            report.summary.count(FitStatus::InvalidFlux),
            report.summary.count(FitStatus::ModelDomain)
        );
    }

    Ok(())
}

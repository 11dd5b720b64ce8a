use std::process::ExitCode;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use serde::Serialize;

use flightmap_tiles::cli::{Cli, Command, ReportFormat};
use flightmap_tiles::coord::Bounds;
use flightmap_tiles::mbtiles::{Mbtiles, OptimizeOptions, optimize_container};
use flightmap_tiles::output::{
    optimize_text_lines, prune_text_lines, pyramid_text_lines, shrink_text_lines,
    verify_text_lines,
};
use flightmap_tiles::policy::{LayerPolicy, read_policy};
use flightmap_tiles::prune::{PruneOptions, prune_to_country};
use flightmap_tiles::pyramid::{PyramidOptions, generate_pyramid};
use flightmap_tiles::verify::verify_container;
use flightmap_tiles::zoom::truncate_zoom_levels;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    match command {
        Command::Optimize(args) => {
            let policy = match args.policy.as_deref() {
                Some(path) => read_policy(path)?,
                None => LayerPolicy::default(),
            };
            let options = OptimizeOptions {
                threads: args.threads.unwrap_or(0),
                io_batch: args.io_batch,
                fail_fast: args.fail_fast,
                drop_empty_tiles: args.drop_empty_tiles,
                no_progress: args.no_progress,
            };
            let stats = optimize_container(&args.input, &policy, &options)?;
            print_report(args.output, &stats, optimize_text_lines(&stats))?;
            if stats.has_fatal_errors() {
                eprintln!(
                    "error: {} tile(s) contain layers the policy does not cover",
                    stats.unknown_layer_tiles
                );
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Pyramid(args) => {
            let options = PyramidOptions {
                start_zoom: args.start_zoom,
                target_zoom: args.target_zoom,
                tile_size: args.tile_size,
                threads: args.threads.unwrap_or(0),
                no_progress: args.no_progress,
            };
            let stats = generate_pyramid(&args.input, &options)?;
            print_lines(pyramid_text_lines(&stats));
        }
        Command::Prune(args) => {
            let mut options = PruneOptions::new(args.boundary, args.country);
            options.country_property = args.country_property;
            options.bbox = match args.bbox.as_deref() {
                Some(value) => Some(value.parse::<Bounds>()?),
                None => None,
            };
            options.buffer_meters = args.buffer_meters;
            options.output = args.output;
            let stats = prune_to_country(&args.input, &options)?;
            print_lines(prune_text_lines(&stats));
        }
        Command::Shrink(args) => {
            let container = Mbtiles::open(&args.input)?;
            let stats = truncate_zoom_levels(&container, args.max_zoom)?;
            container.close()?;
            print_lines(shrink_text_lines(&stats));
        }
        Command::Verify(args) => {
            let report = verify_container(&args.input, args.verbose, args.no_progress)?;
            print_report(args.output, &report, verify_text_lines(&report))?;
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_report<T: Serialize>(format: ReportFormat, report: &T, lines: Vec<String>) -> Result<()> {
    match format {
        ReportFormat::Json => {
            let json = serde_json::to_string_pretty(report)?;
            println!("{}", json);
        }
        ReportFormat::Text => print_lines(lines),
    }
    Ok(())
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sass_solver::interactions::NvdisasmLifeRanges;
use sass_solver::oracle::NvDisasm;
use sass_solver::pipeline::{solve_isa, SolverOptions};
use sass_solver::report;

#[derive(Parser, Debug)]
#[clap(name = "sass-solver", about = "Infer GPU instruction encodings from a disassembler.")]
struct Args {
    /// Architecture name passed to the disassembler.
    #[clap(long, default_value = "SM90a")]
    arch: String,

    /// Numeric architecture code for the live-range analyzer.
    #[clap(long, default_value_t = 90)]
    arch_code: u32,

    /// Disassembly cache, loaded at start and rewritten at exit.
    #[clap(long, default_value = "disasm_cache.txt")]
    cache_file: PathBuf,

    /// Path to the nvdisasm binary.
    #[clap(long, default_value = "nvdisasm")]
    nvdisasm: PathBuf,

    /// Worker pool size for per-instruction analysis.
    #[clap(long, default_value_t = 4)]
    num_parallel: usize,

    /// Only analyze instructions whose key contains this substring.
    #[clap(long)]
    filter: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let disassembler = NvDisasm::new(&args.arch, &args.nvdisasm);
    if let Err(error) = disassembler.load_cache(&args.cache_file) {
        warn!(%error, "no usable cache, starting empty");
    }

    let life_ranges = NvdisasmLifeRanges::new(&args.arch, &args.nvdisasm);
    let options = SolverOptions {
        arch_code: args.arch_code,
        num_parallel: args.num_parallel,
        filter: args.filter.clone(),
    };

    let isa = solve_isa(&disassembler, Some(&life_ranges), &options)?;
    info!(instructions = isa.instructions.len(), "analysis complete");

    isa.to_file(Path::new("isa.json"))?;
    report::write_reports(Path::new("output"), &isa, &args.arch)?;
    disassembler.dump_cache(&args.cache_file)?;

    Ok(())
}

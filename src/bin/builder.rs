//! Builder CLI.
//!
//! The reference implementation hardcodes `Nanomites.exe` / `.nano`; this
//! binary keeps those as defaults but promotes both to flags, plus an
//! optional JSON report.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use nanomites::pe::Image;
use nanomites::{builder, resource};

#[derive(Parser)]
#[command(name = "nanomite-builder", about = "Patch relative branches in a PE section into nanomite traps")]
struct Args {
    /// Target executable to patch in place.
    #[arg(long, default_value = "Nanomites.exe")]
    input: PathBuf,

    /// Section to protect.
    #[arg(long, default_value = ".nano")]
    section: String,

    /// Optional path to write a JSON build report to.
    #[arg(long)]
    json_report: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("creating nanomites in section {:?} of {:?}...", args.section, args.input);

    if let Err(err) = run(&args) {
        log::error!("creating nanomites failed: {err}");
        std::process::exit(1);
    }

    info!("creating nanomites finished successfully");
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut image = Image::open(&args.input).context("opening input image")?;
    let extent = image
        .find_section(&args.section)
        .with_context(|| format!("locating section {:?}", args.section))?;

    let bitness = detect_bitness(&image.bytes);
    let mut rng = StdRng::from_entropy();

    let section_bytes = image.section_bytes_mut(&extent);
    let (table, report) = builder::build(&args.section, section_bytes, extent.virtual_address, bitness, &mut rng);

    info!(
        "{} real branches, {} decoys, {} total records",
        report.real_branches, report.decoys, report.total_records
    );

    image.write_to(&args.input).context("writing patched image")?;

    let blob = table.to_bytes();
    resource::attach(&args.input, &blob).context("attaching nanomite resource")?;

    if let Some(path) = &args.json_report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).context("writing JSON report")?;
    }

    Ok(())
}

/// PE `Machine` field distinguishes x86 from x64; goblin exposes it as
/// `PE::is_64`. Bitness only matters to the classifier's underlying
/// decoder (iced-x86 needs to know 16/32/64), so this is kept local to the
/// CLI rather than threaded through `pe::Image`.
fn detect_bitness(bytes: &[u8]) -> u32 {
    match goblin::pe::PE::parse(bytes) {
        Ok(pe) if pe.is_64 => 64,
        _ => 32,
    }
}

//! Tracer demo host.
//!
//! Mirrors the reference `Nanomites.exe`: start tracing the `.nano`
//! section, call into the protected payload, stop tracing, report the
//! result. The CLI surface and the payload itself carry no design
//! weight. The only code here worth reading is the start/call/stop
//! sequencing.

#[path = "../../demos/protected_payload.rs"]
mod protected_payload;

use clap::Parser;
use log::info;

#[derive(Parser)]
#[command(name = "nanomite-demo", about = "Run the protected-code demo under the nanomite tracer")]
struct Args {
    /// Section the nanomite table protects.
    #[arg(long, default_value = ".nano")]
    section: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("unprotected code: calling protected code...");

    nanomites::tracer::start(&args.section)?;
    let checksum = protected_payload::crc32(b"nanomites demo payload");
    nanomites::tracer::stop_tracing();

    info!("unprotected code: the calculated CRC32 is 0x{checksum:08X}");
    info!("unprotected code: end of demo");

    Ok(())
}

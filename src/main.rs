use clap::Parser;
use vmm::VMMConfig;

#[derive(Parser)]
#[clap(version = "0.1", author = "Polytech Montpellier - DevOps")]
struct VMMOpts {
    /// Firmware code image path (flash0, read-only)
    #[clap(long)]
    fwcode: String,

    /// Firmware variables store path (flash1, read-write)
    #[clap(long)]
    fwvars: String,

    /// Optional disk image path, exposed as a SCSI disk LUN
    #[clap(long)]
    disk: Option<String>,

    /// Optional optical image path, exposed as a SCSI CD-ROM LUN
    #[clap(long)]
    optical: Option<String>,

    /// Number of virtual CPUs assigned to the guest
    #[clap(short, long, default_value = "1")]
    cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    #[clap(short, long, default_value = "512")]
    memory: u32,

    /// A level of verbosity, and can be used multiple times
    #[clap(short, long, parse(from_occurrences))]
    verbose: i32,
}

fn main() {
    let opts: VMMOpts = VMMOpts::parse();

    let config = match VMMConfig::new(opts.fwcode, opts.fwvars, opts.disk, opts.optical, opts.cpus, opts.memory, opts.verbose) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = vmm::VMM::new(config).and_then(|mut vmm| vmm.run()) {
        eprintln!("fatal VMM error: {}", e);
        std::process::exit(1);
    }
}

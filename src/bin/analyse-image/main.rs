//! Extract the kernel modules of a container image, and send them to an
//! external tool for analysis.

mod analysis;

use std::{
    ffi::OsStr,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use oci_kmods::{DockerConfig, Error, EventHandler, Fetcher};
use tracing::Level;

use analysis::{parse_kernels, Analysis};

const EXIT_FAILURE: u8 = 1;
const EXIT_FETCH: u8 = 3;
const EXIT_SEARCH: u8 = 9;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Image to analyse.
    #[arg(short, long)]
    image: String,

    /// Colon-separated list of kernels to test against. Empty items are
    /// ignored.
    #[arg(short, long, default_value = "")]
    kernel: String,

    /// Produce a long form report.
    #[arg(short, long)]
    long: bool,

    /// Suppress log messages.
    #[arg(short, long)]
    quiet: bool,

    /// Pull the image from an insecure (plain HTTP) registry.
    #[arg(long)]
    insecure: bool,

    /// Do not check TLS certificates on pull.
    #[arg(long)]
    skip_tls_verify: bool,

    /// CPU architecture to select from an image index.
    #[arg(long)]
    arch: Option<String>,

    /// Operating system to select from an image index.
    #[arg(long)]
    os: Option<String>,

    /// Tool to analyse the extracted modules.
    #[arg(long, default_value = "./ksc_reporter.py")]
    reporter: PathBuf,

    /// Directory where the extraction directory is created.
    #[arg(long, default_value = "/tmp")]
    tmpdir: PathBuf,
}

struct Logger;

impl EventHandler for Logger {
    fn registry_request(&self, url: &str) {
        tracing::debug!(url, "GET");
    }

    fn registry_auth(&self, url: &str) {
        tracing::debug!(url, "AUTH");
    }

    fn image_fetched(&self, reference: &str, layers: usize, bytes: usize) {
        tracing::info!(image = reference, layers, bytes, "Successfully pulled image");
    }

    fn layer_start(&self, index: usize, layer: &str) {
        tracing::debug!(index, layer, "searching layer");
    }

    fn kmod_found(&self, name: &OsStr, entry_path: &Path) {
        tracing::info!(
            kmod = %name.to_string_lossy(),
            path = %entry_path.display(),
            "Found kmod",
        );
    }

    fn kmod_shadowed(&self, name: &OsStr, entry_path: &Path) {
        tracing::debug!(
            kmod = %name.to_string_lossy(),
            path = %entry_path.display(),
            "ignoring kmod hidden by an upper layer",
        );
    }

    fn kmod_extracted(&self, _: &OsStr, destination: &Path) {
        tracing::info!(destination = %destination.display(), "Extracted kmod");
    }

    fn short_read(&self, entry_path: &Path, declared: u64, read: usize) {
        tracing::warn!(
            path = %entry_path.display(),
            declared,
            read,
            "archive entry is shorter than its declared size",
        );
    }

    fn finished(&self, kmods: usize) {
        tracing::info!(kmods, "search finished");
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.quiet { Level::WARN } else { Level::INFO })
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err((code, message)) => {
            eprintln!("\n{message}");
            ExitCode::from(code)
        }
    }
}

fn run(args: &Args) -> Result<(), (u8, String)> {
    let kernels = parse_kernels(&args.kernel);

    // The directory is kept after the run, so the report and the modules
    // can be inspected.
    let extraction_dir = tempfile::Builder::new()
        .prefix("kmod_signer")
        .tempdir_in(&args.tmpdir)
        .map_err(|err| fail(EXIT_FAILURE, "could not create temp dir", &err))?
        .keep();

    let credentials = match DockerConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, "ignoring registry credentials");
            DockerConfig::default()
        }
    };

    let mut fetcher = Fetcher::new(&args.image)
        .insecure(args.insecure)
        .skip_tls_verify(args.skip_tls_verify)
        .credentials(&credentials);

    if let Some(arch) = &args.arch {
        fetcher = fetcher.architecture(arch);
    }

    if let Some(os) = &args.os {
        fetcher = fetcher.os(os);
    }

    let found = match oci_kmods::find_kmods(fetcher, &extraction_dir, &Logger) {
        Ok(found) => found,
        Err(err @ Error::Fetch(_)) => return Err(fail(EXIT_FETCH, "could not get image", &err)),
        Err(err @ Error::Walk(_)) => {
            return Err(fail(EXIT_SEARCH, "failed to search image", &err))
        }
    };

    let analysis = Analysis {
        tool: &args.reporter,
        extraction_dir: &extraction_dir,
        long_report: args.long,
        kernels: &kernels,
    };

    let report = analysis
        .run(found.paths())
        .map_err(|err| fail(EXIT_FAILURE, "analysis failed", &err))?;

    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "\n{}", String::from_utf8_lossy(&report));

    Ok(())
}

fn fail(code: u8, message: &str, err: &dyn std::error::Error) -> (u8, String) {
    tracing::error!(%err, "{message}");
    (code, message.to_owned())
}

#[test]
fn kernel_list_arguments() {
    use clap::CommandFactory;

    Args::command().debug_assert();

    let command = Args::command();
    let kernel = command
        .get_arguments()
        .find(|a| a.get_id() == "kernel")
        .unwrap();

    let help = kernel.get_help().unwrap().to_string();
    assert!(help.contains("Empty items are ignored"), "{help}");

    let args = Args::try_parse_from(["analyse-image", "-i", "img", "-k", "a::b:"]).unwrap();
    assert_eq!(parse_kernels(&args.kernel), ["a", "b"]);
}

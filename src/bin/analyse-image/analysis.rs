use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

/// Name of the report written by the analysis tool in the extraction
/// directory.
const REPORT_FILE: &str = "ksc-report.txt";

#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error("Could not run {}: {source}", .tool.display())]
    Spawn { tool: PathBuf, source: io::Error },

    #[error("{} returned {status}: {stderr}", .tool.display())]
    Failed {
        tool: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
}

/// Invocation of the external tool to analyse the extracted modules.
pub struct Analysis<'a> {
    pub tool: &'a Path,
    pub extraction_dir: &'a Path,
    pub long_report: bool,
    pub kernels: &'a [String],
}

impl Analysis<'_> {
    /// Arguments for the tool:
    ///
    /// ```notrust
    /// -f <dir>/ksc-report.txt -r summary|full -m <kmod>... -k <kernel>...
    /// ```
    pub fn args<'p>(&self, kmods: impl IntoIterator<Item = &'p Path>) -> Vec<OsString> {
        let report = if self.long_report { "full" } else { "summary" };

        let mut args = vec![
            "-f".into(),
            self.extraction_dir.join(REPORT_FILE).into_os_string(),
            "-r".into(),
            report.into(),
        ];

        for kmod in kmods {
            args.push("-m".into());
            args.push(kmod.into());
        }

        for kernel in self.kernels {
            args.push("-k".into());
            args.push(kernel.into());
        }

        args
    }

    /// Run the tool, and return its standard output.
    pub fn run<'p>(
        &self,
        kmods: impl IntoIterator<Item = &'p Path>,
    ) -> Result<Vec<u8>, AnalysisError> {
        let args = self.args(kmods);

        tracing::info!(tool = %self.tool.display(), ?args, "running analysis");

        let output = Command::new(self.tool)
            .args(&args)
            .output()
            .map_err(|source| AnalysisError::Spawn {
                tool: self.tool.to_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(AnalysisError::Failed {
                tool: self.tool.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(output.stdout)
    }
}

/// Split a colon-separated list of kernel versions. Empty items are
/// dropped.
pub fn parse_kernels(list: &str) -> Vec<String> {
    list.split(':')
        .filter(|k| !k.is_empty())
        .map(str::to_owned)
        .collect()
}

#[test]
fn build_arguments() {
    let kernels = parse_kernels("5.14.0-1.el9.x86_64::6.1.0");
    assert_eq!(kernels, ["5.14.0-1.el9.x86_64", "6.1.0"]);

    let mut analysis = Analysis {
        tool: Path::new("./ksc_reporter.py"),
        extraction_dir: Path::new("/tmp/kmod_signer123"),
        long_report: false,
        kernels: &kernels,
    };

    let kmods = [
        Path::new("/tmp/kmod_signer123/a.ko"),
        Path::new("/tmp/kmod_signer123/b.ko"),
    ];

    assert_eq!(
        analysis.args(kmods),
        [
            "-f",
            "/tmp/kmod_signer123/ksc-report.txt",
            "-r",
            "summary",
            "-m",
            "/tmp/kmod_signer123/a.ko",
            "-m",
            "/tmp/kmod_signer123/b.ko",
            "-k",
            "5.14.0-1.el9.x86_64",
            "-k",
            "6.1.0",
        ]
    );

    analysis.long_report = true;
    analysis.kernels = &[];
    assert_eq!(
        analysis.args([]),
        ["-f", "/tmp/kmod_signer123/ksc-report.txt", "-r", "full"]
    );
}

#[test]
fn no_kernels() {
    assert!(parse_kernels("").is_empty());
    assert!(parse_kernels(":::").is_empty());
}

#[test]
fn report_tool_failures() {
    let dir = tempfile::tempdir().unwrap();

    let analysis = Analysis {
        tool: Path::new("false"),
        extraction_dir: dir.path(),
        long_report: false,
        kernels: &[],
    };

    let err = analysis.run([]).unwrap_err();
    assert!(matches!(err, AnalysisError::Failed { .. }));

    let analysis = Analysis {
        tool: &dir.path().join("missing-tool"),
        ..analysis
    };

    let err = analysis.run([]).unwrap_err();
    assert!(matches!(err, AnalysisError::Spawn { .. }));
}

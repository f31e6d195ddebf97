use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use log::{debug, info, warn};

const SUMMARY_PLOT_SCRIPT: &str = include_str!("scripts/plot_blt_summary.R");
const TARGETS_PLOT_SCRIPT: &str = include_str!("scripts/plot_blt_targets.R");

const DEFAULT_INTERPRETER: &str = "Rscript";

/// Renders the cut-rate figures by handing the packaged R scripts to an R
/// interpreter. The metrics files are the product of record; when no
/// interpreter can be found the plots are skipped with a warning rather than
/// failing the run.
pub struct Plotter {
    interpreter: Option<PathBuf>,
}

impl Plotter {
    pub fn new(interpreter_override: Option<PathBuf>) -> Self {
        let interpreter = match interpreter_override {
            Some(p) => Some(p),
            None => match which::which(DEFAULT_INTERPRETER) {
                Ok(p) => Some(p),
                Err(_) => {
                    warn!(
                        "could not find {DEFAULT_INTERPRETER} on the PATH, \
                         plots will not be generated"
                    );
                    None
                }
            },
        };
        Self { interpreter }
    }

    fn run_script(
        &self,
        script: &str,
        script_name: &str,
        args: &[&str],
    ) -> anyhow::Result<()> {
        let Some(interpreter) = self.interpreter.as_ref() else {
            debug!("no interpreter, skipping {script_name}");
            return Ok(());
        };
        let dir = tempfile::tempdir()
            .context("failed to create temp dir for plotting script")?;
        let script_fp = dir.path().join(script_name);
        std::fs::write(&script_fp, script).with_context(|| {
            format!("failed to materialize script {script_name}")
        })?;
        debug!("running {interpreter:?} {script_fp:?} {args:?}");
        let output = Command::new(interpreter)
            .arg(&script_fp)
            .args(args)
            .output()
            .with_context(|| format!("failed to run {interpreter:?}"))?;
        if !output.status.success() {
            bail!(
                "{script_name} exited with {}, stderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Render the experiment-wide cut-rate-by-mismatches figure from the
    /// cut samples' summary tables.
    pub fn plot_summary(
        &self,
        pdf: &Path,
        summary_files: &[PathBuf],
    ) -> anyhow::Result<()> {
        let mut args = vec![pdf.to_string_lossy().into_owned()];
        args.extend(
            summary_files
                .iter()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        let args = args.iter().map(|s| s.as_str()).collect::<Vec<&str>>();
        self.run_script(SUMMARY_PLOT_SCRIPT, "plot_blt_summary.R", &args)?;
        info!("wrote {pdf:?}");
        Ok(())
    }

    /// Render the per-sample target figure from one targets table.
    pub fn plot_targets(
        &self,
        targets_file: &Path,
        pdf: &Path,
    ) -> anyhow::Result<()> {
        let targets = targets_file.to_string_lossy().into_owned();
        let pdf_arg = pdf.to_string_lossy().into_owned();
        self.run_script(
            TARGETS_PLOT_SCRIPT,
            "plot_blt_targets.R",
            &[targets.as_str(), pdf_arg.as_str()],
        )?;
        info!("wrote {pdf:?}");
        Ok(())
    }
}

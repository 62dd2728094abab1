mod cli;
mod error;
mod ibm_float;
mod logging;
mod output;
mod pipeline;
mod readers;
mod temporal;
mod types;
mod writers;

use std::path::Path;

use clap::Parser;
use cli::{Cli, Commands};
use error::Error;
use types::{ProcessingOptions, Result, SasBackend};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    match cli.command {
        Some(Commands::Split {
            input,
            out_dir,
            report,
            preview,
            sas_backend,
            hash_file,
        }) => {
            run_split(&input, &out_dir, report.as_deref(), preview, sas_backend, hash_file)?;
        }
        Some(Commands::Gui) | None => {
            #[cfg(not(target_arch = "wasm32"))]
            {
                run_gui()?;
            }
            #[cfg(target_arch = "wasm32")]
            {
                eprintln!("GUI not supported on this platform");
            }
        }
    }

    Ok(())
}

fn run_split(
    input: &Path,
    out_dir: &Path,
    report: Option<&Path>,
    preview: usize,
    sas_backend: SasBackend,
    hash_file: bool,
) -> Result<()> {
    let options = ProcessingOptions {
        sas_backend,
        hash_source: hash_file,
    };

    let outcome = pipeline::process_file(input, &options)?;

    if preview > 0 {
        eprintln!(
            "Here are the first {} rows of the {} file:",
            types::MAX_ROWS,
            outcome.source_format.label()
        );
        eprint!("{}", output::render_preview(&outcome.dataset, preview));
    }
    for caveat in &outcome.caveats {
        eprintln!("Note: {}", caveat);
    }

    for path in output::write_artifacts(&outcome, out_dir)? {
        eprintln!("Written: {}", path.display());
    }

    let split_report = output::build_report(&outcome);
    if let Some(report_path) = report {
        output::write_json_file(&split_report, report_path)?;
        eprintln!("Report written to: {}", report_path.display());
    } else {
        output::write_json_stdout(&split_report)?;
    }

    if let Some(failure) = outcome.failures.into_iter().next() {
        return Err(failure.error);
    }

    Ok(())
}

#[cfg(not(target_arch = "wasm32"))]
fn run_gui() -> Result<()> {
    use crate::cli::GuiApp;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 650.0])
            .with_drag_and_drop(true),
        ..Default::default()
    };

    eframe::run_native(
        "File Split",
        options,
        Box::new(|_cc| Box::new(GuiApp::default())),
    )
    .map_err(|e| Error::InvalidInput(format!("GUI error: {}", e)))?;

    Ok(())
}

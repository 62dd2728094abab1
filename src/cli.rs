use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::pipeline::{self, SplitOutcome};
use crate::types::{FileFormat, ProcessingOptions, SasBackend, MAX_ROWS};

/// Cut data files down to their first 500 rows
#[derive(Parser, Debug)]
#[command(name = "filesplit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log debug detail to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Truncate a CSV, XPT or SAS7BDAT file and write the results
    Split {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Directory the output files are written to
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Report JSON file path (stdout if not specified)
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Print this many preview rows to stderr
        #[arg(short, long, default_value_t = 10)]
        preview: usize,

        /// SAS7BDAT decoder to use
        #[arg(long, value_enum, default_value_t = SasBackend::WithMetadata)]
        sas_backend: SasBackend,

        /// Compute file hash (SHA-256); `--hash-file false` skips it
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        hash_file: bool,
    },

    /// Launch the GUI
    Gui,
}

/// GUI Application state
#[derive(Debug, Clone, PartialEq, Default)]
pub enum GuiState {
    #[default]
    Ready,
    Processing,
    Done,
    Error(String),
}

fn backend_label(backend: SasBackend) -> &'static str {
    match backend {
        SasBackend::WithMetadata => "Keep metadata (CSV + XPT)",
        SasBackend::DataOnly => "Data only (CSV)",
    }
}

/// GUI Application
#[derive(Default)]
pub struct GuiApp {
    state: GuiState,
    dropped_file: Option<PathBuf>,
    outcome: Option<SplitOutcome>,
    /// Result of the last save, shown under the download buttons
    notice: Option<String>,
    options: ProcessingOptions,
}

impl eframe::App for GuiApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Handle dropped files
        ctx.input(|i| {
            if let Some(path) = i.raw.dropped_files.first().and_then(|f| f.path.clone()) {
                self.dropped_file = Some(path);
                self.state = GuiState::Processing;
            }
        });

        if self.state == GuiState::Processing {
            if let Some(ref path) = self.dropped_file {
                match pipeline::process_file(path, &self.options) {
                    Ok(outcome) => {
                        self.outcome = Some(outcome);
                        self.state = GuiState::Done;
                    }
                    Err(e) => {
                        self.state = GuiState::Error(e.to_string());
                    }
                }
            }
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading(format!("filesplit v{}", env!("CARGO_PKG_VERSION")));
            ui.add_space(10.0);

            match &self.state {
                GuiState::Ready => {
                    self.show_ready_state(ui);
                }
                GuiState::Processing => {
                    ui.spinner();
                    ui.label("Processing file...");
                }
                GuiState::Done => {
                    self.show_done_state(ui);
                }
                GuiState::Error(msg) => {
                    let msg = msg.clone();
                    self.show_error_state(ui, msg);
                }
            }
        });
    }
}

impl GuiApp {
    fn show_ready_state(&mut self, ui: &mut egui::Ui) {
        let drop_zone = egui::Frame::none()
            .fill(egui::Color32::from_gray(40))
            .stroke(egui::Stroke::new(2.0, egui::Color32::from_gray(100)))
            .rounding(10.0)
            .inner_margin(40.0);

        drop_zone.show(ui, |ui| {
            ui.vertical_centered(|ui| {
                ui.label("Drag and drop a data file here");
                ui.label("(CSV, SAS XPT, SAS7BDAT)");
                ui.add_space(20.0);
                ui.label("or");
                ui.add_space(10.0);
                if ui.button("Browse...").clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .add_filter("Data files", FileFormat::all_extensions())
                        .pick_file()
                    {
                        self.dropped_file = Some(path);
                        self.state = GuiState::Processing;
                    }
                }
            });
        });

        ui.add_space(20.0);

        ui.collapsing("Options", |ui| {
            egui::ComboBox::from_label("SAS7BDAT decoder")
                .selected_text(backend_label(self.options.sas_backend))
                .show_ui(ui, |ui| {
                    for backend in [SasBackend::WithMetadata, SasBackend::DataOnly] {
                        ui.selectable_value(
                            &mut self.options.sas_backend,
                            backend,
                            backend_label(backend),
                        );
                    }
                });
            ui.checkbox(&mut self.options.hash_source, "Compute file hash");
        });
    }

    fn show_done_state(&mut self, ui: &mut egui::Ui) {
        let Some(outcome) = self.outcome.as_ref() else {
            self.reset();
            return;
        };

        ui.label(format!(
            "Here are the first {} rows of the {} file:",
            MAX_ROWS,
            outcome.source_format.label()
        ));
        if outcome.source_rows > outcome.dataset.row_count() {
            ui.small(format!("{} rows in the source", outcome.source_rows));
        }
        ui.add_space(10.0);

        for caveat in &outcome.caveats {
            ui.colored_label(egui::Color32::YELLOW, format!("Note: {}", caveat));
        }
        for failure in &outcome.failures {
            ui.colored_label(
                egui::Color32::RED,
                format!("{}: {}", failure.file_name, failure.error),
            );
        }

        let mut save_index: Option<usize> = None;
        let mut should_reset = false;

        ui.horizontal(|ui| {
            for (index, artifact) in outcome.artifacts.iter().enumerate() {
                if ui.button(artifact.button_label()).clicked() {
                    save_index = Some(index);
                }
            }
            if ui.button("New file").clicked() {
                should_reset = true;
            }
        });

        if let Some(ref notice) = self.notice {
            ui.label(notice);
        }
        ui.add_space(10.0);

        egui::ScrollArea::both()
            .max_height(400.0)
            .auto_shrink([false, false])
            .show(ui, |ui| {
                egui::Grid::new("preview")
                    .striped(true)
                    .show(ui, |ui| {
                        for column in outcome.dataset.columns() {
                            ui.strong(column);
                        }
                        ui.end_row();
                        for row in outcome.dataset.rows() {
                            for value in row {
                                if value.is_null() {
                                    ui.weak(".");
                                } else {
                                    ui.label(value.to_text());
                                }
                            }
                            ui.end_row();
                        }
                    });
            });

        if let Some(index) = save_index {
            self.save_artifact(index);
        }
        if should_reset {
            self.reset();
        }
    }

    fn save_artifact(&mut self, index: usize) {
        let Some(artifact) = self.outcome.as_ref().and_then(|o| o.artifacts.get(index)) else {
            return;
        };

        let Some(path) = rfd::FileDialog::new()
            .set_file_name(artifact.file_name.as_str())
            .add_filter(artifact.format.label(), &[artifact.format.extension()])
            .save_file()
        else {
            return;
        };

        self.notice = Some(match std::fs::write(&path, &artifact.bytes) {
            Ok(()) => format!("Saved {}", path.display()),
            Err(e) => format!("Failed to save {}: {}", path.display(), e),
        });
    }

    fn show_error_state(&mut self, ui: &mut egui::Ui, msg: String) {
        ui.colored_label(egui::Color32::RED, format!("Error: {}", msg));
        ui.add_space(20.0);
        if ui.button("Try again").clicked() {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.state = GuiState::Ready;
        self.dropped_file = None;
        self.outcome = None;
        self.notice = None;
    }
}

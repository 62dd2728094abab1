use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::readers::create_reader;
use crate::types::{
    Dataset, FileFormat, FormatMetadata, OutputArtifact, ProcessingOptions, Result, MAX_ROWS,
    OUTPUT_STEM,
};
use crate::writers;

const SAS7BDAT_CAVEAT: &str =
    "Exporting to SAS7BDAT format is not supported. Download as CSV instead.";
const NO_METADATA_CAVEAT: &str =
    "XPT export is unsupported for this input: column metadata was not captured while decoding.";

/// One file to produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub format: FileFormat,
    pub file_name: String,
    /// Source format this target stands in for
    pub fallback_for: Option<FileFormat>,
}

impl Target {
    fn native(format: FileFormat) -> Self {
        Self {
            format,
            file_name: format!("{}.{}", OUTPUT_STEM, format.extension()),
            fallback_for: None,
        }
    }

    fn fallback(format: FileFormat, source: FileFormat) -> Self {
        let file_name = match format {
            FileFormat::Csv => format!("{}_{}.csv", OUTPUT_STEM, source.extension()),
            _ => format!("{}.{}", OUTPUT_STEM, format.extension()),
        };
        Self {
            format,
            file_name,
            fallback_for: Some(source),
        }
    }
}

/// Targets for a source, plus the caveats explaining any downgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    pub targets: Vec<Target>,
    pub caveats: Vec<String>,
}

/// An output that could not be encoded
#[derive(Debug)]
pub struct EncodeFailure {
    pub file_name: String,
    pub error: Error,
}

/// Everything one run produced
#[derive(Debug)]
pub struct SplitOutcome {
    pub source_name: String,
    pub source_format: FileFormat,
    pub source_sha256: Option<String>,
    /// Rows decoded before truncation
    pub source_rows: usize,
    /// Truncated rows, used for the preview
    pub dataset: Dataset,
    pub artifacts: Vec<OutputArtifact>,
    pub caveats: Vec<String>,
    pub failures: Vec<EncodeFailure>,
}

/// Detect the format from a file name. Only the text after the last dot
/// counts, compared case-insensitively.
pub fn classify(name: &str) -> Result<FileFormat> {
    let ext = name.rsplit('.').next().unwrap_or(name);
    FileFormat::from_extension(ext).ok_or_else(|| {
        Error::UnsupportedFormat(format!(
            "Unsupported file extension: .{} (expected one of: {})",
            ext,
            FileFormat::all_extensions().join(", ")
        ))
    })
}

/// Keep the first `MAX_ROWS` rows
pub fn truncate(mut dataset: Dataset) -> Dataset {
    dataset.truncate(MAX_ROWS);
    dataset
}

/// Decide which files can be produced for `source`
pub fn plan_outputs(source: FileFormat, metadata_available: bool) -> OutputPlan {
    let mut targets = Vec::new();
    let mut caveats = Vec::new();

    match source {
        FileFormat::Csv => targets.push(Target::native(FileFormat::Csv)),
        FileFormat::Xpt if metadata_available => targets.push(Target::native(FileFormat::Xpt)),
        FileFormat::Xpt => {
            targets.push(Target::fallback(FileFormat::Csv, source));
            caveats.push(format!("{} Download as CSV instead.", NO_METADATA_CAVEAT));
        }
        FileFormat::Sas7bdat => {
            targets.push(Target::fallback(FileFormat::Csv, source));
            caveats.push(SAS7BDAT_CAVEAT.to_string());
            if metadata_available {
                targets.push(Target::fallback(FileFormat::Xpt, source));
            } else {
                caveats.push(NO_METADATA_CAVEAT.to_string());
            }
        }
    }

    OutputPlan { targets, caveats }
}

/// Encode every target, keeping successes and failures apart
pub fn encode_targets(
    dataset: &Dataset,
    metadata: Option<&FormatMetadata>,
    targets: Vec<Target>,
) -> (Vec<OutputArtifact>, Vec<EncodeFailure>) {
    let mut artifacts = Vec::new();
    let mut failures = Vec::new();

    for target in targets {
        match writers::encode(dataset, metadata, target.format) {
            Ok(bytes) => {
                debug!(file = %target.file_name, size = bytes.len(), "encoded artifact");
                artifacts.push(OutputArtifact {
                    file_name: target.file_name,
                    format: target.format,
                    fallback_for: target.fallback_for,
                    bytes,
                });
            }
            Err(error) => {
                warn!(file = %target.file_name, %error, "could not encode artifact");
                failures.push(EncodeFailure {
                    file_name: target.file_name,
                    error,
                });
            }
        }
    }

    (artifacts, failures)
}

/// Classify, decode, truncate and re-encode one uploaded file.
///
/// Decoding errors abort. Encoding errors are collected in
/// `SplitOutcome::failures` so the preview survives them.
pub fn process(bytes: &[u8], name: &str, options: &ProcessingOptions) -> Result<SplitOutcome> {
    let format = classify(name)?;
    info!(file = name, %format, size = bytes.len(), "processing");

    let source_sha256 = options.hash_source.then(|| sha256_hex(bytes));

    let mut reader = create_reader(format, options);
    let decoded = reader.read(bytes)?;
    let source_rows = decoded.dataset.row_count();
    let dataset = truncate(decoded.dataset);

    let metadata_available = reader.captures_metadata() && decoded.metadata.is_some();
    let plan = plan_outputs(format, metadata_available);
    let (artifacts, failures) = encode_targets(&dataset, decoded.metadata.as_ref(), plan.targets);

    info!(
        source_rows,
        rows = dataset.row_count(),
        artifacts = artifacts.len(),
        failures = failures.len(),
        "done"
    );

    Ok(SplitOutcome {
        source_name: name.to_string(),
        source_format: format,
        source_sha256,
        source_rows,
        dataset,
        artifacts,
        caveats: plan.caveats,
        failures,
    })
}

/// Read `path` and run [`process`] on its contents
pub fn process_file(path: &Path, options: &ProcessingOptions) -> Result<SplitOutcome> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {}", path.display())))?;
    let bytes = fs::read(path)?;
    process(&bytes, name, options)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::csv::CsvReader;
    use crate::readers::sas7bdat::fixture::{self, FixtureColumn};
    use crate::readers::xpt::XptReader;
    use crate::readers::DataReader;
    use crate::types::{ColumnMeta, SasBackend, Value};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn numbered_csv(rows: usize) -> String {
        let mut text = String::from("id,value\n");
        for i in 1..=rows {
            text.push_str(&format!("{},v{}\n", i, i));
        }
        text
    }

    fn sas_columns() -> Vec<FixtureColumn> {
        vec![
            FixtureColumn::numeric("ID", "Subject"),
            FixtureColumn::character("SEX", "Sex", 1),
        ]
    }

    fn sas_rows(n: usize) -> Vec<Vec<Value>> {
        (0..n)
            .map(|i| {
                vec![
                    Value::Number(i as f64),
                    Value::String(if i % 2 == 0 { "F" } else { "M" }.to_string()),
                ]
            })
            .collect()
    }

    fn data_only() -> ProcessingOptions {
        ProcessingOptions {
            sas_backend: SasBackend::DataOnly,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("data.csv").unwrap(), FileFormat::Csv);
        assert_eq!(classify("AE.XPT").unwrap(), FileFormat::Xpt);
        assert_eq!(classify("dm.v2.sas7bdat").unwrap(), FileFormat::Sas7bdat);
        assert!(matches!(classify("notes.txt"), Err(Error::UnsupportedFormat(_))));
        assert!(matches!(classify("csv"), Ok(FileFormat::Csv)));
        assert!(classify("data.csv.gz").is_err());
    }

    #[test]
    fn test_truncate_keeps_order_and_is_idempotent() {
        let ds = CsvReader::new()
            .read(numbered_csv(1000).as_bytes())
            .unwrap()
            .dataset;

        let once = truncate(ds.clone());
        assert_eq!(once.row_count(), 500);
        assert_eq!(once.columns(), ds.columns());
        assert_eq!(once.rows(), &ds.rows()[..500]);
        assert_eq!(truncate(once.clone()), once);

        let small = CsvReader::new().read(numbered_csv(3).as_bytes()).unwrap().dataset;
        assert_eq!(truncate(small.clone()), small);
    }

    #[test]
    fn test_plan_outputs() {
        let csv = plan_outputs(FileFormat::Csv, false);
        assert_eq!(csv.targets, vec![Target::native(FileFormat::Csv)]);
        assert!(csv.caveats.is_empty());

        let xpt = plan_outputs(FileFormat::Xpt, true);
        assert_eq!(xpt.targets[0].file_name, "first_500_rows.xpt");
        assert!(xpt.caveats.is_empty());

        let xpt_bare = plan_outputs(FileFormat::Xpt, false);
        assert_eq!(xpt_bare.targets[0].file_name, "first_500_rows_xpt.csv");
        assert_eq!(xpt_bare.caveats.len(), 1);

        let sas = plan_outputs(FileFormat::Sas7bdat, true);
        let names: Vec<_> = sas.targets.iter().map(|t| t.file_name.as_str()).collect();
        assert_eq!(names, ["first_500_rows_sas7bdat.csv", "first_500_rows.xpt"]);
        assert!(sas
            .targets
            .iter()
            .all(|t| t.fallback_for == Some(FileFormat::Sas7bdat)));

        let sas_bare = plan_outputs(FileFormat::Sas7bdat, false);
        assert_eq!(sas_bare.targets.len(), 1);
        assert_eq!(sas_bare.caveats.len(), 2);
    }

    #[test]
    fn test_csv_scenario() {
        let outcome = process(numbered_csv(1000).as_bytes(), "big.csv", &Default::default()).unwrap();

        assert_eq!(outcome.source_rows, 1000);
        assert_eq!(outcome.dataset.row_count(), 500);
        assert!(outcome.caveats.is_empty());
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.artifacts.len(), 1);

        let artifact = &outcome.artifacts[0];
        assert_eq!(artifact.file_name, "first_500_rows.csv");
        assert_eq!(artifact.button_label(), "Download CSV");

        let reparsed = CsvReader::new().read(&artifact.bytes).unwrap().dataset;
        assert_eq!(reparsed.columns(), ["id", "value"]);
        assert_eq!(reparsed.row_count(), 500);
        assert_eq!(reparsed.value(0, "id"), Some(&Value::Number(1.0)));
        assert_eq!(
            reparsed.value(499, "value"),
            Some(&Value::String("v500".into()))
        );
    }

    #[test]
    fn test_late_text_does_not_retype_kept_rows() {
        let mut source = String::from("code\n");
        for i in 1..=500 {
            source.push_str(&format!("{}\n", i));
        }
        source.push_str("A7\n");

        let outcome = process(source.as_bytes(), "codes.csv", &Default::default()).unwrap();
        assert_eq!(outcome.dataset.value(0, "code"), Some(&Value::Number(1.0)));

        let reparsed = CsvReader::new().read(&outcome.artifacts[0].bytes).unwrap().dataset;
        assert_eq!(reparsed, outcome.dataset);
    }

    #[test]
    fn test_sas7bdat_dates_render_as_dates() {
        let columns = vec![
            FixtureColumn::numeric("ID", "Subject"),
            FixtureColumn::numeric("VISITDT", "Visit date").with_format("DATE", 9, 0),
        ];
        let rows = vec![vec![Value::Number(1.0), Value::Number(22_000.0)]];
        let source = fixture::build("sv", &columns, &rows, false);
        let outcome = process(&source, "sv.sas7bdat", &Default::default()).unwrap();

        let visit = outcome.dataset.value(0, "VISITDT").unwrap();
        assert_eq!(visit.to_text(), "2020-03-26");

        let csv = String::from_utf8(outcome.artifacts[0].bytes.clone()).unwrap();
        assert_eq!(csv, "ID,VISITDT\n1,2020-03-26\n");

        let xpt = XptReader::new().read(&outcome.artifacts[1].bytes).unwrap();
        assert_eq!(xpt.dataset, outcome.dataset);
    }

    #[test]
    fn test_reprocessing_output_is_stable() {
        let first = process(numbered_csv(800).as_bytes(), "a.csv", &Default::default()).unwrap();
        let bytes = &first.artifacts[0].bytes;
        let second = process(bytes, "first_500_rows.csv", &Default::default()).unwrap();

        assert_eq!(&second.artifacts[0].bytes, bytes);
        assert_eq!(second.dataset, first.dataset);
    }

    #[test]
    fn test_xpt_scenario() {
        let mut ds = Dataset::new(vec!["SUBJ".to_string(), "DOSE".to_string()]);
        for i in 0..10 {
            ds.push_row(vec![
                Value::String(format!("S{:02}", i)),
                Value::Number(i as f64 * 2.5),
            ])
            .unwrap();
        }
        let meta = FormatMetadata {
            dataset_name: "EX".to_string(),
            columns: vec![
                ColumnMeta::character("SUBJ", 3),
                ColumnMeta::numeric("DOSE").with_label("Dose"),
            ],
            ..Default::default()
        };
        let source = writers::encode(&ds, Some(&meta), FileFormat::Xpt).unwrap();

        let outcome = process(&source, "ex.xpt", &Default::default()).unwrap();
        assert_eq!(outcome.dataset, ds);
        assert!(outcome.caveats.is_empty());
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].file_name, "first_500_rows.xpt");
        assert_eq!(outcome.artifacts[0].fallback_for, None);

        let reread = XptReader::new().read(&outcome.artifacts[0].bytes).unwrap();
        assert_eq!(reread.dataset, ds);
        assert_eq!(reread.metadata.unwrap().columns[1].label, "Dose");
    }

    #[test]
    fn test_sas7bdat_without_metadata() {
        let source = fixture::build("dm", &sas_columns(), &sas_rows(10), false);
        let outcome = process(&source, "dm.sas7bdat", &data_only()).unwrap();

        assert_eq!(outcome.dataset.row_count(), 10);
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].file_name, "first_500_rows_sas7bdat.csv");
        assert_eq!(
            outcome.artifacts[0].button_label(),
            "Download CSV (Fallback for SAS7BDAT)"
        );
        assert!(outcome
            .caveats
            .iter()
            .any(|c| c.starts_with("XPT export is unsupported")));
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_sas7bdat_with_metadata() {
        let source = fixture::build("dm", &sas_columns(), &sas_rows(1200), false);
        let outcome = process(&source, "dm.sas7bdat", &Default::default()).unwrap();

        assert_eq!(outcome.source_rows, 1200);
        assert_eq!(outcome.dataset.row_count(), 500);

        let formats: Vec<_> = outcome.artifacts.iter().map(|a| a.format).collect();
        assert_eq!(formats, [FileFormat::Csv, FileFormat::Xpt]);
        assert_eq!(outcome.caveats, [SAS7BDAT_CAVEAT]);

        let xpt = XptReader::new().read(&outcome.artifacts[1].bytes).unwrap();
        assert_eq!(xpt.dataset, outcome.dataset);
    }

    #[test]
    fn test_encode_failure_keeps_preview() {
        let ds = CsvReader::new().read(b"a\n1\n").unwrap().dataset;
        let targets = vec![
            Target::native(FileFormat::Csv),
            Target::native(FileFormat::Xpt),
        ];

        let (artifacts, failures) = encode_targets(&ds, None, targets);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file_name, "first_500_rows.xpt");
        assert!(matches!(failures[0].error, Error::Encode { .. }));
    }

    #[test]
    fn test_decode_failure_aborts() {
        let err = process(b"garbage", "x.xpt", &Default::default()).unwrap_err();
        assert!(matches!(err, Error::Parse { format: FileFormat::Xpt, .. }));
    }

    #[test]
    fn test_process_file_with_hash() {
        let mut file = NamedTempFile::with_suffix(".csv").unwrap();
        write!(file, "col1,col2\n1,a\n").unwrap();

        let options = ProcessingOptions {
            hash_source: true,
            ..Default::default()
        };
        let outcome = process_file(file.path(), &options).unwrap();
        assert_eq!(outcome.source_sha256.as_deref().map(str::len), Some(64));
        assert_eq!(outcome.source_format, FileFormat::Csv);
    }
}

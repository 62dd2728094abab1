use csv::WriterBuilder;

use crate::error::Error;
use crate::types::{Dataset, FileFormat, Result};

/// Encode a dataset as comma-separated text with a header row. Nulls are
/// written as empty fields.
pub fn encode(dataset: &Dataset) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    if dataset.column_count() > 0 {
        writer
            .write_record(dataset.columns())
            .map_err(|e| Error::encode(FileFormat::Csv, e))?;
        for row in dataset.rows() {
            writer
                .write_record(row.iter().map(|value| value.to_text()))
                .map_err(|e| Error::encode(FileFormat::Csv, e))?;
        }
    }

    writer
        .into_inner()
        .map_err(|e| Error::encode(FileFormat::Csv, e.error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::csv::CsvReader;
    use crate::readers::DataReader;
    use crate::types::Value;

    #[test]
    fn test_quotes_and_nulls() {
        let mut ds = Dataset::new(vec!["name".to_string(), "score".to_string()]);
        ds.push_row(vec![Value::String("Smith, J".into()), Value::Null])
            .unwrap();
        ds.push_row(vec![Value::String("say \"hi\"".into()), Value::Number(2.5)])
            .unwrap();

        let text = String::from_utf8(encode(&ds).unwrap()).unwrap();
        assert_eq!(text, "name,score\n\"Smith, J\",\n\"say \"\"hi\"\"\",2.5\n");
    }

    #[test]
    fn test_reparse_matches_source() {
        let source = "id,value,note\n1,10.5,a\n2,,b\n3,-4,\"x,y\"\n";
        let decoded = CsvReader::new().read(source.as_bytes()).unwrap();

        let encoded = encode(&decoded.dataset).unwrap();
        let reparsed = CsvReader::new().read(&encoded).unwrap();

        assert_eq!(reparsed.dataset, decoded.dataset);
    }

    #[test]
    fn test_no_columns() {
        assert!(encode(&Dataset::default()).unwrap().is_empty());
    }
}

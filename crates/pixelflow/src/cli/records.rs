//! Image records as JSON Lines, the CLI's stand-in for a metadata database.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use pixelflow_core::ImageRecord;

/// Read records from a JSONL file. A missing file yields no records;
/// lines that do not parse are counted and skipped.
pub fn load_records(path: &Path) -> anyhow::Result<Vec<ImageRecord>> {
    if !path.exists() {
        tracing::info!("No records at {:?}, starting empty", path);
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut skipped_lines = 0usize;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ImageRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) => skipped_lines += 1,
        }
    }
    if skipped_lines > 0 {
        tracing::warn!(
            "{skipped_lines} lines in {:?} could not be parsed; those files will be treated as new",
            path
        );
    }
    tracing::info!("Loaded {} records from {:?}", records.len(), path);
    Ok(records)
}

/// Write records as JSONL to a file, or stdout when `path` is `None`.
pub fn write_records(path: Option<&Path>, records: &[ImageRecord]) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            // Write beside the target first so a failed run keeps the old file.
            let tmp = path.with_extension("jsonl.tmp");
            {
                let mut writer = BufWriter::new(File::create(&tmp)?);
                write_lines(&mut writer, records)?;
                writer.flush()?;
            }
            std::fs::rename(&tmp, path)?;
            tracing::info!("Wrote {} records to {:?}", records.len(), path);
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            write_lines(&mut writer, records)?;
            writer.flush()?;
        }
    }
    Ok(())
}

fn write_lines(writer: &mut impl Write, records: &[ImageRecord]) -> anyhow::Result<()> {
    for record in records {
        serde_json::to_writer(&mut *writer, record)?;
        writeln!(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelflow_core::UpdateKind;
    use std::collections::BTreeMap;

    fn sample(path: &str) -> ImageRecord {
        let mut record = ImageRecord::new("photos", path, 1000);
        record.apply(&UpdateKind::Hashes {
            digests: BTreeMap::from([("SHA-256".to_string(), vec![9; 32])]),
        });
        record.apply(&UpdateKind::Thumbnail { max_dimension: 256 });
        record
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let records = vec![sample("a.jpg"), sample("b/c.jpg")];

        write_records(Some(&path), &records).unwrap();
        assert!(!path.with_extension("jsonl.tmp").exists());
        assert_eq!(load_records(&path).unwrap(), records);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_records(&dir.path().join("absent.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_load_skips_corrupt_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{}", serde_json::to_string(&sample("a.jpg")).unwrap()).unwrap();
        writeln!(f).unwrap();
        writeln!(f, "this is not valid json at all").unwrap();
        writeln!(f, "{}", serde_json::to_string(&sample("b.jpg")).unwrap()).unwrap();

        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].relative_path, "b.jpg");
    }
}

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

/// Ground-truth volumes of one study, in millilitres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volumes {
    pub diastole: f64,
    pub systole: f64,
}

impl Volumes {
    pub fn as_array(&self) -> [f64; 2] {
        [self.diastole, self.systole]
    }
}

/// Read the label table.
///
/// CSV layout: a header row, then `study_id, diastole, systole` and any
/// number of trailing columns, which are ignored.
pub fn read_labels(path: &Path) -> Result<BTreeMap<u32, Volumes>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut labels = BTreeMap::new();

    for result in reader.records() {
        let record = result.with_context(|| format!("reading {}", path.display()))?;
        let line = record.position().map_or(0, |p| p.line());
        if record.len() < 3 {
            bail!("label line {line}: expected at least 3 columns, got {}", record.len());
        }

        let field = |idx: usize| record.get(idx).unwrap_or("");
        let study: u32 = field(0)
            .parse()
            .with_context(|| format!("label line {line}: '{}' is not a study id", field(0)))?;
        let volume = |idx: usize| -> Result<f64> {
            let value: f64 = field(idx)
                .parse()
                .with_context(|| format!("label line {line}: '{}' is not a volume", field(idx)))?;
            ensure!(value.is_finite(), "label line {line}: volume '{}' is not finite", field(idx));
            Ok(value)
        };
        let volumes = Volumes {
            diastole: volume(1)?,
            systole: volume(2)?,
        };

        if labels.insert(study, volumes).is_some() {
            log::warn!("study {study} is labelled twice, keeping line {line}");
        }
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn labels_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_volumes_and_ignores_extra_columns() {
        let file = labels_file("Id,Diastole,Systole\n1,261.0,95.0\n2,185.0,84.5,12.0,9.0\n");
        let labels = read_labels(file.path()).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[&1].as_array(), [261.0, 95.0]);
        assert_eq!(labels[&2], Volumes { diastole: 185.0, systole: 84.5 });
    }

    #[test]
    fn rejects_short_rows() {
        let file = labels_file("Id,Diastole,Systole\n1,261.0\n");
        assert!(read_labels(file.path()).is_err());
    }

    #[test]
    fn rejects_non_numeric_ids() {
        let file = labels_file("Id,Diastole,Systole\nabc,1.0,2.0\n");
        let err = read_labels(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("not a study id"));
    }

    #[test]
    fn errors_name_the_csv_line() {
        let file = labels_file("Id,Diastole,Systole\n1,261.0,95.0\n2,oops,84.5\n");
        let err = read_labels(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("label line 3"), "{err:#}");
    }

    #[test]
    fn rejects_non_finite_volumes() {
        for bad in ["NaN", "inf", "-inf"] {
            let file = labels_file(&format!("Id,Diastole,Systole\n1,{bad},95.0\n"));
            let err = read_labels(file.path()).unwrap_err();
            assert!(format!("{err:#}").contains("not finite"), "{err:#}");
        }
    }
}

//! Predictive scaling model: learned per-precinct relevance

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};

/// Relevance in `[0, 1]` of individual precincts
///
/// Read from a headerless two-column `identifier,value` file. When loaded, it
/// replaces the overlap penalty for the precincts it names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalingModel {
    values: HashMap<u64, f64>,
}

impl ScalingModel {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        let model = Self::from_csv(reader)?;
        info!(path = %path.as_ref().display(), precincts = model.len(), "Loaded scaling model");
        Ok(model)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(reader);
        Self::from_csv(reader)
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut values = HashMap::new();
        for record in reader.deserialize() {
            let (id, value): (u64, f64) = record?;
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidScalingModel(format!(
                    "value {} for precinct {} outside [0, 1]",
                    value, id
                )));
            }
            values.insert(id, value);
        }
        Ok(Self { values })
    }

    pub fn value(&self, id: u64) -> Option<f64> {
        self.values.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse() {
        let model = ScalingModel::from_reader("0,0.5\n7, 1\n12,0\n".as_bytes()).unwrap();
        assert_eq!(model.len(), 3);
        assert_eq!(model.value(7), Some(1.0));
        assert_eq!(model.value(12), Some(0.0));
        assert_eq!(model.value(3), None);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = ScalingModel::from_reader("1,1.5\n".as_bytes()).unwrap_err();
        assert!(matches!(err, Error::InvalidScalingModel(_)));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(matches!(
            ScalingModel::from_reader("1;0.5\n".as_bytes()),
            Err(Error::Csv(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "4,0.25").unwrap();
        let model = ScalingModel::from_file(file.path()).unwrap();
        assert_eq!(model.value(4), Some(0.25));
    }
}

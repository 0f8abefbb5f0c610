//! Department enrichment lookup
//!
//! A static `department_name -> department_code` table read from CSV once per
//! process. Names missing from the table map to [`UNKNOWN_DEPARTMENT_CODE`].

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Code given to departments the lookup does not know
pub const UNKNOWN_DEPARTMENT_CODE: &str = "UNKNOWN";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("failed to read lookup file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("lookup file {0} has no rows")]
    Empty(PathBuf),
}

#[derive(Debug, Deserialize)]
struct LookupRow {
    department_name: String,
    department_code: String,
}

/// Department name to code mapping
#[derive(Debug, Clone, Default)]
pub struct DepartmentLookup {
    codes: HashMap<String, String>,
}

impl DepartmentLookup {
    /// Load the table from a CSV file with `department_name,department_code`
    /// headers; an unreadable or empty file is an error
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let read_err = |source| LookupError::Read {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(read_err)?;

        let mut codes = HashMap::new();
        for row in reader.deserialize::<LookupRow>() {
            let row = row.map_err(read_err)?;
            codes.insert(row.department_name, row.department_code);
        }

        if codes.is_empty() {
            return Err(LookupError::Empty(path.to_path_buf()));
        }

        info!(path = %path.display(), departments = codes.len(), "Department lookup loaded");
        Ok(Self { codes })
    }

    pub fn code_for(&self, department: &str) -> &str {
        self.codes
            .get(department)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_DEPARTMENT_CODE)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DepartmentLookup {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            codes: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_and_unknown_departments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("departments.csv");
        std::fs::write(
            &path,
            "department_name,department_code\nSales,SAL\nEngineering, ENG\n",
        )
        .unwrap();

        let lookup = DepartmentLookup::from_csv_path(&path).unwrap();
        assert_eq!(lookup.len(), 2);
        assert_eq!(lookup.code_for("Sales"), "SAL");
        assert_eq!(lookup.code_for("Engineering"), "ENG");
        assert_eq!(lookup.code_for("Ghost"), UNKNOWN_DEPARTMENT_CODE);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = DepartmentLookup::from_csv_path("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, LookupError::Read { .. }));
    }

    #[test]
    fn test_header_only_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("departments.csv");
        std::fs::write(&path, "department_name,department_code\n").unwrap();

        let err = DepartmentLookup::from_csv_path(&path).unwrap_err();
        assert!(matches!(err, LookupError::Empty(_)));
    }

    #[test]
    fn test_wrong_headers_fail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("departments.csv");
        std::fs::write(&path, "name,code\nSales,SAL\n").unwrap();

        assert!(DepartmentLookup::from_csv_path(&path).is_err());
    }
}

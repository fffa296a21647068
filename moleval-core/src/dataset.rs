//! Reference dataset: test, scaffold-test and train SMILES plus two opaque
//! precomputed statistics bundles. Loaded once per process and shared.

use crate::config::DatasetConfig;
use crate::error::EvalError;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;

/// Serialized statistics the scorer compares distributions against.
///
/// The bytes are never interpreted here, only fingerprinted and forwarded.
#[derive(Clone)]
pub struct StatsBundle {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub sha256: String,
}

impl StatsBundle {
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        Self {
            path: path.into(),
            bytes,
            sha256,
        }
    }

    pub fn load(path: &Path) -> Result<Self, EvalError> {
        let bytes = std::fs::read(path).map_err(|e| {
            EvalError::dataset(format!("cannot read stats bundle '{}': {e}", path.display()))
        })?;
        Ok(Self::from_bytes(path, bytes))
    }
}

impl fmt::Debug for StatsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsBundle")
            .field("path", &self.path)
            .field("len", &self.bytes.len())
            .field("sha256", &self.sha256)
            .finish()
    }
}

/// Immutable reference data shared read-only across evaluations.
#[derive(Debug, Clone)]
pub struct ReferenceDataset {
    pub test: Vec<String>,
    pub test_scaffolds: Vec<String>,
    pub train: Vec<String>,
    pub test_stats: StatsBundle,
    pub test_scaffold_stats: StatsBundle,
    fingerprint: String,
}

impl ReferenceDataset {
    pub fn from_parts(
        test: Vec<String>,
        test_scaffolds: Vec<String>,
        train: Vec<String>,
        test_stats: StatsBundle,
        test_scaffold_stats: StatsBundle,
    ) -> Self {
        let mut hasher = Sha256::new();
        for (tag, set) in [
            ("test", &test),
            ("test_scaffolds", &test_scaffolds),
            ("train", &train),
        ] {
            hasher.update(tag.as_bytes());
            hasher.update((set.len() as u64).to_le_bytes());
            for smiles in set {
                hasher.update(smiles.as_bytes());
                hasher.update(b"\n");
            }
        }
        hasher.update(test_stats.sha256.as_bytes());
        hasher.update(test_scaffold_stats.sha256.as_bytes());
        let fingerprint = format!("{:x}", hasher.finalize());

        Self {
            test,
            test_scaffolds,
            train,
            test_stats,
            test_scaffold_stats,
            fingerprint,
        }
    }

    /// Read every configured file.
    pub fn load(paths: &DatasetConfig) -> Result<Self, EvalError> {
        let test = read_smiles_column(&paths.test)?;
        let test_scaffolds = read_smiles_column(&paths.test_scaffolds)?;
        let train = read_smiles_column(&paths.train)?;
        let test_stats = StatsBundle::load(&paths.test_stats)?;
        let test_scaffold_stats = StatsBundle::load(&paths.test_scaffold_stats)?;

        let dataset = Self::from_parts(test, test_scaffolds, train, test_stats, test_scaffold_stats);
        info!(
            test = dataset.test.len(),
            test_scaffolds = dataset.test_scaffolds.len(),
            train = dataset.train.len(),
            fingerprint = %dataset.short_fingerprint(),
            "Loaded reference dataset"
        );
        Ok(dataset)
    }

    /// SHA-256 over all five inputs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..12]
    }
}

/// Read the first column of a (optionally gzip-compressed) CSV with a header.
///
/// Blank values are skipped.
pub fn read_smiles_column(path: &Path) -> Result<Vec<String>, EvalError> {
    let file = File::open(path)
        .map_err(|e| EvalError::dataset(format!("cannot open '{}': {e}", path.display())))?;
    let reader: Box<dyn Read> = if is_gzip(path) {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut smiles = Vec::new();
    for record in rdr.records() {
        let record = record
            .map_err(|e| EvalError::dataset(format!("malformed row in '{}': {e}", path.display())))?;
        if let Some(value) = record.get(0).map(str::trim).filter(|v| !v.is_empty()) {
            smiles.push(value.to_string());
        }
    }

    if smiles.is_empty() {
        return Err(EvalError::dataset(format!(
            "'{}' contains no molecules",
            path.display()
        )));
    }
    Ok(smiles)
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

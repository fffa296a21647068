//! Tabular view over persisted metrics artifacts.

use crate::artifact::MetricsArtifact;
use crate::checkpoint::CheckpointId;
use crate::error::EvalError;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::Write;

/// One row per checkpoint, one column per scalar metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsTable {
    pub columns: Vec<String>,
    pub rows: Vec<MetricsRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRow {
    pub id: CheckpointId,
    pub values: Vec<Option<f64>>,
}

impl MetricsTable {
    /// Columns are the sorted union of numeric metric names. Structured
    /// values are left out.
    pub fn from_artifacts(artifacts: &[MetricsArtifact]) -> Self {
        let columns: Vec<String> = artifacts
            .iter()
            .flat_map(|a| a.metrics.iter())
            .filter(|(_, v)| v.is_number())
            .map(|(k, _)| k.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let rows = artifacts
            .iter()
            .map(|a| MetricsRow {
                id: a.id(),
                values: columns
                    .iter()
                    .map(|c| a.metrics.get(c).and_then(|v| v.as_f64()))
                    .collect(),
            })
            .collect();

        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Aligned plain-text rendering.
    pub fn render(&self) -> String {
        let mut header = vec!["model".to_string(), "checkpoint".to_string()];
        header.extend(self.columns.iter().cloned());

        let body: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                let mut cells = vec![row.id.model_name.clone(), row.id.index.to_string()];
                cells.extend(row.values.iter().map(|v| match v {
                    Some(x) => format!("{x:.4}"),
                    None => "-".to_string(),
                }));
                cells
            })
            .collect();

        let widths: Vec<usize> = (0..header.len())
            .map(|i| {
                body.iter()
                    .map(|r| r[i].len())
                    .chain(std::iter::once(header[i].len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = String::new();
        for line in std::iter::once(&header).chain(body.iter()) {
            let cells: Vec<String> = line
                .iter()
                .zip(&widths)
                .map(|(cell, w)| format!("{cell:<w$}"))
                .collect();
            let _ = writeln!(out, "{}", cells.join("  ").trim_end());
        }
        out
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), EvalError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec!["model", "checkpoint"];
        header.extend(self.columns.iter().map(String::as_str));
        wtr.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![row.id.model_name.clone(), row.id.index.to_string()];
            record.extend(
                row.values
                    .iter()
                    .map(|v| v.map(|x| x.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::EvaluationProvenance;
    use crate::collaborators::MetricsMap;
    use crate::device::Device;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;

    fn artifact(model: &str, index: u64, metrics: serde_json::Value) -> MetricsArtifact {
        let metrics: MetricsMap = serde_json::from_value(metrics).unwrap();
        MetricsArtifact {
            model_name: model.into(),
            checkpoint_index: index,
            metrics,
            provenance: EvaluationProvenance {
                checkpoint_path: PathBuf::from("x"),
                device: Device::Cpu,
                n_jobs: 1,
                seed: 0,
                batch_size: 1,
                n_batches: 1,
                sample_size: 1,
                reference_fingerprint: String::new(),
                evaluated_at: Utc::now(),
                duration_secs: 0.0,
            },
        }
    }

    fn table() -> MetricsTable {
        MetricsTable::from_artifacts(&[
            artifact("m1", 10, json!({"valid": 0.5, "FCD/Test": 2.0, "hist": [1, 2]})),
            artifact("m2", 5, json!({"valid": 1.0})),
        ])
    }

    #[test]
    fn test_columns_are_numeric_union() {
        let t = table();
        assert_eq!(t.columns, vec!["FCD/Test", "valid"]);
        assert_eq!(t.rows[0].values, vec![Some(2.0), Some(0.5)]);
        assert_eq!(t.rows[1].values, vec![None, Some(1.0)]);
    }

    #[test]
    fn test_render() {
        let text = table().render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "model  checkpoint  FCD/Test  valid");
        assert_eq!(lines[1], "m1     10          2.0000    0.5000");
        assert_eq!(lines[2], "m2     5           -         1.0000");
    }

    #[test]
    fn test_csv() {
        let mut buf = Vec::new();
        table().write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "model,checkpoint,FCD/Test,valid\nm1,10,2,0.5\nm2,5,,1\n");
    }
}

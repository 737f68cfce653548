//! Model file codec.
//!
//! One file, three JSON documents in fixed order: data store, scoring-engine
//! state, decision-engine state. Saving goes through a temp file in the target
//! directory that is renamed over the target only after everything was written
//! and synced.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::decision::DecisionEngine;
use crate::error::{RecoError, Result};
use crate::model::{DataDelta, DataStore, Delta, Snapshot, SnapshotDelta};
use crate::scoring::ScoringEngine;

pub(crate) fn write_model(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let scoring = snapshot.scoring.state()?;
    let decision = snapshot.decision.state()?;

    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut out = BufWriter::new(tmp.as_file());
        serde_json::to_writer(&mut out, &snapshot.data)?;
        out.write_all(b"\n")?;
        serde_json::to_writer(&mut out, &scoring)?;
        out.write_all(b"\n")?;
        serde_json::to_writer(&mut out, &decision)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| RecoError::Persistence(format!("{}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Read a model file into a fresh snapshot built from `scoring`/`decision`
/// (engines carrying configuration only).
pub(crate) fn read_model(
    path: &Path,
    scoring: ScoringEngine,
    decision: DecisionEngine,
) -> Result<Snapshot> {
    let file = File::open(path)
        .map_err(|e| RecoError::Persistence(format!("{}: {e}", path.display())))?;
    let mut docs = serde_json::Deserializer::from_reader(BufReader::new(file)).into_iter::<Value>();
    let mut next = |section: &str| -> Result<Value> {
        match docs.next() {
            Some(doc) => Ok(doc?),
            None => Err(RecoError::Persistence(format!(
                "{}: missing {section} section",
                path.display()
            ))),
        }
    };

    let data: DataStore = section(next("data")?, "data", path)?;
    let scoring_state = next("scoring")?;
    let decision_state = next("decision")?;

    let mut snapshot = Snapshot::empty(scoring, decision);
    let delta = SnapshotDelta {
        data: DataDelta::Replace(Box::new(data)),
        scoring: snapshot.scoring.restore(scoring_state)?,
        decision: snapshot.decision.restore(decision_state)?,
    };
    delta.commit(&mut snapshot)?;
    Ok(snapshot)
}

fn section<T: DeserializeOwned>(value: Value, name: &str, path: &Path) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        RecoError::Persistence(format!("{}: invalid {name} section: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionConfig;
    use crate::model::{Batch, Event, Product, ProductChanges};
    use crate::scoring::ScoringConfig;

    fn engines() -> (ScoringEngine, DecisionEngine) {
        (
            ScoringEngine::from_config(&ScoringConfig::default()),
            DecisionEngine::from_config(&DecisionConfig::default()),
        )
    }

    fn populated() -> Snapshot {
        let (scoring, decision) = engines();
        let mut snap = Snapshot::empty(scoring, decision);
        let batch = Batch::new(vec![Event::new(1, 7, "view"), Event::new(2, 7, "cart")])
            .with_products(ProductChanges {
                upserted: vec![Product::new(7, "lamp"), Product::new(8, "desk")],
                removed: vec![],
            });
        snap.prepare_incremental(&batch).commit(&mut snap).unwrap();
        snap
    }

    #[test]
    fn written_model_reads_back_equal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let snap = populated();
        write_model(&path, &snap).unwrap();

        let (scoring, decision) = engines();
        let loaded = read_model(&path, scoring, decision).unwrap();
        assert_eq!(loaded.data, snap.data);
        assert_eq!(loaded.scoring, snap.scoring);
        assert_eq!(loaded.decision, snap.decision);
    }

    #[test]
    fn truncated_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        write_model(&path, &populated()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let first_doc = text.lines().next().unwrap();
        std::fs::write(&path, format!("{first_doc}\n")).unwrap();

        let (scoring, decision) = engines();
        let err = read_model(&path, scoring, decision).unwrap_err();
        assert!(matches!(err, RecoError::Persistence(_)));
    }

    #[test]
    fn failed_persist_leaves_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), "x").unwrap();

        assert!(write_model(&target, &populated()).is_err());
        assert!(target.join("keep").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != target)
            .collect();
        assert!(leftovers.is_empty());
    }
}

//! Saving and restoring the ledger across sessions

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{PrecinctEntry, PrecinctLedger};
use crate::codestream::PrecinctAddress;
use crate::error::{Error, Result};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct LedgerSnapshot {
    version: u32,
    entries: Vec<SavedEntry>,
}

#[derive(Serialize, Deserialize)]
struct SavedEntry {
    id: u64,
    address: Option<PrecinctAddress>,
    start_layer: u32,
    end_layer: u32,
    delivered_layers: u32,
    bytes_received: u64,
    data: Vec<u8>,
}

impl PrecinctLedger {
    /// Writes every entry to a gzip-compressed JSON file
    ///
    /// Returns the number of saved precincts.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let mut entries: Vec<SavedEntry> = self
            .entries
            .iter()
            .map(|e| SavedEntry {
                id: *e.key(),
                address: e.address,
                start_layer: e.start_layer,
                end_layer: e.end_layer,
                delivered_layers: e.delivered_layers,
                bytes_received: e.bytes_received,
                data: e.data.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        let count = entries.len();

        let file = File::create(path.as_ref())?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(
            &mut encoder,
            &LedgerSnapshot {
                version: SNAPSHOT_VERSION,
                entries,
            },
        )?;
        encoder.finish()?.flush()?;

        info!(path = %path.as_ref().display(), precincts = count, "Saved precinct cache");
        Ok(count)
    }

    /// Merges a file written by [`PrecinctLedger::save`]
    ///
    /// Entries already holding at least as many layers are kept. Returns the
    /// number of precincts taken from the file.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let file = File::open(path.as_ref())?;
        let snapshot: LedgerSnapshot =
            serde_json::from_reader(GzDecoder::new(BufReader::new(file)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Config(format!(
                "unsupported cache file version {}",
                snapshot.version
            )));
        }

        let mut restored = 0;
        for saved in snapshot.entries {
            let entry = PrecinctEntry {
                address: saved.address,
                start_layer: saved.start_layer,
                end_layer: saved.end_layer.max(saved.delivered_layers),
                delivered_layers: saved.delivered_layers,
                bytes_received: saved.bytes_received,
                data: saved.data,
                last_access: 0,
            };
            if self.merge_entry(saved.id, entry) {
                restored += 1;
            }
        }

        info!(path = %path.as_ref().display(), precincts = restored, "Loaded precinct cache");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.gz");

        let ledger = PrecinctLedger::new();
        ledger.record_segment(1, 1, &[1, 2, 3]);
        ledger.record_segment(1, 2, &[4]);
        ledger.record_segment(9, 3, &[5, 6]);
        assert_eq!(ledger.save(&path).unwrap(), 2);

        let restored = PrecinctLedger::new();
        assert_eq!(restored.load(&path).unwrap(), 2);
        for id in ledger.ids() {
            assert_eq!(restored.delivered_layers(id), ledger.delivered_layers(id));
        }
        assert_eq!(restored.payload(1).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(restored.total_bytes(), ledger.total_bytes());
    }

    #[test]
    fn test_load_keeps_richer_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.gz");

        let saved = PrecinctLedger::new();
        saved.record_segment(4, 1, &[1]);
        saved.save(&path).unwrap();

        let live = PrecinctLedger::new();
        live.record_segment(4, 3, &[7, 7, 7]);
        assert_eq!(live.load(&path).unwrap(), 0);
        assert_eq!(live.delivered_layers(4), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let ledger = PrecinctLedger::new();
        assert!(matches!(ledger.load("/nonexistent/ledger.gz"), Err(Error::Io(_))));
    }

    #[test]
    fn test_load_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.gz");
        std::fs::write(&path, b"plain text").unwrap();
        let ledger = PrecinctLedger::new();
        assert!(ledger.load(&path).is_err());
    }
}

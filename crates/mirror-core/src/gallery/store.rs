//! SQLite persistence for the gallery.
//!
//! One file per store key. Embeddings are stored as little-endian `f32` blobs
//! so a save/load cycle reproduces every value bit for bit.

use super::Snapshot;
use crate::types::GalleryRecord;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the gallery store inside the store key directory.
pub const GALLERY_FILE: &str = "gallery.db";

const FORMAT_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS gallery_meta (
        id             INTEGER PRIMARY KEY CHECK (id = 0),
        format_version INTEGER NOT NULL,
        dimension      INTEGER,
        next_index     INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS gallery_records (
        idx       INTEGER PRIMARY KEY,
        label     TEXT NOT NULL,
        embedding BLOB NOT NULL
    );
";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("no gallery store at {0}")]
    Missing(PathBuf),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {index} has {actual} values, store dimension is {expected}")]
    DimensionMismatch {
        index: i64,
        expected: usize,
        actual: usize,
    },
    #[error("corrupt gallery store: {0}")]
    Corrupt(String),
}

/// Location of the gallery file for a store key.
pub fn store_path(store_key: &Path) -> PathBuf {
    store_key.join(GALLERY_FILE)
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(index: i64, bytes: &[u8]) -> Result<Vec<f32>, PersistError> {
    if bytes.len() % 4 != 0 {
        return Err(PersistError::Corrupt(format!(
            "record {index}: embedding blob of {} bytes is not a whole number of f32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Write `snapshot` to `path`, replacing any previous contents in one transaction.
pub(crate) fn write(path: &Path, snapshot: &Snapshot) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM gallery_records", [])?;
    tx.execute("DELETE FROM gallery_meta", [])?;
    tx.execute(
        "INSERT INTO gallery_meta (id, format_version, dimension, next_index) VALUES (0, ?1, ?2, ?3)",
        params![
            FORMAT_VERSION,
            snapshot.dimension.map(|d| d as i64),
            snapshot.next_index
        ],
    )?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO gallery_records (idx, label, embedding) VALUES (?1, ?2, ?3)")?;
        for record in &snapshot.records {
            stmt.execute(params![
                record.index,
                record.label,
                encode_embedding(&record.embedding)
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Read and fully validate the store at `path`.
pub(crate) fn read(path: &Path) -> Result<Snapshot, PersistError> {
    if !path.exists() {
        return Err(PersistError::Missing(path.to_path_buf()));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let (version, dimension, next_index): (i64, Option<i64>, i64) = conn
        .query_row(
            "SELECT format_version, dimension, next_index FROM gallery_meta WHERE id = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| PersistError::Corrupt("missing metadata row".into()))?;

    if version != FORMAT_VERSION {
        return Err(PersistError::Corrupt(format!(
            "unsupported format version {version}"
        )));
    }
    if next_index < 0 {
        return Err(PersistError::Corrupt(format!("negative next index {next_index}")));
    }
    if next_index == i64::MAX {
        return Err(PersistError::Corrupt("next index leaves no room for inserts".into()));
    }
    let dimension = match dimension {
        Some(d) if d <= 0 => {
            return Err(PersistError::Corrupt(format!("invalid dimension {d}")));
        }
        Some(d) => Some(d as usize),
        None => None,
    };

    let mut stmt = conn.prepare("SELECT idx, label, embedding FROM gallery_records ORDER BY idx")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (index, label, blob) = row?;
        if index < 0 || index >= next_index {
            return Err(PersistError::Corrupt(format!(
                "record index {index} outside [0, {next_index})"
            )));
        }
        let embedding = decode_embedding(index, &blob)?;
        let expected = dimension.ok_or_else(|| {
            PersistError::Corrupt("records present but no dimension stored".into())
        })?;
        if embedding.len() != expected {
            return Err(PersistError::DimensionMismatch {
                index,
                expected,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(PersistError::Corrupt(format!(
                "record {index}: non-finite embedding value"
            )));
        }
        records.push(GalleryRecord {
            index,
            label,
            embedding,
        });
    }

    Ok(Snapshot {
        dimension,
        next_index,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{Gallery, GalleryError};

    fn populated() -> Gallery {
        let gallery = Gallery::new();
        gallery.insert(&[0.1, -0.25, 3.5e-7], "alice").unwrap();
        gallery.insert(&[1.0, 2.0, 3.0], "bob").unwrap();
        gallery.insert(&[f32::MIN_POSITIVE, -0.0, 12345.678], "carol").unwrap();
        gallery.delete(1).unwrap();
        gallery
    }

    #[test]
    fn test_embedding_blob_roundtrip_is_bit_exact() {
        let values = [0.1f32, -0.0, f32::MAX, f32::MIN_POSITIVE, 1.0 / 3.0];
        let decoded = decode_embedding(0, &encode_embedding(&values)).unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&decoded), bits(&values));
    }

    #[test]
    fn test_decode_rejects_partial_float() {
        assert!(matches!(
            decode_embedding(3, &[0, 0, 128]),
            Err(PersistError::Corrupt(_))
        ));
    }

    #[test]
    fn test_save_then_load_reproduces_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let original = populated();
        original.save(dir.path()).unwrap();

        let restored = Gallery::new();
        restored.load(dir.path()).unwrap();

        assert_eq!(restored.records(), original.records());
        assert_eq!(restored.next_index(), 3);
        assert_eq!(restored.dimension(), Some(3));
        for (a, b) in restored.records().iter().zip(original.records().iter()) {
            let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&a.embedding), bits(&b.embedding));
        }

        // The counter survives: the next insert does not reuse a deleted index.
        assert_eq!(restored.insert(&[0.0, 0.0, 1.0], "dave").unwrap(), 3);
    }

    #[test]
    fn test_save_overwrites_previous_store() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = populated();
        gallery.save(dir.path()).unwrap();
        gallery.delete(0).unwrap();
        gallery.save(dir.path()).unwrap();

        let restored = Gallery::new();
        restored.load(dir.path()).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.records()[0].label, "carol");
    }

    #[test]
    fn test_empty_gallery_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        Gallery::new().save(dir.path()).unwrap();

        let restored = populated();
        restored.load(dir.path()).unwrap();
        assert!(restored.is_empty());
        assert_eq!(restored.dimension(), None);
        assert_eq!(restored.next_index(), 0);
    }

    #[test]
    fn test_save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("models").join("v1");
        populated().save(&nested).unwrap();
        assert!(store_path(&nested).exists());
    }

    #[test]
    fn test_load_missing_store_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = populated();
        let before = gallery.records();

        let err = gallery.load(dir.path()).unwrap_err();
        assert!(matches!(err, GalleryError::Persistence(PersistError::Missing(_))));
        assert_eq!(gallery.records(), before);
        assert_eq!(gallery.next_index(), 3);
    }

    #[test]
    fn test_load_rejects_dimension_violation_atomically() {
        let dir = tempfile::tempdir().unwrap();
        populated().save(dir.path()).unwrap();

        // Corrupt one record with a 2-value embedding.
        let conn = Connection::open(store_path(dir.path())).unwrap();
        conn.execute(
            "UPDATE gallery_records SET embedding = ?1 WHERE idx = 2",
            params![encode_embedding(&[1.0, 2.0])],
        )
        .unwrap();
        drop(conn);

        let gallery = Gallery::new();
        gallery.insert(&[9.0; 5], "keep").unwrap();
        let err = gallery.load(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            GalleryError::Persistence(PersistError::DimensionMismatch {
                index: 2,
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.dimension(), Some(5));
        assert_eq!(gallery.records()[0].label, "keep");
    }

    #[test]
    fn test_load_rejects_index_beyond_counter() {
        let dir = tempfile::tempdir().unwrap();
        populated().save(dir.path()).unwrap();

        let conn = Connection::open(store_path(dir.path())).unwrap();
        conn.execute("UPDATE gallery_meta SET next_index = 1", []).unwrap();
        drop(conn);

        let gallery = Gallery::new();
        assert!(matches!(
            gallery.load(dir.path()),
            Err(GalleryError::Persistence(PersistError::Corrupt(_)))
        ));
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_load_rejects_exhausted_counter() {
        let dir = tempfile::tempdir().unwrap();
        populated().save(dir.path()).unwrap();

        let conn = Connection::open(store_path(dir.path())).unwrap();
        conn.execute("UPDATE gallery_meta SET next_index = ?1", params![i64::MAX])
            .unwrap();
        drop(conn);

        let gallery = Gallery::new();
        gallery.insert(&[9.0; 5], "keep").unwrap();
        assert!(matches!(
            gallery.load(dir.path()),
            Err(GalleryError::Persistence(PersistError::Corrupt(_)))
        ));
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.next_index(), 1);
        assert_eq!(gallery.insert(&[1.0; 5], "next").unwrap(), 1);
    }

    #[test]
    fn test_load_rejects_non_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(store_path(dir.path()), b"definitely not a database file").unwrap();

        let gallery = populated();
        assert!(gallery.load(dir.path()).is_err());
        assert_eq!(gallery.len(), 2);
    }
}

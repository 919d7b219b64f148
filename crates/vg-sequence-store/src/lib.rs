//! Durable per-session sequence counter store (C4).
//!
//! A write-through mapping `session_id -> (next_sent_seq, next_recv_seq,
//! uuid)`. Every update is appended to `sequence_log` before
//! `session_state` (the current snapshot) is overwritten, so a crash between
//! the two leaves the log as the source of truth on next open. `compact`
//! trims the log back down once it has grown past a multiple of the live
//! session count; it never touches `session_state`.
//!
//! Grounded on `forwarder::storage::journal::Journal`: same
//! open/pragma/integrity-check shape, same append-then-mirror durability
//! pattern, re-purposed from read-event replay to sequence-counter recovery.

use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequenceStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("refused: session {0} is connected")]
    SessionConnected(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Log rows are compacted once they exceed `live_sessions * COMPACT_LOG_MULTIPLIER`.
pub const COMPACT_LOG_MULTIPLIER: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSnapshot {
    pub next_sent_seq: u64,
    pub next_recv_seq: u64,
    pub uuid: u64,
}

pub struct SequenceStore {
    conn: Connection,
}

impl SequenceStore {
    /// Open (or create) the store at `path`. Applies durability pragmas and
    /// runs `PRAGMA integrity_check` before the schema is created.
    pub fn open(path: &Path) -> Result<Self, SequenceStoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(SequenceStore { conn })
    }

    /// In-memory store for tests; no durability, same schema.
    pub fn open_in_memory() -> Result<Self, SequenceStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(SequenceStore { conn })
    }

    /// Create the session's counters if absent. A fresh connection's `uuid`
    /// is the caller-supplied value (spec §4.3: `epoch_nanos_at_connect` for
    /// iLink3); re-establishment passes the prior `uuid` instead.
    pub fn ensure_session(
        &mut self,
        session_id: &str,
        initial_uuid: u64,
    ) -> Result<SequenceSnapshot, SequenceStoreError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM session_state WHERE session_id = ?1)",
            params![session_id],
            |row| row.get(0),
        )?;
        if !exists {
            self.write_through(session_id, 1, 1, initial_uuid)?;
        }
        self.get(session_id)?.ok_or_else(|| SequenceStoreError::UnknownSession(session_id.to_owned()))
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SequenceSnapshot>, SequenceStoreError> {
        let row = self.conn.query_row(
            "SELECT next_sent_seq, next_recv_seq, uuid FROM session_state WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(SequenceSnapshot {
                    next_sent_seq: row.get::<_, i64>(0)? as u64,
                    next_recv_seq: row.get::<_, i64>(1)? as u64,
                    uuid: row.get::<_, i64>(2)? as u64,
                })
            },
        );
        match row {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record that `seq` was just sent on `session_id`; persists
    /// `next_sent_seq = seq + 1`.
    pub fn record_sent(&mut self, session_id: &str, seq: u64) -> Result<(), SequenceStoreError> {
        let current = self.current_or_unknown(session_id)?;
        self.write_through(session_id, seq + 1, current.next_recv_seq, current.uuid)
    }

    /// Record that `seq` was just received on `session_id`; persists
    /// `next_recv_seq = seq + 1`.
    pub fn record_received(&mut self, session_id: &str, seq: u64) -> Result<(), SequenceStoreError> {
        let current = self.current_or_unknown(session_id)?;
        self.write_through(session_id, current.next_sent_seq, seq + 1, current.uuid)
    }

    pub fn set_uuid(&mut self, session_id: &str, uuid: u64) -> Result<(), SequenceStoreError> {
        let current = self.current_or_unknown(session_id)?;
        self.write_through(session_id, current.next_sent_seq, current.next_recv_seq, uuid)
    }

    /// Reset both counters to 1 (spec §4.2). Caller (the Framer) is
    /// responsible for refusing this while the session is connected.
    pub fn reset_sequence_number(&mut self, session_id: &str) -> Result<(), SequenceStoreError> {
        let current = self.current_or_unknown(session_id)?;
        self.write_through(session_id, 1, 1, current.uuid)
    }

    /// Atomically copy the current snapshot of every session to
    /// `backup_location` (if given), then clear the store (spec §4.2).
    /// Caller refuses this while any session is connected.
    pub fn reset_session_ids(&mut self, backup_location: Option<&Path>) -> Result<(), SequenceStoreError> {
        let tx = self.conn.transaction()?;
        if let Some(dest) = backup_location {
            tx.execute("VACUUM INTO ?1", params![dest.to_string_lossy()])?;
        }
        tx.execute("DELETE FROM session_state", [])?;
        tx.execute("DELETE FROM sequence_log", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Number of rows presently in the append-only log, for deciding when
    /// to compact.
    pub fn log_len(&self) -> Result<i64, SequenceStoreError> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM sequence_log", [], |row| row.get(0))?)
    }

    /// Trim `sequence_log` down to nothing once its length exceeds
    /// `live_sessions * COMPACT_LOG_MULTIPLIER`; `session_state` already
    /// holds the authoritative current snapshot, so the log rows before
    /// that point carry no information the next open needs.
    pub fn compact_if_needed(&mut self, live_sessions: i64) -> Result<bool, SequenceStoreError> {
        let threshold = live_sessions.max(1) * COMPACT_LOG_MULTIPLIER;
        if self.log_len()? <= threshold {
            return Ok(false);
        }
        self.conn.execute("DELETE FROM sequence_log", [])?;
        tracing::debug!(live_sessions, threshold, "compacted sequence log");
        Ok(true)
    }

    fn current_or_unknown(&self, session_id: &str) -> Result<SequenceSnapshot, SequenceStoreError> {
        self.get(session_id)?.ok_or_else(|| SequenceStoreError::UnknownSession(session_id.to_owned()))
    }

    fn write_through(
        &mut self,
        session_id: &str,
        next_sent_seq: u64,
        next_recv_seq: u64,
        uuid: u64,
    ) -> Result<(), SequenceStoreError> {
        let now = now_iso8601();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO sequence_log (session_id, next_sent_seq, next_recv_seq, uuid, written_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, next_sent_seq as i64, next_recv_seq as i64, uuid as i64, now],
        )?;
        tx.execute(
            "INSERT INTO session_state (session_id, next_sent_seq, next_recv_seq, uuid, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                 next_sent_seq = excluded.next_sent_seq,
                 next_recv_seq = excluded.next_recv_seq,
                 uuid = excluded.uuid,
                 updated_at = excluded.updated_at",
            params![session_id, next_sent_seq as i64, next_recv_seq as i64, uuid as i64, now],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), SequenceStoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), SequenceStoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(SequenceStoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let (y, mo, d, h, mi, se) = epoch_to_ymdhms(secs);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{se:02}Z")
}

fn epoch_to_ymdhms(secs: u64) -> (u32, u32, u32, u32, u32, u32) {
    let se = (secs % 60) as u32;
    let mins = secs / 60;
    let mi = (mins % 60) as u32;
    let hours = mins / 60;
    let h = (hours % 24) as u32;
    let days = hours / 24;

    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let mo = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if mo <= 2 { y + 1 } else { y } as u32;

    (y, mo, d, h, mi, se)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_session_starts_at_one() {
        let mut store = SequenceStore::open_in_memory().unwrap();
        let snap = store.ensure_session("SESSION-A", 42).unwrap();
        assert_eq!(snap, SequenceSnapshot { next_sent_seq: 1, next_recv_seq: 1, uuid: 42 });
    }

    #[test]
    fn record_sent_and_received_advance_independently() {
        let mut store = SequenceStore::open_in_memory().unwrap();
        store.ensure_session("SESSION-A", 1).unwrap();
        store.record_sent("SESSION-A", 1).unwrap();
        store.record_sent("SESSION-A", 2).unwrap();
        store.record_received("SESSION-A", 1).unwrap();

        let snap = store.get("SESSION-A").unwrap().unwrap();
        assert_eq!(snap.next_sent_seq, 3);
        assert_eq!(snap.next_recv_seq, 2);
    }

    #[test]
    fn reset_sequence_number_resets_both_counters_but_keeps_uuid() {
        let mut store = SequenceStore::open_in_memory().unwrap();
        store.ensure_session("SESSION-A", 99).unwrap();
        store.record_sent("SESSION-A", 5).unwrap();
        store.reset_sequence_number("SESSION-A").unwrap();

        let snap = store.get("SESSION-A").unwrap().unwrap();
        assert_eq!(snap, SequenceSnapshot { next_sent_seq: 1, next_recv_seq: 1, uuid: 99 });
    }

    #[test]
    fn reset_session_ids_clears_every_session() {
        let mut store = SequenceStore::open_in_memory().unwrap();
        store.ensure_session("SESSION-A", 1).unwrap();
        store.ensure_session("SESSION-B", 2).unwrap();
        store.reset_session_ids(None).unwrap();

        assert_eq!(store.get("SESSION-A").unwrap(), None);
        assert_eq!(store.get("SESSION-B").unwrap(), None);
    }

    #[test]
    fn compact_trims_log_past_threshold() {
        let mut store = SequenceStore::open_in_memory().unwrap();
        store.ensure_session("SESSION-A", 1).unwrap();
        for seq in 1..20 {
            store.record_sent("SESSION-A", seq).unwrap();
        }
        assert!(store.log_len().unwrap() > COMPACT_LOG_MULTIPLIER);
        let compacted = store.compact_if_needed(1).unwrap();
        assert!(compacted);
        assert_eq!(store.log_len().unwrap(), 0);
        // session_state survives compaction untouched.
        assert!(store.get("SESSION-A").unwrap().is_some());
    }

    #[test]
    fn unknown_session_errors() {
        let store = SequenceStore::open_in_memory().unwrap();
        let mut store = store;
        let err = store.record_sent("GHOST", 1).unwrap_err();
        assert!(matches!(err, SequenceStoreError::UnknownSession(_)));
    }
}

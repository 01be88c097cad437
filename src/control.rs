//! Checksummed control-record persistence.
//!
//! Generalises the teacher crate's `storage::catalog::CatalogHeader` /
//! `Catalog` dual-segment flip into a small helper any module can use to
//! persist a `bincode`-encodable struct behind a fixed key in a
//! [`KvTable`], with a checksum guarding against partial writes. Used by
//! the database's segment-size control row, the EBM's count/hint row, and
//! the segment table's free-page stacks.

use bincode::{Decode, Encode};

use crate::backend::KvTable;
use crate::error::{Context, Error, Result};

/// Key under which a control record is stored; by convention control rows
/// live at a reserved key (commonly `0`) so ordinary data rows never
/// collide with them.
pub const CONTROL_KEY: &[u8] = b"\0ctrl";

#[derive(Debug, Clone, Encode, Decode)]
struct Envelope {
    checksum: u64,
    payload: Vec<u8>,
}

fn checksum(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, &byte| acc.wrapping_mul(31).wrapping_add(byte as u64))
}

/// Persist `record` to `table` at [`CONTROL_KEY`].
pub fn save<T: Encode>(table: &mut dyn KvTable, record: &T) -> Result<()> {
    let payload = bincode::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| Error::backend(e.to_string(), Context::new()))?;
    let envelope = Envelope { checksum: checksum(&payload), payload };
    let bytes = bincode::encode_to_vec(&envelope, bincode::config::standard())
        .map_err(|e| Error::backend(e.to_string(), Context::new()))?;
    table.put(CONTROL_KEY, &bytes)
}

/// Load a previously-saved control record, or `None` if the table has
/// never been written (a fresh database).
pub fn load<T: Decode<()>>(table: &dyn KvTable) -> Result<Option<T>> {
    let Some(bytes) = table.get(CONTROL_KEY)? else {
        return Ok(None);
    };
    let (envelope, _): (Envelope, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| Error::backend(format!("corrupt control record: {e}"), Context::new()))?;
    if envelope.checksum != checksum(&envelope.payload) {
        return Err(Error::backend(
            format!("control record checksum mismatch: expected {}, got {}", checksum(&envelope.payload), envelope.checksum),
            Context::new(),
        ));
    }
    let (record, _): (T, usize) = bincode::decode_from_slice(&envelope.payload, bincode::config::standard())
        .map_err(|e| Error::backend(format!("corrupt control record payload: {e}"), Context::new()))?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvBackend, memory::MemoryBackend};

    #[derive(Debug, Clone, PartialEq, Encode, Decode)]
    struct Sample {
        a: u32,
        b: Vec<u64>,
    }

    #[test]
    fn save_and_load_round_trips() {
        let mut backend = MemoryBackend::new();
        let mut table = backend.open_table("ctrl").unwrap();
        let record = Sample { a: 7, b: vec![1, 2, 3] };
        save(table.as_mut(), &record).unwrap();
        let loaded: Option<Sample> = load(table.as_ref()).unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn missing_control_record_is_none() {
        let mut backend = MemoryBackend::new();
        let table = backend.open_table("empty").unwrap();
        let loaded: Option<Sample> = load(table.as_ref()).unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut backend = MemoryBackend::new();
        let mut table = backend.open_table("bad").unwrap();
        save(table.as_mut(), &Sample { a: 1, b: vec![] }).unwrap();
        // Tamper with the stored bytes directly.
        let mut bytes = table.get(CONTROL_KEY).unwrap().unwrap();
        *bytes.last_mut().unwrap() ^= 0xFF;
        table.put(CONTROL_KEY, &bytes).unwrap();
        let result: Result<Option<Sample>> = load(table.as_ref());
        assert!(result.is_err());
    }
}

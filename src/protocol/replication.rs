use bytes::{Buf, Bytes};

use crate::error::{EdgeError, Result};
use crate::lsn::Lsn;

/// PostgreSQL epoch (2000-01-01T00:00:00Z) in unix seconds.
pub const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;

/// Microseconds since the PostgreSQL epoch, for standby status updates.
pub fn pg_epoch_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_micros = (now.as_secs() as i64) * 1_000_000 + (now.subsec_micros() as i64);
    unix_micros - (PG_EPOCH_UNIX_SECS * 1_000_000)
}

/// A CopyData frame received in CopyBoth mode.
#[derive(Debug, Clone)]
pub enum ReplicationCopyData {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        data: Bytes,
    },
    KeepAlive {
        wal_end: Lsn,
        server_time_micros: i64,
        reply_requested: bool,
    },
}

pub fn parse_copy_data(payload: Bytes) -> Result<ReplicationCopyData> {
    if payload.is_empty() {
        return Err(EdgeError::Protocol("empty CopyData payload".into()));
    }
    let mut b = payload.clone();
    let kind = b.get_u8();
    match kind {
        b'w' => {
            if b.remaining() < 8 + 8 + 8 {
                return Err(EdgeError::Protocol("XLogData payload too short".into()));
            }
            let wal_start = Lsn(b.get_i64() as u64);
            let wal_end = Lsn(b.get_i64() as u64);
            let server_time_micros = b.get_i64();
            let data = b.copy_to_bytes(b.remaining());
            Ok(ReplicationCopyData::XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            })
        }
        b'k' => {
            if b.remaining() < 8 + 8 + 1 {
                return Err(EdgeError::Protocol("KeepAlive payload too short".into()));
            }
            let wal_end = Lsn(b.get_i64() as u64);
            let server_time_micros = b.get_i64();
            let reply_requested = b.get_u8() == 1;
            Ok(ReplicationCopyData::KeepAlive {
                wal_end,
                server_time_micros,
                reply_requested,
            })
        }
        _ => Err(EdgeError::Protocol(format!(
            "unknown CopyData kind: {kind}"
        ))),
    }
}

/// Encode a StandbyStatusUpdate.
///
/// The replica applies synchronously, so write, flush, and apply positions
/// are all the last locally committed LSN.
pub fn encode_standby_status_update(
    committed: Lsn,
    client_time_micros: i64,
    reply_requested: bool,
) -> Vec<u8> {
    // 'r' + write + flush + apply + client_time + reply_requested
    let mut out = Vec::with_capacity(1 + 8 * 4 + 1);
    out.push(b'r');
    out.extend_from_slice(&(committed.0 as i64).to_be_bytes());
    out.extend_from_slice(&(committed.0 as i64).to_be_bytes());
    out.extend_from_slice(&(committed.0 as i64).to_be_bytes());
    out.extend_from_slice(&client_time_micros.to_be_bytes());
    out.push(if reply_requested { 1 } else { 0 });
    out
}

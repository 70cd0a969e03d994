//! pgoutput logical-replication message decoder.
//!
//! Decodes the payload of XLogData frames produced by the `pgoutput` output
//! plugin (protocol version 1) into [`ChangeEvent`] values. Layout reference:
//! <https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html>
//!
//! Row events reference their table by relation OID; the descriptor arrives
//! earlier in the stream as a `Relation` message and must be remembered by
//! the consumer for the lifetime of the session.

use bytes::{Buf, Bytes};

use crate::error::{EdgeError, Result};
use crate::lsn::Lsn;

/// One column of a [`RelationDesc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    /// Set when the column is part of the replica identity key.
    pub key_part: bool,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

/// Schema descriptor for subsequent row events on the same relation OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDesc {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

/// A single column value inside a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    /// SQL NULL.
    Null,
    /// Unchanged TOASTed value; the stored value must be kept.
    Toast,
    /// Text-format value.
    Text(Bytes),
    /// Binary-format value.
    Binary(Bytes),
}

impl TupleValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, TupleValue::Null)
    }
}

/// Column values of one row image, in relation column order.
pub type TupleData = Vec<TupleValue>;

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Begin {
        final_lsn: Lsn,
        commit_ts: i64,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_ts: i64,
    },
    Relation(RelationDesc),
    Insert {
        rel_oid: u32,
        new: TupleData,
    },
    Update {
        rel_oid: u32,
        /// Full old row image (REPLICA IDENTITY FULL).
        old: Option<TupleData>,
        /// Key-column image (default replica identity).
        key: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        rel_oid: u32,
        /// Old row image; full or key-only depending on replica identity.
        old: TupleData,
    },
    Truncate {
        rel_oids: Vec<u32>,
        cascade: bool,
        restart_identity: bool,
    },
    /// Informational; carried through for logging only.
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    /// Informational; type metadata for custom types.
    Type {
        oid: u32,
        namespace: String,
        name: String,
    },
}

fn take_cstr(b: &mut Bytes) -> Result<String> {
    let pos = b
        .iter()
        .position(|&x| x == 0)
        .ok_or_else(|| EdgeError::Decode("unterminated string".into()))?;
    let s = String::from_utf8_lossy(&b[..pos]).into_owned();
    b.advance(pos + 1);
    Ok(s)
}

fn need(b: &Bytes, n: usize, what: &str) -> Result<()> {
    if b.remaining() < n {
        return Err(EdgeError::Decode(format!("truncated {what}")));
    }
    Ok(())
}

fn parse_tuple(b: &mut Bytes) -> Result<TupleData> {
    need(b, 2, "tuple header")?;
    let ncols = b.get_i16();
    if ncols < 0 {
        return Err(EdgeError::Decode(format!("negative column count: {ncols}")));
    }
    let mut values = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        need(b, 1, "tuple value kind")?;
        match b.get_u8() {
            b'n' => values.push(TupleValue::Null),
            b'u' => values.push(TupleValue::Toast),
            kind @ (b't' | b'b') => {
                need(b, 4, "tuple value length")?;
                let len = b.get_i32();
                if len < 0 {
                    return Err(EdgeError::Decode(format!("negative value length: {len}")));
                }
                need(b, len as usize, "tuple value")?;
                let data = b.copy_to_bytes(len as usize);
                values.push(if kind == b't' {
                    TupleValue::Text(data)
                } else {
                    TupleValue::Binary(data)
                });
            }
            other => {
                return Err(EdgeError::Decode(format!(
                    "unknown tuple value kind: {other}"
                )));
            }
        }
    }
    Ok(values)
}

/// Decode one pgoutput message (the `data` of an XLogData frame).
pub fn decode(payload: Bytes) -> Result<ChangeEvent> {
    let mut b = payload;
    need(&b, 1, "message tag")?;
    let tag = b.get_u8();
    match tag {
        b'B' => {
            need(&b, 8 + 8 + 4, "Begin body")?;
            let final_lsn = Lsn(b.get_u64());
            let commit_ts = b.get_i64();
            let xid = b.get_u32();
            Ok(ChangeEvent::Begin {
                final_lsn,
                commit_ts,
                xid,
            })
        }
        b'C' => {
            need(&b, 1 + 8 + 8 + 8, "Commit body")?;
            let _flags = b.get_u8();
            let commit_lsn = Lsn(b.get_u64());
            let end_lsn = Lsn(b.get_u64());
            let commit_ts = b.get_i64();
            Ok(ChangeEvent::Commit {
                commit_lsn,
                end_lsn,
                commit_ts,
            })
        }
        b'O' => {
            need(&b, 8, "Origin body")?;
            let commit_lsn = Lsn(b.get_u64());
            let name = take_cstr(&mut b)?;
            Ok(ChangeEvent::Origin { commit_lsn, name })
        }
        b'R' => {
            need(&b, 4, "Relation oid")?;
            let oid = b.get_u32();
            let namespace = take_cstr(&mut b)?;
            let name = take_cstr(&mut b)?;
            need(&b, 1 + 2, "Relation header")?;
            let replica_identity = b.get_u8();
            let ncols = b.get_i16();
            if ncols < 0 {
                return Err(EdgeError::Decode(format!(
                    "negative relation column count: {ncols}"
                )));
            }
            let mut columns = Vec::with_capacity(ncols as usize);
            for _ in 0..ncols {
                need(&b, 1, "relation column flags")?;
                let flags = b.get_u8();
                let col_name = take_cstr(&mut b)?;
                need(&b, 4 + 4, "relation column type")?;
                let type_oid = b.get_u32();
                let type_modifier = b.get_i32();
                columns.push(RelationColumn {
                    key_part: flags & 1 != 0,
                    name: col_name,
                    type_oid,
                    type_modifier,
                });
            }
            Ok(ChangeEvent::Relation(RelationDesc {
                oid,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'Y' => {
            need(&b, 4, "Type oid")?;
            let oid = b.get_u32();
            let namespace = take_cstr(&mut b)?;
            let name = take_cstr(&mut b)?;
            Ok(ChangeEvent::Type {
                oid,
                namespace,
                name,
            })
        }
        b'I' => {
            need(&b, 4 + 1, "Insert header")?;
            let rel_oid = b.get_u32();
            let marker = b.get_u8();
            if marker != b'N' {
                return Err(EdgeError::Decode(format!(
                    "unexpected Insert tuple marker: {marker}"
                )));
            }
            let new = parse_tuple(&mut b)?;
            Ok(ChangeEvent::Insert { rel_oid, new })
        }
        b'U' => {
            need(&b, 4 + 1, "Update header")?;
            let rel_oid = b.get_u32();
            let mut old = None;
            let mut key = None;
            let mut marker = b.get_u8();
            if marker == b'O' {
                old = Some(parse_tuple(&mut b)?);
                need(&b, 1, "Update new-tuple marker")?;
                marker = b.get_u8();
            } else if marker == b'K' {
                key = Some(parse_tuple(&mut b)?);
                need(&b, 1, "Update new-tuple marker")?;
                marker = b.get_u8();
            }
            if marker != b'N' {
                return Err(EdgeError::Decode(format!(
                    "unexpected Update tuple marker: {marker}"
                )));
            }
            let new = parse_tuple(&mut b)?;
            Ok(ChangeEvent::Update {
                rel_oid,
                old,
                key,
                new,
            })
        }
        b'D' => {
            need(&b, 4 + 1, "Delete header")?;
            let rel_oid = b.get_u32();
            let marker = b.get_u8();
            if marker != b'K' && marker != b'O' {
                return Err(EdgeError::Decode(format!(
                    "unexpected Delete tuple marker: {marker}"
                )));
            }
            let old = parse_tuple(&mut b)?;
            Ok(ChangeEvent::Delete { rel_oid, old })
        }
        b'T' => {
            need(&b, 4 + 1, "Truncate header")?;
            let nrels = b.get_i32();
            if nrels < 0 {
                return Err(EdgeError::Decode(format!(
                    "negative truncate relation count: {nrels}"
                )));
            }
            let options = b.get_u8();
            let mut rel_oids = Vec::with_capacity(nrels as usize);
            for _ in 0..nrels {
                need(&b, 4, "truncate relation oid")?;
                rel_oids.push(b.get_u32());
            }
            Ok(ChangeEvent::Truncate {
                rel_oids,
                cascade: options & 1 != 0,
                restart_identity: options & 2 != 0,
            })
        }
        other => Err(EdgeError::Decode(format!(
            "unknown pgoutput message tag: {}",
            other as char
        ))),
    }
}

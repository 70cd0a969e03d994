use bytes::{Buf, Bytes};

use crate::error::{EdgeError, Result};

pub fn parse_error_response(payload: &[u8]) -> String {
    // fields: (code_byte, cstring) ... 0
    let mut b = payload;
    let mut msg = None;
    let mut sqlstate = None;

    while !b.is_empty() {
        let code = b[0];
        b = &b[1..];
        if code == 0 {
            break;
        }
        if let Some(pos) = b.iter().position(|&x| x == 0) {
            let s = String::from_utf8_lossy(&b[..pos]).to_string();
            if code == b'M' {
                msg = Some(s);
            } else if code == b'C' {
                sqlstate = Some(s);
            }
            b = &b[pos + 1..];
        } else {
            break;
        }
    }

    match (msg, sqlstate) {
        (Some(m), Some(c)) => format!("{m} (SQLSTATE {c})"),
        (Some(m), None) => m,
        _ => "unknown server error".to_string(),
    }
}

/// Extract only the SQLSTATE code from an ErrorResponse payload.
pub fn error_sqlstate(payload: &[u8]) -> Option<String> {
    let mut b = payload;
    while !b.is_empty() {
        let code = b[0];
        b = &b[1..];
        if code == 0 {
            break;
        }
        let pos = b.iter().position(|&x| x == 0)?;
        if code == b'C' {
            return Some(String::from_utf8_lossy(&b[..pos]).to_string());
        }
        b = &b[pos + 1..];
    }
    None
}

pub fn parse_auth_request(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < 4 {
        return Err(EdgeError::Protocol("auth request too short".into()));
    }
    let mut b = payload;
    let code = b.get_i32();
    Ok((code, b))
}

/// Parse a CommandComplete payload into its command tag string.
pub fn parse_command_complete(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|&x| x == 0)
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).to_string()
}

/// Extract the affected-row count from a command tag.
///
/// `INSERT 0 5` -> 5, `UPDATE 3` -> 3, `DELETE 2` -> 2. Tags without a
/// trailing count (`CREATE TABLE`, ...) yield `None`.
pub fn affected_rows(tag: &str) -> Option<u64> {
    let last = tag.rsplit(' ').next()?;
    last.parse().ok()
}

/// Parse a client-side DataRow payload into per-column values (None = NULL).
pub fn parse_data_row(payload: Bytes) -> Result<Vec<Option<Bytes>>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(EdgeError::Protocol("DataRow payload too short".into()));
    }
    let ncols = b.get_i16();
    let mut values = Vec::with_capacity(ncols.max(0) as usize);
    for _ in 0..ncols {
        if b.remaining() < 4 {
            return Err(EdgeError::Protocol("DataRow truncated".into()));
        }
        let len = b.get_i32();
        if len < 0 {
            values.push(None);
        } else {
            let len = len as usize;
            if b.remaining() < len {
                return Err(EdgeError::Protocol("DataRow value truncated".into()));
            }
            values.push(Some(b.copy_to_bytes(len)));
        }
    }
    Ok(values)
}

/// Parse a client-side RowDescription payload into column names. The simple
/// query client needs only names; OIDs and sizes are ignored on this side.
pub fn parse_row_description(payload: Bytes) -> Result<Vec<String>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(EdgeError::Protocol("RowDescription payload too short".into()));
    }
    let nfields = b.get_i16();
    let mut names = Vec::with_capacity(nfields.max(0) as usize);
    for _ in 0..nfields {
        let pos = b
            .iter()
            .position(|&x| x == 0)
            .ok_or_else(|| EdgeError::Protocol("unterminated field name".into()))?;
        let name = String::from_utf8_lossy(&b[..pos]).to_string();
        b.advance(pos + 1);
        // table oid (4) + attnum (2) + type oid (4) + size (2) + typmod (4) + format (2)
        if b.remaining() < 18 {
            return Err(EdgeError::Protocol("RowDescription field truncated".into()));
        }
        b.advance(18);
        names.push(name);
    }
    Ok(names)
}

//! Backend (server-to-client) message builders for the wire front end.
//!
//! Each builder appends one complete tagged message to a reply buffer; a
//! session encodes its whole reply, then writes it in a single call. Message
//! layouts per the PostgreSQL v3 protocol: 1-byte tag, 4-byte length
//! including itself, payload.

use bytes::{BufMut, BytesMut};

/// Process id reported in BackendKeyData. Query cancellation is not
/// implemented, so fixed values are sufficient.
pub const BACKEND_PID: u32 = 1234;

/// Secret reported in BackendKeyData.
pub const BACKEND_SECRET: u32 = 5678;

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: String,
    pub type_oid: u32,
    pub type_size: i16,
}

fn patch_len(buf: &mut BytesMut, start: usize) {
    // length counts everything after the tag byte
    let len = (buf.len() - start - 1) as i32;
    buf[start + 1..start + 5].copy_from_slice(&len.to_be_bytes());
}

/// AuthenticationOk: type 'R', payload 0.
pub fn authentication_ok(buf: &mut BytesMut) {
    buf.put_u8(b'R');
    buf.put_i32(8);
    buf.put_i32(0);
}

/// BackendKeyData: type 'K', process id + secret.
pub fn backend_key_data(buf: &mut BytesMut) {
    buf.put_u8(b'K');
    buf.put_i32(12);
    buf.put_u32(BACKEND_PID);
    buf.put_u32(BACKEND_SECRET);
}

/// ReadyForQuery: type 'Z', transaction status. Always `I` here; client
/// transactions are not modeled.
pub fn ready_for_query(buf: &mut BytesMut) {
    buf.put_u8(b'Z');
    buf.put_i32(5);
    buf.put_u8(b'I');
}

/// RowDescription: one field per result column, text format.
pub fn row_description(buf: &mut BytesMut, fields: &[FieldDesc]) {
    let start = buf.len();
    buf.put_u8(b'T');
    buf.put_i32(0); // length placeholder
    buf.put_i16(fields.len() as i16);
    for field in fields {
        buf.extend_from_slice(field.name.as_bytes());
        buf.put_u8(0);
        buf.put_u32(0); // table oid: unknown
        buf.put_i16(0); // attribute number: unknown
        buf.put_u32(field.type_oid);
        buf.put_i16(field.type_size);
        buf.put_i32(-1); // type modifier
        buf.put_i16(0); // format: text
    }
    patch_len(buf, start);
}

/// DataRow: values as text bytes; NULL encoded as length -1.
pub fn data_row(buf: &mut BytesMut, values: &[Option<String>]) {
    let start = buf.len();
    buf.put_u8(b'D');
    buf.put_i32(0); // length placeholder
    buf.put_i16(values.len() as i16);
    for value in values {
        match value {
            None => buf.put_i32(-1),
            Some(text) => {
                buf.put_i32(text.len() as i32);
                buf.extend_from_slice(text.as_bytes());
            }
        }
    }
    patch_len(buf, start);
}

/// CommandComplete with the given command tag.
pub fn command_complete(buf: &mut BytesMut, tag: &str) {
    let start = buf.len();
    buf.put_u8(b'C');
    buf.put_i32(0); // length placeholder
    buf.extend_from_slice(tag.as_bytes());
    buf.put_u8(0);
    patch_len(buf, start);
}

/// EmptyQueryResponse, for an empty query string.
pub fn empty_query_response(buf: &mut BytesMut) {
    buf.put_u8(b'I');
    buf.put_i32(4);
}

/// ErrorResponse with severity ERROR and a generic internal SQLSTATE.
pub fn error_response(buf: &mut BytesMut, message: &str) {
    let start = buf.len();
    buf.put_u8(b'E');
    buf.put_i32(0); // length placeholder
    buf.put_u8(b'S');
    buf.extend_from_slice(b"ERROR");
    buf.put_u8(0);
    buf.put_u8(b'C');
    buf.extend_from_slice(b"XX000");
    buf.put_u8(0);
    buf.put_u8(b'M');
    buf.extend_from_slice(message.as_bytes());
    buf.put_u8(0);
    buf.put_u8(0); // field terminator
    patch_len(buf, start);
}

//! Parser for the `CREATE TABLE` subset both dialects share.
//!
//! A deterministic single-pass parser, sufficient to reconstruct the local
//! store's table layout from its own catalog text and to ingest translated
//! upstream DDL. Recognized per column: `PRIMARY KEY`, `NOT NULL`,
//! `DEFAULT <expr>`, `UNIQUE`; at table level: `PRIMARY KEY (a, b, ...)`.
//! Whitespace, `--` line comments, and single- or double-quoted identifiers
//! are tolerated. Errors carry the byte offset of the offending token.

use super::types::ColType;
use super::{ColumnDef, TableSchema};

/// Error with the character offset where parsing stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlParseError {
    pub offset: usize,
    pub message: String,
}

impl std::fmt::Display for DdlParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

impl std::error::Error for DdlParseError {}

impl From<DdlParseError> for crate::error::EdgeError {
    fn from(err: DdlParseError) -> Self {
        crate::error::EdgeError::UnsupportedDdl(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Tok {
    /// Bare identifier or keyword, folded to lowercase.
    Word(String),
    /// Quoted identifier, case preserved.
    Quoted(String),
    Number(String),
    Sym(char),
}

pub(crate) struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    pub(crate) fn err(&self, message: impl Into<String>) -> DdlParseError {
        DdlParseError {
            offset: self.pos,
            message: message.into(),
        }
    }

    pub(crate) fn skip_ws(&mut self) {
        loop {
            while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            // -- line comment
            if self.pos + 1 < self.src.len()
                && self.src[self.pos] == b'-'
                && self.src[self.pos + 1] == b'-'
            {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    /// Offset of the next token, after whitespace.
    pub(crate) fn offset(&mut self) -> usize {
        self.skip_ws();
        self.pos
    }

    pub(crate) fn peek(&mut self) -> Result<Option<Tok>, DdlParseError> {
        let save = self.pos;
        let tok = self.next()?;
        self.pos = save;
        Ok(tok)
    }

    pub(crate) fn next(&mut self) -> Result<Option<Tok>, DdlParseError> {
        self.skip_ws();
        let Some(&c) = self.src.get(self.pos) else {
            return Ok(None);
        };

        if c == b'"' || c == b'\'' {
            let quote = c;
            let start = self.pos + 1;
            let mut end = start;
            while end < self.src.len() && self.src[end] != quote {
                end += 1;
            }
            if end >= self.src.len() {
                return Err(self.err("unterminated quoted identifier"));
            }
            self.pos = end + 1;
            return Ok(Some(Tok::Quoted(
                String::from_utf8_lossy(&self.src[start..end]).into_owned(),
            )));
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while self.pos < self.src.len()
                && (self.src[self.pos].is_ascii_alphanumeric()
                    || self.src[self.pos] == b'_'
                    || self.src[self.pos] == b'$')
            {
                self.pos += 1;
            }
            let word = String::from_utf8_lossy(&self.src[start..self.pos]).to_lowercase();
            return Ok(Some(Tok::Word(word)));
        }

        if c.is_ascii_digit() {
            let start = self.pos;
            while self.pos < self.src.len()
                && (self.src[self.pos].is_ascii_digit() || self.src[self.pos] == b'.')
            {
                self.pos += 1;
            }
            return Ok(Some(Tok::Number(
                String::from_utf8_lossy(&self.src[start..self.pos]).into_owned(),
            )));
        }

        self.pos += 1;
        Ok(Some(Tok::Sym(c as char)))
    }

    pub(crate) fn expect_word(&mut self, want: &str) -> Result<(), DdlParseError> {
        let at = self.offset();
        match self.next()? {
            Some(Tok::Word(w)) if w == want => Ok(()),
            other => Err(DdlParseError {
                offset: at,
                message: format!("expected {want}, found {other:?}"),
            }),
        }
    }

    pub(crate) fn expect_sym(&mut self, want: char) -> Result<(), DdlParseError> {
        let at = self.offset();
        match self.next()? {
            Some(Tok::Sym(s)) if s == want => Ok(()),
            other => Err(DdlParseError {
                offset: at,
                message: format!("expected '{want}', found {other:?}"),
            }),
        }
    }

    /// Bare or quoted identifier. Qualified names collapse to the last
    /// segment (the default schema is implicit locally).
    pub(crate) fn identifier(&mut self) -> Result<String, DdlParseError> {
        let at = self.offset();
        let mut name = match self.next()? {
            Some(Tok::Word(w)) => w,
            Some(Tok::Quoted(q)) => q,
            other => {
                return Err(DdlParseError {
                    offset: at,
                    message: format!("expected identifier, found {other:?}"),
                });
            }
        };
        while matches!(self.peek()?, Some(Tok::Sym('.'))) {
            self.next()?;
            name = match self.next()? {
                Some(Tok::Word(w)) => w,
                Some(Tok::Quoted(q)) => q,
                other => {
                    return Err(DdlParseError {
                        offset: at,
                        message: format!("expected identifier after '.', found {other:?}"),
                    });
                }
            };
        }
        Ok(name)
    }
}

/// Parse a `CREATE TABLE` statement into its table schema.
pub fn parse_create_table(sql: &str) -> Result<TableSchema, DdlParseError> {
    let mut lex = Lexer::new(sql);

    lex.expect_word("create")?;
    lex.expect_word("table")?;
    if matches!(lex.peek()?, Some(Tok::Word(w)) if w == "if") {
        lex.expect_word("if")?;
        lex.expect_word("not")?;
        lex.expect_word("exists")?;
    }
    let table = lex.identifier()?;
    lex.expect_sym('(')?;

    let mut columns: Vec<ColumnDef> = Vec::new();
    let mut table_pk: Option<Vec<String>> = None;

    loop {
        let at = lex.offset();
        match lex.peek()? {
            Some(Tok::Word(w)) if w == "primary" => {
                if table_pk.is_some() || columns.iter().any(|c| c.primary_key) {
                    return Err(DdlParseError {
                        offset: at,
                        message: "multiple primary key definitions".into(),
                    });
                }
                lex.expect_word("primary")?;
                lex.expect_word("key")?;
                lex.expect_sym('(')?;
                let mut pk = Vec::new();
                loop {
                    pk.push(lex.identifier()?);
                    match lex.next()? {
                        Some(Tok::Sym(',')) => continue,
                        Some(Tok::Sym(')')) => break,
                        other => {
                            return Err(DdlParseError {
                                offset: at,
                                message: format!("expected ',' or ')' in key list, found {other:?}"),
                            });
                        }
                    }
                }
                table_pk = Some(pk);
            }
            _ => {
                let col = parse_column(&mut lex, &columns)?;
                columns.push(col);
            }
        }

        let at = lex.offset();
        match lex.next()? {
            Some(Tok::Sym(',')) => continue,
            Some(Tok::Sym(')')) => break,
            other => {
                return Err(DdlParseError {
                    offset: at,
                    message: format!("expected ',' or ')', found {other:?}"),
                });
            }
        }
    }

    if let Some(pk) = table_pk {
        for key in &pk {
            let col = columns
                .iter_mut()
                .find(|c| &c.name == key)
                .ok_or_else(|| DdlParseError {
                    offset: sql.len(),
                    message: format!("primary key references unknown column {key}"),
                })?;
            col.primary_key = true;
        }
    }

    Ok(TableSchema::new(table, columns))
}

pub(crate) fn parse_column(lex: &mut Lexer<'_>, existing: &[ColumnDef]) -> Result<ColumnDef, DdlParseError> {
    let name_at = lex.offset();
    let name = lex.identifier()?;
    if existing.iter().any(|c| c.name == name) {
        return Err(DdlParseError {
            offset: name_at,
            message: format!("duplicate column {name}"),
        });
    }

    let (ty, modifier) = parse_type(lex)?;
    let mut col = ColumnDef::plain(name, ty);
    col.modifier = modifier;

    loop {
        let at = lex.offset();
        match lex.peek()? {
            Some(Tok::Sym(',')) | Some(Tok::Sym(')')) | None => break,
            Some(Tok::Word(w)) => match w.as_str() {
                "primary" => {
                    lex.next()?;
                    lex.expect_word("key")?;
                    col.primary_key = true;
                }
                "not" => {
                    lex.next()?;
                    lex.expect_word("null")?;
                    col.not_null = true;
                }
                "null" => {
                    lex.next()?;
                }
                "unique" => {
                    lex.next()?;
                    col.unique = true;
                }
                "default" => {
                    lex.next()?;
                    col.default = Some(parse_default_expr(lex)?);
                }
                other => {
                    return Err(DdlParseError {
                        offset: at,
                        message: format!("unsupported column constraint: {other}"),
                    });
                }
            },
            Some(other) => {
                return Err(DdlParseError {
                    offset: at,
                    message: format!("unexpected token in column definition: {other:?}"),
                });
            }
        }
    }

    Ok(col)
}

/// Parse the type phrase, folding multi-word upstream spellings, and resolve
/// it through the type mapper.
pub(crate) fn parse_type(lex: &mut Lexer<'_>) -> Result<(ColType, Option<String>), DdlParseError> {
    let at = lex.offset();
    let mut phrase = match lex.next()? {
        Some(Tok::Word(w)) => w,
        other => {
            return Err(DdlParseError {
                offset: at,
                message: format!("expected type name, found {other:?}"),
            });
        }
    };

    // Multi-word spellings: "double precision", "character varying",
    // "timestamp/time with[out] time zone".
    match lex.peek()? {
        Some(Tok::Word(w)) if w == "precision" || w == "varying" => {
            lex.next()?;
            phrase.push(' ');
            phrase.push_str(&w);
        }
        Some(Tok::Word(w)) if w == "with" || w == "without" => {
            lex.next()?;
            lex.expect_word("time")?;
            lex.expect_word("zone")?;
            phrase.push_str(if w == "with" {
                " with time zone"
            } else {
                " without time zone"
            });
        }
        _ => {}
    }

    // Optional (n) or (n,m) length/precision modifier, captured verbatim.
    let mut modifier = None;
    if matches!(lex.peek()?, Some(Tok::Sym('('))) {
        lex.next()?;
        let mut inner = String::new();
        loop {
            match lex.next()? {
                Some(Tok::Sym(')')) => break,
                Some(Tok::Number(n)) => inner.push_str(&n),
                Some(Tok::Sym(',')) => inner.push(','),
                other => {
                    return Err(DdlParseError {
                        offset: at,
                        message: format!("invalid type modifier: {other:?}"),
                    });
                }
            }
        }
        modifier = Some(inner);
    }

    let ty = ColType::from_name(&phrase).ok_or_else(|| DdlParseError {
        offset: at,
        message: format!("unsupported type: {phrase}"),
    })?;
    Ok((ty, modifier))
}

/// Capture a DEFAULT expression verbatim until the next top-level ',' or ')'.
fn parse_default_expr(lex: &mut Lexer<'_>) -> Result<String, DdlParseError> {
    let mut depth = 0usize;
    let mut parts: Vec<String> = Vec::new();
    loop {
        match lex.peek()? {
            Some(Tok::Sym(',')) | Some(Tok::Sym(')')) if depth == 0 => break,
            // A trailing constraint ends the expression.
            Some(Tok::Word(w))
                if depth == 0
                    && !parts.is_empty()
                    && matches!(w.as_str(), "primary" | "not" | "unique" | "constraint") =>
            {
                break;
            }
            None => break,
            _ => {}
        }
        match lex.next()? {
            Some(Tok::Sym('(')) => {
                depth += 1;
                parts.push("(".into());
            }
            Some(Tok::Sym(')')) => {
                depth -= 1;
                parts.push(")".into());
            }
            Some(Tok::Word(w)) => parts.push(w),
            Some(Tok::Quoted(q)) => parts.push(format!("'{q}'")),
            Some(Tok::Number(n)) => parts.push(n),
            Some(Tok::Sym(s)) => parts.push(s.to_string()),
            None => break,
        }
    }
    if parts.is_empty() {
        return Err(lex.err("empty default expression"));
    }
    // Rejoin with spaces except around parens and punctuation noise.
    let mut out = String::new();
    for part in parts {
        if !out.is_empty() && part != ")" && !out.ends_with('(') {
            out.push(' ');
        }
        out.push_str(&part);
    }
    Ok(out)
}

//! SQL text rendering for dumps and statement streaming for restores.
//!
//! Every emitted statement occupies exactly one line and ends with `;`, so
//! the reader can resume from any line boundary.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use teleport_core::{Database, Row, SqlValue};

/// Render a value as an SQL literal.
#[must_use]
pub fn render_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(r) if r.is_finite() => format!("{r:?}"),
        SqlValue::Real(_) => "NULL".to_string(),
        SqlValue::Text(s) => render_text(s),
        SqlValue::Blob(bytes) => format!("X'{}'", hex_upper(bytes)),
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

/// Quote text, splicing line breaks and NULs in via `char()` so the literal
/// stays on one line.
fn render_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\n' => out.push_str("'||char(10)||'"),
            '\r' => out.push_str("'||char(13)||'"),
            '\0' => out.push_str("'||char(0)||'"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// `DROP TABLE IF EXISTS` followed by the table's definition, one line each.
pub fn render_definition(db: &dyn Database, table: &str) -> teleport_core::Result<String> {
    let definition = db.table_definition(table)?;
    Ok(format!(
        "DROP TABLE IF EXISTS {};\n{};\n",
        db.quote_identifier(table),
        flatten_statement(&definition)
    ))
}

/// The table's index and trigger definitions, one statement per line.
pub fn render_dependents(db: &dyn Database, table: &str) -> teleport_core::Result<Vec<String>> {
    Ok(db
        .table_dependents(table)?
        .iter()
        .map(|sql| format!("{};\n", flatten_statement(sql)))
        .collect())
}

/// Collapse stored schema text onto one line. Comments are dropped and
/// whitespace runs outside quoted text become a single space; the trailing
/// `;`, if any, is removed.
#[must_use]
pub fn flatten_statement(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut gap = false;
    while let Some(ch) = chars.next() {
        match ch {
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                gap = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                gap = true;
            }
            c if c.is_whitespace() => gap = true,
            _ => {
                if gap && !out.is_empty() {
                    out.push(' ');
                }
                gap = false;
                out.push(ch);
                let close = match ch {
                    '\'' | '"' | '`' => ch,
                    '[' => ']',
                    _ => continue,
                };
                // Quoted text is copied verbatim; a doubled quote escapes itself.
                while let Some(c) = chars.next() {
                    out.push(c);
                    if c == close {
                        if close != ']' && chars.peek() == Some(&close) {
                            chars.next();
                            out.push(close);
                        } else {
                            break;
                        }
                    }
                }
            }
        }
    }
    out.trim_end_matches(';').trim_end().to_string()
}

/// Single-line `INSERT` for one row.
#[must_use]
pub fn render_insert(db: &dyn Database, table: &str, row: &Row) -> String {
    let columns: Vec<String> = row.columns.iter().map(|c| db.quote_identifier(c)).collect();
    let values: Vec<String> = row.values.iter().map(render_value).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({});\n",
        db.quote_identifier(table),
        columns.join(", "),
        values.join(", ")
    )
}

/// A complete statement and the position just past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    /// Byte offset of the first byte after this statement.
    pub next_offset: u64,
    /// Number of lines consumed from the start of the file.
    pub next_line: u64,
}

/// Streams `;`-terminated statements from an SQL chunk, starting at a
/// recorded byte offset.
#[derive(Debug)]
pub struct StatementReader {
    reader: BufReader<File>,
    offset: u64,
    line: u64,
}

impl StatementReader {
    pub fn open(path: &Path, offset: u64, line: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            line,
        })
    }

    /// Next statement, or `None` at end of file.
    pub fn next_statement(&mut self) -> io::Result<Option<Statement>> {
        let mut sql = String::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            let read = self.reader.read_line(&mut buf)?;
            if read == 0 {
                if sql.trim().is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unterminated statement ending at line {}", self.line),
                ));
            }
            self.offset += read as u64;
            self.line += 1;
            let trimmed = buf.trim();
            if sql.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
                continue;
            }
            if !sql.is_empty() {
                sql.push('\n');
            }
            sql.push_str(buf.trim_end_matches(['\n', '\r']));
            if trimmed.ends_with(';') {
                return Ok(Some(Statement {
                    sql,
                    next_offset: self.offset,
                    next_line: self.line,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn text_stays_on_one_line() {
        let rendered = render_value(&SqlValue::Text("it's\nmulti\r\nline".into()));
        assert_eq!(
            rendered,
            "'it''s'||char(10)||'multi'||char(13)||''||char(10)||'line'"
        );
        assert!(!rendered.contains('\n'));
    }

    #[test]
    fn scalar_rendering() {
        assert_eq!(render_value(&SqlValue::Null), "NULL");
        assert_eq!(render_value(&SqlValue::Integer(-7)), "-7");
        assert_eq!(render_value(&SqlValue::Real(1.5)), "1.5");
        assert_eq!(render_value(&SqlValue::Real(f64::NAN)), "NULL");
        assert_eq!(render_value(&SqlValue::Blob(vec![0xde, 0xad])), "X'DEAD'");
    }

    #[test]
    fn flatten_drops_comments_outside_quotes() {
        let definition = "CREATE TABLE notes (\n  id INTEGER PRIMARY KEY, -- row id\n  /* free text */ body TEXT DEFAULT '-- not a comment',\n  \"odd\"\"name\" TEXT\n)";
        assert_eq!(
            flatten_statement(definition),
            "CREATE TABLE notes ( id INTEGER PRIMARY KEY, body TEXT DEFAULT '-- not a comment', \"odd\"\"name\" TEXT )"
        );
    }

    #[test]
    fn flatten_keeps_trigger_bodies_on_one_line() {
        let trigger = "CREATE TRIGGER touch AFTER UPDATE ON posts\nBEGIN\n  UPDATE posts SET score = 0 WHERE id = new.id;\nEND;";
        let flat = flatten_statement(trigger);
        assert_eq!(
            flat,
            "CREATE TRIGGER touch AFTER UPDATE ON posts BEGIN UPDATE posts SET score = 0 WHERE id = new.id; END"
        );
        assert!(!flat.contains('\n'));
    }

    #[test]
    fn reader_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sql");
        std::fs::write(
            &path,
            "-- header\nDROP TABLE IF EXISTS \"t\";\n\nCREATE TABLE \"t\" (a,\n b);\nINSERT INTO \"t\" VALUES (1, 2);\n",
        )
        .unwrap();

        let mut reader = StatementReader::open(&path, 0, 0).unwrap();
        let first = reader.next_statement().unwrap().unwrap();
        assert_eq!(first.sql, "DROP TABLE IF EXISTS \"t\";");
        assert_eq!(first.next_line, 2);
        let second = reader.next_statement().unwrap().unwrap();
        assert_eq!(second.sql, "CREATE TABLE \"t\" (a,\n b);");

        let mut resumed = StatementReader::open(&path, second.next_offset, second.next_line).unwrap();
        let third = resumed.next_statement().unwrap().unwrap();
        assert!(third.sql.starts_with("INSERT"));
        assert_eq!(third.next_line, 6);
        assert!(resumed.next_statement().unwrap().is_none());
    }

    #[test]
    fn truncated_tail_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sql");
        std::fs::write(&path, "INSERT INTO t VALUES (1);\nINSERT INTO t VAL").unwrap();
        let mut reader = StatementReader::open(&path, 0, 0).unwrap();
        assert!(reader.next_statement().unwrap().is_some());
        assert!(reader.next_statement().is_err());
    }

    proptest! {
        #[test]
        fn prop_rendered_text_reads_back_one_statement_each(
            values in proptest::collection::vec(any::<String>(), 1..8)
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("db.sql");
            let statements: Vec<String> = values
                .iter()
                .map(|v| format!("INSERT INTO t VALUES ({});\n", render_value(&SqlValue::Text(v.clone()))))
                .collect();
            std::fs::write(&path, statements.concat()).unwrap();

            let mut reader = StatementReader::open(&path, 0, 0).unwrap();
            for (i, expected) in statements.iter().enumerate() {
                let statement = reader.next_statement().unwrap().unwrap();
                prop_assert_eq!(&statement.sql, expected.trim_end_matches('\n'));
                prop_assert_eq!(statement.next_line, i as u64 + 1);
            }
            prop_assert!(reader.next_statement().unwrap().is_none());
        }
    }
}

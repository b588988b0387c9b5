//! Relational dump decoder.
//!
//! The input is split into statements by a character-level scanner that tracks
//! quotes, comments and parenthesis depth, so a `;` inside a literal or a nested
//! value list never ends a statement. Each statement is then lexed and, when it
//! is a `CREATE TABLE` or an `INSERT`, parsed into a table shape or value tuples.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::sql_types::map_declared_type;
use super::{check_source, Decoder};
use crate::config::DecoderConfig;
use crate::core::naming::normalize_field_name;
use crate::core::{PrimitiveType, Provenance, Record, SourceKind};
use crate::error::{MigrateError, Result};

/// Column extracted from a `CREATE TABLE` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnShape {
    /// Normalized column name.
    pub name: String,
    /// Column name as declared.
    pub source_name: String,
    pub declared_type: String,
    pub primitive: PrimitiveType,
    pub nullable: bool,
    pub default: Option<String>,
    pub auto_increment: bool,
    pub primary_key: bool,
}

/// Table extracted from a `CREATE TABLE` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShape {
    /// Table name as declared, without schema qualifier or quoting.
    pub name: String,
    pub columns: Vec<ColumnShape>,
    /// Primary key columns (normalized names), inline or table-level.
    pub primary_key: Vec<String>,
}

impl TableShape {
    pub fn column(&self, name: &str) -> Option<&ColumnShape> {
        self.columns.iter().find(|c| c.name == name)
    }
}

// ===== Statement splitting =====

/// Character-level scanner that cuts a stream into statements.
#[derive(Debug, Default)]
struct StatementSplitter {
    quote: Option<char>,
    escaped: bool,
    block_comment: bool,
    depth: i32,
    buf: String,
    line: u64,
    start_line: u64,
}

impl StatementSplitter {
    /// Feed one line (with its terminator); returns completed statements with start line.
    fn feed_line(&mut self, line: &str) -> Vec<(String, u64)> {
        self.line += 1;
        let mut done = Vec::new();
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            if self.block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    self.block_comment = false;
                    self.buf.push(' ');
                }
                continue;
            }

            if let Some(q) = self.quote {
                self.buf.push(c);
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' && q != '`' {
                    self.escaped = true;
                } else if c == q {
                    if chars.peek() == Some(&q) {
                        // Doubled quote is an escaped quote.
                        if let Some(next) = chars.next() {
                            self.buf.push(next);
                        }
                    } else {
                        self.quote = None;
                    }
                }
                continue;
            }

            match c {
                '\'' | '"' | '`' => {
                    self.mark_start();
                    self.quote = Some(c);
                    self.buf.push(c);
                }
                '-' if chars.peek() == Some(&'-') => break,
                '#' => break,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    self.block_comment = true;
                }
                '(' => {
                    self.mark_start();
                    self.depth += 1;
                    self.buf.push(c);
                }
                ')' => {
                    self.depth = (self.depth - 1).max(0);
                    self.buf.push(c);
                }
                ';' if self.depth == 0 => {
                    let stmt = std::mem::take(&mut self.buf);
                    if !stmt.trim().is_empty() {
                        done.push((stmt.trim().to_string(), self.start_line));
                    }
                }
                c if c.is_whitespace() => {
                    if !self.buf.is_empty() {
                        self.buf.push(' ');
                    }
                }
                c => {
                    self.mark_start();
                    self.buf.push(c);
                }
            }
        }

        // Keep line breaks as separators between tokens.
        if self.quote.is_some() {
            // Newline already pushed as part of the quoted text.
        } else if !self.buf.is_empty() && !self.buf.ends_with(' ') {
            self.buf.push(' ');
        }
        done
    }

    fn mark_start(&mut self) {
        if self.buf.trim().is_empty() {
            self.start_line = self.line;
        }
    }

    /// Remaining unterminated statement at end of input.
    fn finish(&mut self) -> Option<(String, u64)> {
        let stmt = std::mem::take(&mut self.buf);
        let stmt = stmt.trim();
        if stmt.is_empty() {
            None
        } else {
            Some((stmt.to_string(), self.start_line))
        }
    }
}

// ===== Lexing =====

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Bare word: keyword, identifier or number.
    Word(String),
    /// Quoted identifier (backtick, double quote, brackets).
    Ident(String),
    /// Single-quoted string literal, unescaped.
    Str(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Sym(char),
}

impl Token {
    fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    fn name(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Ident(w) => Some(w),
            _ => None,
        }
    }
}

fn lex(stmt: &str) -> Vec<Token> {
    let chars: Vec<char> = stmt.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' if !chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '\'' => {
                let (text, next) = read_string(&chars, i + 1);
                tokens.push(Token::Str(text));
                i = next;
            }
            '"' | '`' => {
                let (text, next) = read_quoted_ident(&chars, i + 1, c);
                tokens.push(Token::Ident(text));
                i = next;
            }
            '[' => {
                let (text, next) = read_quoted_ident(&chars, i + 1, ']');
                tokens.push(Token::Ident(text));
                i = next;
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() {
                    let ch = chars[i];
                    let exponent_sign = (ch == '+' || ch == '-')
                        && i > start
                        && matches!(chars[i - 1], 'e' | 'E')
                        && chars[start].is_ascii_digit();
                    if is_word_char(ch) || exponent_sign || (ch == '.' && chars[start].is_ascii_digit()) {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            c => {
                tokens.push(Token::Sym(c));
                i += 1;
            }
        }
    }
    tokens
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '@'
}

/// Read a single-quoted literal starting after the opening quote.
fn read_string(chars: &[char], mut i: usize) -> (String, usize) {
    let mut out = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            let escaped = chars[i + 1];
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                'Z' => '\u{1a}',
                other => other,
            });
            i += 2;
        } else if c == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
            } else {
                return (out, i + 1);
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    (out, i)
}

fn read_quoted_ident(chars: &[char], mut i: usize, close: char) -> (String, usize) {
    let mut out = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c == close {
            if close != ']' && chars.get(i + 1) == Some(&close) {
                out.push(close);
                i += 2;
                continue;
            }
            return (out, i + 1);
        }
        out.push(c);
        i += 1;
    }
    (out, i)
}

/// Index of the `)` matching the `(` at `open`.
fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        match t {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas at nesting depth 0.
fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            Token::Comma if depth == 0 => {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < tokens.len() {
        parts.push(&tokens[start..]);
    }
    parts
}

/// Render tokens back to compact SQL text.
fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut prev_word = false;
    for t in tokens {
        let (text, is_word) = match t {
            Token::Word(w) => (w.clone(), true),
            Token::Ident(w) => (w.clone(), true),
            Token::Str(s) => (format!("'{}'", s.replace('\'', "''")), true),
            Token::LParen => ("(".to_string(), false),
            Token::RParen => (")".to_string(), false),
            Token::Comma => (",".to_string(), false),
            Token::Dot => (".".to_string(), false),
            Token::Sym(c) => (c.to_string(), false),
        };
        if is_word && prev_word {
            out.push(' ');
        }
        out.push_str(&text);
        prev_word = is_word;
    }
    out
}

/// Parse a possibly qualified name at `i`; returns the last segment.
fn parse_name(tokens: &[Token], mut i: usize) -> Option<(String, usize)> {
    let mut name = tokens.get(i)?.name()?.to_string();
    i += 1;
    while matches!(tokens.get(i), Some(Token::Dot)) {
        name = tokens.get(i + 1)?.name()?.to_string();
        i += 2;
    }
    // Bare words keep `schema.table` together; keep the table part.
    if let Some(pos) = name.rfind('.') {
        name = name[pos + 1..].to_string();
    }
    Some((name, i))
}

// ===== Statement parsing =====

#[derive(Debug)]
enum Statement {
    CreateTable(TableShape),
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Option<String>>>,
    },
    Other,
}

const COLUMN_CONSTRAINTS: &[&str] = &[
    "NOT",
    "NULL",
    "DEFAULT",
    "PRIMARY",
    "AUTO_INCREMENT",
    "AUTOINCREMENT",
    "IDENTITY",
    "UNIQUE",
    "REFERENCES",
    "CHECK",
    "COMMENT",
    "COLLATE",
    "CHARSET",
    "GENERATED",
    "CONSTRAINT",
    "ON",
    "KEY",
];

const TABLE_CONSTRAINTS: &[&str] = &[
    "PRIMARY",
    "CONSTRAINT",
    "UNIQUE",
    "KEY",
    "INDEX",
    "FOREIGN",
    "CHECK",
    "FULLTEXT",
    "SPATIAL",
];

fn parse_statement(tokens: &[Token]) -> Statement {
    match tokens.first() {
        Some(t) if t.is_kw("CREATE") => parse_create(tokens).unwrap_or(Statement::Other),
        Some(t) if t.is_kw("INSERT") || t.is_kw("REPLACE") => {
            parse_insert(tokens).unwrap_or(Statement::Other)
        }
        _ => Statement::Other,
    }
}

fn parse_create(tokens: &[Token]) -> Option<Statement> {
    let mut i = 1;
    while let Some(t) = tokens.get(i) {
        if t.is_kw("TABLE") {
            break;
        }
        if t.is_kw("OR")
            || t.is_kw("REPLACE")
            || t.is_kw("TEMPORARY")
            || t.is_kw("TEMP")
            || t.is_kw("UNLOGGED")
        {
            i += 1;
        } else {
            return None;
        }
    }
    i += 1;
    if tokens.get(i).map_or(false, |t| t.is_kw("IF")) {
        i += 3; // IF NOT EXISTS
    }
    let (name, next) = parse_name(tokens, i)?;
    if tokens.get(next) != Some(&Token::LParen) {
        return None;
    }
    let close = matching_paren(tokens, next)?;

    let mut shape = TableShape {
        name,
        columns: Vec::new(),
        primary_key: Vec::new(),
    };

    for def in split_top_level(&tokens[next + 1..close]) {
        let first = match def.first() {
            Some(first) => first,
            None => continue,
        };
        if TABLE_CONSTRAINTS.iter().any(|kw| first.is_kw(kw)) {
            if let Some(pk) = table_primary_key(def) {
                shape.primary_key.extend(pk);
            }
            continue;
        }
        if let Some(column) = parse_column(def) {
            if column.primary_key {
                shape.primary_key.push(column.name.clone());
            }
            shape.columns.push(column);
        }
    }

    shape.primary_key.dedup();
    for column in &mut shape.columns {
        if shape.primary_key.contains(&column.name) {
            column.primary_key = true;
            column.nullable = false;
        }
    }

    Some(Statement::CreateTable(shape))
}

/// Columns of a table-level `[CONSTRAINT x] PRIMARY KEY (...)`.
fn table_primary_key(def: &[Token]) -> Option<Vec<String>> {
    let pos = def
        .windows(2)
        .position(|w| w[0].is_kw("PRIMARY") && w[1].is_kw("KEY"))?;
    let open = def.iter().skip(pos).position(|t| *t == Token::LParen)? + pos;
    let close = matching_paren(def, open)?;
    Some(
        split_top_level(&def[open + 1..close])
            .into_iter()
            .filter_map(|part| part.first().and_then(|t| t.name()))
            .map(normalize_field_name)
            .collect(),
    )
}

fn parse_column(def: &[Token]) -> Option<ColumnShape> {
    let source_name = def.first()?.name()?.to_string();

    let mut i = 1;
    let type_start = i;
    while i < def.len() {
        let t = &def[i];
        let charset = t.is_kw("CHARACTER") && def.get(i + 1).map_or(false, |n| n.is_kw("SET"));
        if charset || COLUMN_CONSTRAINTS.iter().any(|kw| t.is_kw(kw)) {
            break;
        }
        if *t == Token::LParen {
            i = matching_paren(def, i).map_or(def.len(), |c| c + 1);
        } else {
            i += 1;
        }
    }
    let declared_type = render(&def[type_start..i]);

    let mut nullable = true;
    let mut default = None;
    let mut primary_key = false;
    let lower_type = declared_type.to_lowercase();
    let mut auto_increment = lower_type.contains("serial");

    while i < def.len() {
        let t = &def[i];
        if t.is_kw("NOT") && def.get(i + 1).map_or(false, |n| n.is_kw("NULL")) {
            nullable = false;
            i += 2;
            continue;
        }
        if t.is_kw("PRIMARY") && def.get(i + 1).map_or(false, |n| n.is_kw("KEY")) {
            primary_key = true;
            nullable = false;
            i += 2;
            continue;
        }
        if t.is_kw("AUTO_INCREMENT") || t.is_kw("AUTOINCREMENT") || t.is_kw("IDENTITY") {
            auto_increment = true;
        }
        if t.is_kw("DEFAULT") {
            if let Some(value) = def.get(i + 1) {
                let (text, skip) = match value {
                    Token::Str(s) => (s.clone(), 2),
                    Token::LParen => {
                        let close = matching_paren(def, i + 1).unwrap_or(def.len() - 1);
                        (render(&def[i + 2..close]), close + 1 - i)
                    }
                    Token::Sym('-') => match def.get(i + 2) {
                        Some(Token::Word(w)) => (format!("-{}", w), 3),
                        _ => ("-".to_string(), 2),
                    },
                    other => (render(std::slice::from_ref(other)), 2),
                };
                default = if text.eq_ignore_ascii_case("null") && !matches!(value, Token::Str(_)) {
                    None
                } else {
                    Some(text)
                };
                i += skip;
                continue;
            }
        }
        i += 1;
    }

    Some(ColumnShape {
        name: normalize_field_name(&source_name),
        primitive: map_declared_type(&declared_type),
        source_name,
        declared_type,
        nullable,
        default,
        auto_increment,
        primary_key,
    })
}

fn parse_insert(tokens: &[Token]) -> Option<Statement> {
    let mut i = 1;
    while let Some(t) = tokens.get(i) {
        if t.is_kw("INTO") {
            i += 1;
            break;
        }
        if t.is_kw("IGNORE")
            || t.is_kw("LOW_PRIORITY")
            || t.is_kw("DELAYED")
            || t.is_kw("HIGH_PRIORITY")
        {
            i += 1;
        } else {
            break;
        }
    }
    let (table, mut i) = parse_name(tokens, i)?;

    let mut columns = None;
    if tokens.get(i) == Some(&Token::LParen) {
        let close = matching_paren(tokens, i)?;
        columns = Some(
            split_top_level(&tokens[i + 1..close])
                .into_iter()
                .filter_map(|part| part.first().and_then(|t| t.name()).map(str::to_string))
                .collect(),
        );
        i = close + 1;
    }

    if !tokens.get(i).map_or(false, |t| t.is_kw("VALUES") || t.is_kw("VALUE")) {
        return None;
    }
    i += 1;

    let mut rows = Vec::new();
    while tokens.get(i) == Some(&Token::LParen) {
        let close = matching_paren(tokens, i)?;
        let row = split_top_level(&tokens[i + 1..close])
            .into_iter()
            .map(value_of)
            .collect();
        rows.push(row);
        i = close + 1;
        if tokens.get(i) == Some(&Token::Comma) {
            i += 1;
        } else {
            break;
        }
    }

    Some(Statement::Insert {
        table,
        columns,
        rows,
    })
}

fn value_of(tokens: &[Token]) -> Option<String> {
    match tokens {
        [] => Some(String::new()),
        [Token::Str(s)] => Some(s.clone()),
        [Token::Ident(s)] => Some(s.clone()),
        [t] if t.is_kw("NULL") => None,
        [Token::Word(w)] => Some(w.clone()),
        other => Some(render(other)),
    }
}

// ===== Decoder =====

/// Streaming decoder for SQL dump scripts.
pub struct ScriptDecoder<R: BufRead> {
    reader: R,
    splitter: StatementSplitter,
    ready: VecDeque<(String, u64)>,
    shapes: Vec<TableShape>,
    target: Option<String>,
    locked: Option<String>,
    headers: Vec<String>,
    source_names: Vec<String>,
    pending: VecDeque<Result<Record>>,
    column_tolerance: Option<usize>,
    position: u64,
    eof: bool,
}

impl ScriptDecoder<BufReader<File>> {
    /// Open a SQL dump.
    pub fn open(path: &Path, config: &DecoderConfig) -> Result<Self> {
        check_source(path, config)?;
        let file = File::open(path)
            .map_err(|e| MigrateError::unreadable(path.display().to_string(), e.to_string()))?;
        info!("Opened {} as SQL script", path.display());
        Ok(Self::from_reader(BufReader::new(file), config))
    }
}

impl<R: BufRead> ScriptDecoder<R> {
    pub fn from_reader(reader: R, config: &DecoderConfig) -> Self {
        Self {
            reader,
            splitter: StatementSplitter::default(),
            ready: VecDeque::new(),
            shapes: Vec::new(),
            target: config.table.clone(),
            locked: None,
            headers: Vec::new(),
            source_names: Vec::new(),
            pending: VecDeque::new(),
            column_tolerance: config.column_tolerance,
            position: 0,
            eof: false,
        }
    }

    /// Table the decoder is emitting records for.
    pub fn table(&self) -> Option<&str> {
        self.locked.as_deref()
    }

    fn next_statement(&mut self) -> Result<Option<(String, u64)>> {
        let mut line = String::new();
        while self.ready.is_empty() {
            if self.eof {
                return Ok(None);
            }
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                self.eof = true;
                if let Some(rest) = self.splitter.finish() {
                    self.ready.push_back(rest);
                }
            } else {
                self.ready.extend(self.splitter.feed_line(&line));
            }
        }
        Ok(self.ready.pop_front())
    }

    fn wants(&self, table: &str) -> bool {
        match (&self.target, &self.locked) {
            (Some(target), _) => target.eq_ignore_ascii_case(table),
            (None, Some(locked)) => locked.eq_ignore_ascii_case(table),
            (None, None) => true,
        }
    }

    fn lock(&mut self, table: &str, columns: Option<&[String]>, width: usize) {
        info!("Reading records from table {}", table);
        self.locked = Some(table.to_string());
        let shape = self
            .shapes
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(table));
        let source: Vec<String> = match (columns, shape) {
            (Some(cols), _) => cols.to_vec(),
            (None, Some(shape)) => shape.columns.iter().map(|c| c.source_name.clone()).collect(),
            (None, None) => (1..=width).map(|i| format!("column_{}", i)).collect(),
        };
        self.headers = source.iter().map(|s| normalize_field_name(s)).collect();
        self.source_names = source;
    }

    fn handle_statement(&mut self, stmt: &str, line: u64) {
        match parse_statement(&lex(stmt)) {
            Statement::CreateTable(shape) => {
                debug!(
                    "Table shape {} ({} columns)",
                    shape.name,
                    shape.columns.len()
                );
                self.shapes.push(shape);
            }
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                if !self.wants(&table) {
                    debug!("Skipping INSERT into {}", table);
                    return;
                }
                if self.locked.is_none() {
                    let width = rows.first().map(|r| r.len()).unwrap_or(0);
                    self.lock(&table, columns.as_deref(), width);
                }
                let names: Vec<String> = match &columns {
                    Some(cols) => cols.iter().map(|c| normalize_field_name(c)).collect(),
                    None => self.headers.clone(),
                };
                for (name, source) in names.iter().zip(columns.iter().flatten()) {
                    if !self.headers.contains(name) {
                        self.headers.push(name.clone());
                        self.source_names.push(source.clone());
                    }
                }
                for values in rows {
                    let record_number = self.position + self.pending.len() as u64;
                    let provenance = Provenance::at(record_number)
                        .with_line(line)
                        .with_entity(table.clone());
                    let record = self.build_record(&names, values, provenance);
                    self.pending.push_back(record);
                }
            }
            Statement::Other => {}
        }
    }

    fn build_record(
        &self,
        names: &[String],
        mut values: Vec<Option<String>>,
        provenance: Provenance,
    ) -> Result<Record> {
        if values.len() != names.len() {
            let diff = values.len().abs_diff(names.len());
            if let Some(tolerance) = self.column_tolerance {
                if diff > tolerance {
                    return Err(MigrateError::decode(
                        format!(
                            "tuple has {} value(s) for {} column(s) (tolerance {})",
                            values.len(),
                            names.len(),
                            tolerance
                        ),
                        provenance,
                    ));
                }
            }
            values.resize(names.len(), None);
        }

        let ordered = self.headers.iter().map(|h| {
            let value = names
                .iter()
                .position(|n| n == h)
                .and_then(|idx| values[idx].take());
            (h.clone(), value)
        });
        Ok(Record::from_pairs(ordered.collect::<Vec<_>>(), provenance))
    }
}

impl<R: BufRead + Send> Decoder for ScriptDecoder<R> {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Script
    }

    fn header_names(&self) -> &[String] {
        &self.headers
    }

    fn source_names(&self) -> &[String] {
        &self.source_names
    }

    fn entity_hint(&self) -> Option<&str> {
        self.locked.as_deref().or(self.target.as_deref())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                self.position += 1;
                return item.map(Some);
            }
            match self.next_statement()? {
                Some((stmt, line)) => self.handle_statement(&stmt, line),
                None => return Ok(None),
            }
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn table_shapes(&self) -> &[TableShape] {
        &self.shapes
    }
}

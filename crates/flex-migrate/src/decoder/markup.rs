//! Streaming XML decoder.
//!
//! Reads element by element with `quick-xml`; the document tree is never built.
//! DOCTYPE blocks are skipped, so custom entities are never defined, let alone
//! expanded. Only the five predefined entities and numeric character references
//! are resolved; anything else stays as literal text.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info, warn};

use super::{check_source, Decoder};
use crate::config::DecoderConfig;
use crate::core::naming::normalize_field_name;
use crate::core::{Provenance, Record, SourceKind};
use crate::error::{MigrateError, Result};

/// One extracted field before ordering: (normalized name, source name, value).
type RawField = (String, String, Option<String>);

/// Streaming decoder for hierarchical markup.
pub struct MarkupDecoder<R: BufRead> {
    reader: Reader<R>,
    record_element: Option<String>,
    allow_dtd: bool,
    headers: Vec<String>,
    source_names: Vec<String>,
    depth: usize,
    position: u64,
    finished: bool,
}

impl MarkupDecoder<BufReader<File>> {
    /// Open a markup file.
    pub fn open(path: &Path, config: &DecoderConfig) -> Result<Self> {
        check_source(path, config)?;
        let file = File::open(path)
            .map_err(|e| MigrateError::unreadable(path.display().to_string(), e.to_string()))?;
        info!("Opened {} as markup", path.display());
        Ok(Self::from_reader(BufReader::new(file), config))
    }
}

impl<R: BufRead> MarkupDecoder<R> {
    pub fn from_reader(reader: R, config: &DecoderConfig) -> Self {
        let mut reader = Reader::from_reader(reader);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            record_element: config.record_element.clone(),
            allow_dtd: config.allow_dtd,
            headers: Vec::new(),
            source_names: Vec::new(),
            depth: 0,
            position: 0,
            finished: false,
        }
    }

    /// Record element in use (configured or detected).
    pub fn record_element(&self) -> Option<&str> {
        self.record_element.as_deref()
    }

    fn offset(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    fn provenance(&self, offset: u64) -> Provenance {
        let p = Provenance::at(self.position).with_offset(offset);
        match self.record_element {
            Some(ref name) => p.with_entity(name.clone()),
            None => p,
        }
    }

    /// Whether an element opening at `depth` starts a record.
    fn starts_record(&mut self, name: &str, depth: usize) -> bool {
        match self.record_element {
            Some(ref wanted) => wanted == name,
            None if depth == 2 => {
                debug!("Detected record element <{}>", name);
                self.record_element = Some(name.to_string());
                true
            }
            None => false,
        }
    }

    /// Skip a DOCTYPE block when allowed, otherwise reject the document.
    fn check_doctype(&mut self, offset: u64) -> Result<()> {
        if self.allow_dtd {
            debug!("DOCTYPE declaration skipped; entities are not expanded");
            return Ok(());
        }
        warn!("Rejecting DOCTYPE declaration at byte {}", offset);
        Err(self.malformed(
            "DOCTYPE declarations are disabled (set allow_dtd to skip them)".to_string(),
            offset,
        ))
    }

    fn malformed(&mut self, message: String, offset: u64) -> MigrateError {
        self.finished = true;
        let provenance = self.provenance(offset);
        self.position += 1;
        MigrateError::decode(message, provenance)
    }

    /// Read the body of a record whose start tag has just been consumed.
    fn read_record_body(&mut self, name: &str, offset: u64) -> Result<Vec<RawField>> {
        let mut fields: Vec<RawField> = Vec::new();
        let mut path: Vec<String> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        let mut has_children: Vec<bool> = Vec::new();
        let mut own_text = String::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let event = match self.reader.read_event_into(&mut buf) {
                Ok(event) => event,
                Err(e) => return Err(self.malformed(format!("malformed markup: {}", e), offset)),
            };
            match event {
                Event::Start(e) => {
                    if let Some(flag) = has_children.last_mut() {
                        *flag = true;
                    }
                    path.push(local_name(&e));
                    push_attributes(&mut fields, &path, &e);
                    texts.push(String::new());
                    has_children.push(false);
                }
                Event::Empty(e) => {
                    if let Some(flag) = has_children.last_mut() {
                        *flag = true;
                    }
                    path.push(local_name(&e));
                    let before = fields.len();
                    push_attributes(&mut fields, &path, &e);
                    if fields.len() == before {
                        push_field(&mut fields, &path.join("_"), Some(String::new()));
                    }
                    path.pop();
                }
                Event::Text(t) => {
                    let text = unescape_lenient(&String::from_utf8_lossy(&t));
                    match texts.last_mut() {
                        Some(current) => current.push_str(&text),
                        None => own_text.push_str(&text),
                    }
                }
                Event::CData(c) => {
                    let text = String::from_utf8_lossy(&c).into_owned();
                    match texts.last_mut() {
                        Some(current) => current.push_str(&text),
                        None => own_text.push_str(&text),
                    }
                }
                Event::End(_) => {
                    if path.is_empty() {
                        break;
                    }
                    let text = texts.pop().unwrap_or_default();
                    let nested = has_children.pop().unwrap_or(false);
                    let key = path.join("_");
                    path.pop();
                    let text = text.trim();
                    if !nested || !text.is_empty() {
                        push_field(&mut fields, &key, Some(text.to_string()));
                    }
                }
                Event::DocType(_) => self.check_doctype(offset)?,
                Event::Eof => {
                    return Err(self.malformed(
                        format!("document ended inside <{}>", name),
                        offset,
                    ));
                }
                _ => {}
            }
        }

        let own_text = own_text.trim();
        if !own_text.is_empty() {
            push_field(&mut fields, "value", Some(own_text.to_string()));
        }
        Ok(fields)
    }

    /// Order fields by first appearance across the stream.
    fn finish_record(&mut self, fields: Vec<RawField>, offset: u64) -> Record {
        for (name, source, _) in &fields {
            if !self.headers.contains(name) {
                self.headers.push(name.clone());
                self.source_names.push(source.clone());
            }
        }
        let provenance = self.provenance(offset);
        self.position += 1;

        let mut fields = fields;
        let ordered = self.headers.iter().map(|h| {
            let value = fields
                .iter_mut()
                .find(|(name, _, _)| name == h)
                .and_then(|(_, _, value)| value.take());
            (h.clone(), value)
        });
        Record::from_pairs(ordered.collect::<Vec<_>>(), provenance)
    }
}

impl<R: BufRead + Send> Decoder for MarkupDecoder<R> {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Markup
    }

    fn header_names(&self) -> &[String] {
        &self.headers
    }

    fn source_names(&self) -> &[String] {
        &self.source_names
    }

    fn entity_hint(&self) -> Option<&str> {
        self.record_element.as_deref()
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let offset = self.offset();
            let event = match self.reader.read_event_into(&mut buf) {
                Ok(event) => event,
                Err(e) => return Err(self.malformed(format!("malformed markup: {}", e), offset)),
            };
            match event {
                Event::Start(e) => {
                    self.depth += 1;
                    let name = local_name(&e);
                    if self.starts_record(&name, self.depth) {
                        let mut fields = Vec::new();
                        push_attributes(&mut fields, &[], &e);
                        let body = self.read_record_body(&name, offset)?;
                        self.depth -= 1;
                        fields.extend(body);
                        return Ok(Some(self.finish_record(fields, offset)));
                    }
                }
                Event::Empty(e) => {
                    let name = local_name(&e);
                    if self.starts_record(&name, self.depth + 1) {
                        let mut fields = Vec::new();
                        push_attributes(&mut fields, &[], &e);
                        return Ok(Some(self.finish_record(fields, offset)));
                    }
                }
                Event::End(_) => self.depth = self.depth.saturating_sub(1),
                Event::DocType(_) => self.check_doctype(offset)?,
                Event::Eof => {
                    self.finished = true;
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn position(&self) -> u64 {
        self.position
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn push_field(fields: &mut Vec<RawField>, source: &str, value: Option<String>) {
    let name = normalize_field_name(source);
    if fields.iter().any(|(n, _, _)| *n == name) {
        return;
    }
    fields.push((name, source.to_string(), value));
}

/// Attributes become fields; `path` prefixes them for nested elements.
fn push_attributes(fields: &mut Vec<RawField>, path: &[String], e: &BytesStart<'_>) {
    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => {
                debug!("Skipping malformed attribute: {}", err);
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let local = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = unescape_lenient(&String::from_utf8_lossy(&attr.value));
        let source = if path.is_empty() {
            local
        } else {
            format!("{}_{}", path.join("_"), local)
        };
        push_field(fields, &source, Some(value));
    }
}

/// Resolve predefined and numeric entity references, leaving unknown ones literal.
fn unescape_lenient(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        match after.find(';') {
            Some(semi) if semi > 0 && semi <= 32 => {
                let name = &after[..semi];
                match resolve_entity(name) {
                    Some(c) => out.push(c),
                    None => {
                        out.push('&');
                        out.push_str(name);
                        out.push(';');
                    }
                }
                rest = &after[semi + 1..];
            }
            _ => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok()?
            } else {
                return None;
            };
            char::from_u32(code)
        }
    }
}

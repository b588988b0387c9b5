//! Streaming source decoders.
//!
//! Every decoder turns its input into a finite, single-pass sequence of
//! [`Record`]s. Nothing here loads a whole source into memory; re-reading a
//! source means opening a fresh decoder.

mod markup;
mod script;
mod sql_types;
mod tabular;

pub use markup::MarkupDecoder;
pub use script::{ColumnShape, ScriptDecoder, TableShape};
pub use sql_types::{map_declared_type, DeclaredType};
pub use tabular::{detect_delimiter, TabularDecoder};

use std::path::Path;

use tracing::debug;

use crate::config::DecoderConfig;
use crate::core::{Record, SourceKind};
use crate::error::{MigrateError, Result};

/// A lazy record source.
pub trait Decoder: Send {
    /// Kind of source this decoder reads.
    fn source_kind(&self) -> SourceKind;

    /// Normalized field names in canonical order, once structure is known.
    fn header_names(&self) -> &[String];

    /// Field names as they appeared in the source, parallel to [`header_names`](Self::header_names).
    fn source_names(&self) -> &[String] {
        self.header_names()
    }

    /// Entity the records belong to (file stem, element or table name).
    fn entity_hint(&self) -> Option<&str> {
        None
    }

    /// Pull the next record.
    ///
    /// A malformed record yields [`MigrateError::Decode`] and still advances
    /// [`position`](Self::position); the stream continues after it.
    fn next_record(&mut self) -> Result<Option<Record>>;

    /// Records consumed so far (well-formed or not). This is the resume cursor.
    fn position(&self) -> u64;

    /// Advance until `position` records have been consumed.
    ///
    /// The default re-reads sequentially and ignores malformed records on the way,
    /// since they were already accounted for by the run that produced the cursor.
    fn skip_to(&mut self, position: u64) -> Result<()> {
        while self.position() < position {
            match self.next_record() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(MigrateError::Decode { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        debug!("Skipped to record {}", self.position());
        Ok(())
    }

    /// Total number of records, when knowable up front.
    fn estimated_total(&self) -> Option<u64> {
        None
    }

    /// Table shapes extracted from the source (relational scripts only).
    fn table_shapes(&self) -> &[TableShape] {
        &[]
    }

    /// Iterate the remaining records.
    fn records(&mut self) -> Records<'_, Self>
    where
        Self: Sized,
    {
        Records { decoder: self }
    }
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn source_kind(&self) -> SourceKind {
        (**self).source_kind()
    }

    fn header_names(&self) -> &[String] {
        (**self).header_names()
    }

    fn source_names(&self) -> &[String] {
        (**self).source_names()
    }

    fn entity_hint(&self) -> Option<&str> {
        (**self).entity_hint()
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        (**self).next_record()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn skip_to(&mut self, position: u64) -> Result<()> {
        (**self).skip_to(position)
    }

    fn estimated_total(&self) -> Option<u64> {
        (**self).estimated_total()
    }

    fn table_shapes(&self) -> &[TableShape] {
        (**self).table_shapes()
    }
}

/// Iterator adapter over a decoder.
pub struct Records<'a, D: ?Sized> {
    decoder: &'a mut D,
}

impl<'a, D: Decoder + ?Sized> Iterator for Records<'a, D> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_record().transpose()
    }
}

/// Source kind implied by a file extension.
pub fn kind_from_extension(path: &Path) -> Option<SourceKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "csv" | "tsv" | "psv" | "txt" | "dat" => Some(SourceKind::Tabular),
        "xml" => Some(SourceKind::Markup),
        "sql" => Some(SourceKind::Script),
        _ => None,
    }
}

/// Check that `path` exists, is a file, and fits within `max_source_bytes`.
///
/// Returns the file size.
pub(crate) fn check_source(path: &Path, config: &DecoderConfig) -> Result<u64> {
    let display = path.display().to_string();
    let meta = std::fs::metadata(path).map_err(|e| MigrateError::unreadable(&display, e.to_string()))?;
    if !meta.is_file() {
        return Err(MigrateError::unreadable(display, "not a regular file"));
    }
    let size = meta.len();
    if let Some(max) = config.max_source_bytes {
        if size > max {
            return Err(MigrateError::unreadable(
                display,
                format!("source is {} bytes, limit is {} bytes", size, max),
            ));
        }
    }
    Ok(size)
}

/// Open a decoder for `path`.
///
/// The decoder is chosen by `kind` when given, otherwise by file extension.
pub fn open_path(
    path: impl AsRef<Path>,
    kind: Option<SourceKind>,
    config: &DecoderConfig,
) -> Result<Box<dyn Decoder>> {
    let path = path.as_ref();
    let kind = match kind.or_else(|| kind_from_extension(path)) {
        Some(kind) => kind,
        None => {
            return Err(MigrateError::unreadable(
                path.display().to_string(),
                "cannot infer source kind from extension",
            ))
        }
    };

    debug!("Opening {} as {} source", path.display(), kind);
    Ok(match kind {
        SourceKind::Tabular => Box::new(TabularDecoder::open(path, config)?),
        SourceKind::Markup => Box::new(MarkupDecoder::open(path, config)?),
        SourceKind::Script => Box::new(ScriptDecoder::open(path, config)?),
    })
}

/// File stem used as an entity hint.
pub(crate) fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

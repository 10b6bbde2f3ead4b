//! Single-pass entity sources and the chunking adapter.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::types::Document;

/// Wraps already materialized documents as an infallible source.
pub fn from_documents<I>(docs: I) -> impl Iterator<Item = Result<Document>>
where
    I: IntoIterator<Item = Document>,
{
    docs.into_iter().map(Ok)
}

/// Reads one JSON object per line. Blank lines are skipped.
///
/// Malformed lines surface as [`GraphError::InvalidDocument`] naming the
/// 1-based line number.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    reader: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> JsonLinesSource<R> {
    /// Wraps a buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }
}

impl JsonLinesSource<BufReader<File>> {
    /// Opens a JSON-lines file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> Iterator for JsonLinesSource<R> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => self.line += 1,
                Err(err) => return Some(Err(err.into())),
            }
            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }
            let line = self.line;
            return Some(match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(doc)) => Ok(doc),
                Ok(_) => Err(GraphError::InvalidDocument(format!(
                    "line {line}: expected a JSON object"
                ))),
                Err(err) => Err(GraphError::InvalidDocument(format!("line {line}: {err}"))),
            });
        }
    }
}

/// Partitions a fallible sequence into groups of at most `size` items.
///
/// The last group may be shorter. The first error ends the sequence; items
/// gathered for the failing group are dropped.
#[derive(Debug)]
pub struct Chunks<I> {
    inner: I,
    size: usize,
    done: bool,
}

impl<I> Chunks<I> {
    /// Wraps an iterator. A `size` of zero is treated as one.
    pub fn new(inner: I, size: usize) -> Self {
        Self {
            inner,
            size: size.max(1),
            done: false,
        }
    }
}

impl<I, T> Iterator for Chunks<I>
where
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.size.min(4096));
        while chunk.len() < self.size {
            match self.inner.next() {
                Some(Ok(item)) => chunk.push(item),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

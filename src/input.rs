/// Input sources for the scanner.
///
/// Input is a stack: the current translation unit's file at the bottom,
/// `include`d files pushed on top, and one-line string sources pushed for
/// each `define` replay.  The scanner always reads from the top of the
/// stack; exhausted sources pop and scanning continues in the source below.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{FatalError, PResult};

enum Backing {
    /// A source file, pre-split into lines.
    File { lines: Vec<String>, next: usize },
    /// One line of replayed `define` text.
    Str,
}

struct Entry {
    backing: Backing,
    pub file: String,
    pub line: u32,
    buf: String,
    pos: usize,
}

#[derive(Default)]
pub struct InputStack {
    stack: Vec<Entry>,
    pub include_path: Vec<PathBuf>,
}

impl InputStack {
    pub fn new() -> Self {
        InputStack::default()
    }

    /// Resolve `name` against the current directory and the include path.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let direct = PathBuf::from(name);
        if direct.is_file() {
            return Some(direct);
        }
        for dir in &self.include_path {
            let p = dir.join(name);
            if p.is_file() {
                return Some(p);
            }
        }
        None
    }

    /// Push a file source.  With `required`, a missing file is fatal.
    pub fn push_file(&mut self, name: &str, required: bool) -> PResult<bool> {
        let Some(path) = self.resolve(name) else {
            if required {
                return Err(FatalError::OpenFailed {
                    path: name.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }
                .into());
            }
            return Ok(false);
        };
        let contents = fs::read_to_string(&path).map_err(|e| FatalError::OpenFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        self.push_file_text(name, &contents);
        Ok(true)
    }

    /// Push in-memory text as a file-like source (used by the library API
    /// and the tests).
    pub fn push_file_text(&mut self, name: &str, contents: &str) {
        let lines: Vec<String> = contents.lines().map(|l| l.to_string()).collect();
        self.stack.push(Entry {
            backing: Backing::File { lines, next: 0 },
            file: name.to_string(),
            line: 0,
            buf: String::new(),
            pos: 0,
        });
    }

    /// Push a string source (macro replay).  It inherits the current
    /// source position for diagnostics.
    pub fn push_str(&mut self, text: &str) {
        let (file, line) = (self.cur_file(), self.cur_line());
        self.stack.push(Entry {
            backing: Backing::Str,
            file,
            line,
            buf: text.to_string(),
            pos: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn top_is_str(&self) -> bool {
        matches!(
            self.stack.last(),
            Some(Entry {
                backing: Backing::Str,
                ..
            })
        )
    }

    /// Pop the current source.  When a file source finishes, the rest of
    /// the parent file's current line is discarded (the scanner resumes on
    /// the parent's next line); string sources resume their parent
    /// mid-line.
    pub fn pop(&mut self) -> bool {
        let was_file = matches!(
            self.stack.pop(),
            Some(Entry {
                backing: Backing::File { .. },
                ..
            })
        );
        if was_file {
            if let Some(top) = self.stack.last_mut() {
                if matches!(top.backing, Backing::File { .. }) {
                    top.pos = top.buf.len();
                }
            }
        }
        !self.stack.is_empty()
    }

    pub fn cur_file(&self) -> String {
        self.stack
            .iter()
            .rev()
            .map(|e| e.file.clone())
            .next()
            .unwrap_or_default()
    }

    pub fn cur_line(&self) -> u32 {
        self.stack.iter().rev().map(|e| e.line).next().unwrap_or(0)
    }

    // ── character access within the current line ────────────────────────

    pub fn at_line_end(&self) -> bool {
        match self.stack.last() {
            Some(e) => e.pos >= e.buf.len(),
            None => true,
        }
    }

    pub fn cur(&self) -> Option<u8> {
        self.stack
            .last()
            .and_then(|e| e.buf.as_bytes().get(e.pos).copied())
    }

    pub fn peek(&self, k: usize) -> Option<u8> {
        self.stack
            .last()
            .and_then(|e| e.buf.as_bytes().get(e.pos + k).copied())
    }

    pub fn advance(&mut self) -> Option<u8> {
        let e = self.stack.last_mut()?;
        let c = e.buf.as_bytes().get(e.pos).copied();
        if c.is_some() {
            e.pos += 1;
        }
        c
    }

    /// Skip forward while `pred` holds.
    pub fn skip_while(&mut self, pred: impl Fn(u8) -> bool) {
        while let Some(c) = self.cur() {
            if !pred(c) {
                break;
            }
            self.advance();
        }
    }

    pub fn skip_to_line_end(&mut self) {
        if let Some(e) = self.stack.last_mut() {
            e.pos = e.buf.len();
        }
    }

    /// Load the next raw line of the topmost file source into its buffer.
    /// Returns `false` at end of file (the source is left to be popped by
    /// the caller).  String sources never produce another line.
    pub fn next_file_line(&mut self) -> bool {
        let Some(e) = self.stack.last_mut() else {
            return false;
        };
        match &mut e.backing {
            Backing::Str => false,
            Backing::File { lines, next } => {
                if *next >= lines.len() {
                    return false;
                }
                e.buf = lines[*next].clone();
                e.pos = 0;
                *next += 1;
                e.line += 1;
                true
            }
        }
    }

    /// The remainder of the current line (used by the preprocessor).
    pub fn line_rest(&self) -> &str {
        match self.stack.last() {
            Some(e) => &e.buf[e.pos.min(e.buf.len())..],
            None => "",
        }
    }

    pub fn set_line_consumed(&mut self) {
        self.skip_to_line_end();
    }
}

/// Default source-file extension.
pub fn with_default_ext(name: &str) -> String {
    if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{}.sc", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_sources_inherit_position() {
        let mut input = InputStack::new();
        input.push_file_text("room.sc", "line one\nline two\n");
        assert!(input.next_file_line());
        assert!(input.next_file_line());
        input.push_str("expanded");
        assert_eq!(input.cur_file(), "room.sc");
        assert_eq!(input.cur_line(), 2);
        assert_eq!(input.cur(), Some(b'e'));
    }

    #[test]
    fn files_read_line_by_line() {
        let mut input = InputStack::new();
        input.push_file_text("a.sc", "alpha\nbeta");
        assert!(input.next_file_line());
        assert_eq!(input.line_rest(), "alpha");
        input.skip_to_line_end();
        assert!(input.at_line_end());
        assert!(input.next_file_line());
        assert_eq!(input.line_rest(), "beta");
        assert!(!input.next_file_line());
    }

    #[test]
    fn default_extension() {
        assert_eq!(with_default_ext("rm001"), "rm001.sc");
        assert_eq!(with_default_ext("rm001.sh"), "rm001.sh");
    }
}

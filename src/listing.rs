/// Human-readable `.sl` listing of the emitted code.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::{FatalError, PResult};

pub struct Listing {
    w: BufWriter<File>,
    path: PathBuf,
}

impl Listing {
    pub fn open(source_name: &str, out_dir: &Path, script: i32) -> PResult<Self> {
        let stem = Path::new(source_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_name.to_string());
        let path = out_dir.join(format!("{}.sl", stem));
        let file = File::create(&path).map_err(|e| FatalError::OpenFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut l = Listing {
            w: BufWriter::new(file),
            path,
        };
        l.note(&format!(
            "\n\t\t\t\tListing of {}:\t[script {}]\n",
            source_name, script as u16
        ));
        l.note("LINE/\tOFFSET\tCODE\t\t\t\tNAME");
        l.note("LABEL\t(HEX)\n");
        Ok(l)
    }

    /// One free-form line.
    pub fn note(&mut self, s: &str) {
        let _ = writeln!(self.w, "{}", s);
    }

    /// A code line prefixed with its stream offset.
    pub fn as_code(&mut self, ofs: usize, s: &str) {
        let _ = writeln!(self.w, "\t\t{:5x}\t{}", ofs, s);
    }

    /// A string from the text pool, broken at word boundaries.
    pub fn text(&mut self, ofs: usize, s: &str) {
        self.as_code(ofs, "text");
        let mut line = String::from("\"");
        let mut first = true;
        for word in s.split(' ') {
            if !first {
                line.push(' ');
            }
            first = false;
            if line.len() + word.len() > 80 {
                self.note(&line);
                line = String::new();
            }
            line.push_str(word);
        }
        line.push('"');
        self.note(&line);
    }

    /// The relocation table of a stream.
    pub fn fixups(&mut self, mut ofs: usize, entries: &[usize]) {
        self.note("\n\nFixups:");
        self.as_code(ofs, &format!("word\t${:x}", entries.len()));
        ofs += 2;
        for e in entries {
            self.as_code(ofs, &format!("word\t${:x}", e));
            ofs += 2;
        }
    }

    pub fn banner(&mut self, which: &str) {
        self.note(&format!(
            "----------------------\n-------- {} --------\n----------------------",
            which
        ));
    }

    /// Replay diagnostics into the listing in place.
    pub fn echo(&mut self, lines: &[String]) {
        for line in lines {
            self.note(line);
        }
    }

    pub fn close(mut self) {
        let _ = self.w.flush();
    }

    /// Discard the listing (no `-l`): remove the file.
    pub fn delete(self) {
        let path = self.path.clone();
        drop(self);
        let _ = std::fs::remove_file(path);
    }
}

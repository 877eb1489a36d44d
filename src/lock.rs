/// Cooperative lock on the class/selector database.
///
/// Concurrent compiles share the on-disk database, so a job takes an
/// exclusive lock by creating a well-known file before reading it, and
/// deletes the file on every exit path (the guard releases on drop,
/// including unwinds).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{FatalError, PResult};

const LOCK_FILE: &str = "$$$sc.lck";

pub struct DbLock {
    path: PathBuf,
    held: bool,
}

impl DbLock {
    /// Acquire the database lock.  With `skip`, locking is bypassed; with
    /// `abort_if_locked`, an existing lock is fatal instead of polled.
    pub fn acquire(skip: bool, abort_if_locked: bool, verbose: bool) -> PResult<DbLock> {
        let path = PathBuf::from(LOCK_FILE);
        if skip {
            return Ok(DbLock { path, held: false });
        }

        let mut waited = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if abort_if_locked {
                        return Err(FatalError::DatabaseLocked.into());
                    }
                    if !waited {
                        eprint!("Waiting for access to class database");
                        waited = true;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                    eprint!(".");
                    let _ = std::io::stderr().flush();
                }
                Err(e) => {
                    return Err(FatalError::OpenFailed {
                        path: path.display().to_string(),
                        source: e,
                    }
                    .into())
                }
            }
        }
        if waited {
            eprintln!();
        }
        if verbose {
            println!("Class database locked.");
        }

        Ok(DbLock { path, held: true })
    }

    pub fn release(&mut self) {
        if self.held {
            let _ = std::fs::remove_file(&self.path);
            self.held = false;
        }
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_mode_never_touches_the_filesystem() {
        let lock = DbLock::acquire(true, false, false).unwrap();
        assert!(!lock.held);
    }
}

/// quillc — compiler for the Quill adventure-script language.
///
/// Translates S-expression scripts into paired binary resources: a heap
/// image (variables, object templates, strings) and a hunk image
/// (bytecode, dispatch table, class dictionaries), maintaining the shared
/// class/selector database across compiles.
///
/// PIPELINE:
///   tokens → parse tree (per top-level form) → assembly-node graph
///   (heap + hunk streams) → offset stabilization → binary emission
///   (+ relocation tables) → cross-module database update.

pub mod anode;
pub mod ast;
pub mod bytecode;
pub mod chartype;
pub mod compiler;
pub mod database;
pub mod diagnostics;
pub mod errors;
pub mod expr;
pub mod input;
pub mod lexer;
pub mod listing;
pub mod lock;
pub mod object;
pub mod optimizer;
pub mod output;
pub mod parser;
pub mod selector;
pub mod session;
pub mod symbol;
pub mod symtab;
pub mod text;

use std::path::Path;

pub use errors::{FatalError, PResult, Unwind};
pub use parser::Parser;
pub use session::{Config, Session};

use colored::Colorize;

/// Parse an auxiliary database or header file (`selector`, `classdef`,
/// `system.sh`, ...) if it exists.  Returns whether the file was found.
pub fn parse_aux_file(sess: &mut Session, name: &str) -> PResult<bool> {
    let mut parser = Parser::new(sess);
    if !parser.lex.input.push_file(name, false)? {
        return Ok(false);
    }
    parser.parse()?;
    Ok(true)
}

/// Parse auxiliary content from memory (database round-trips, tests).
pub fn parse_aux_text(sess: &mut Session, name: &str, text: &str) -> PResult<()> {
    let mut parser = Parser::new(sess);
    parser.lex.input.push_file_text(name, text);
    parser.parse()?;
    Ok(())
}

/// Compile one translation unit from a source file on disk.
pub fn compile_file(sess: &mut Session, file: &str) -> PResult<()> {
    let source_name = input::with_default_ext(file);
    let text = std::fs::read_to_string(&source_name).map_err(|e| FatalError::OpenFailed {
        path: source_name.clone(),
        source: e,
    })?;
    compile_text(sess, &source_name, &text)
}

/// Compile one translation unit from in-memory source text.
pub fn compile_text(sess: &mut Session, source_name: &str, text: &str) -> PResult<()> {
    sess.start_unit();
    sess.diags.output(source_name);

    {
        let mut parser = Parser::new(sess);
        parser.lex.input.push_file_text(source_name, text);
        match parser.parse() {
            Ok(_) => {}
            Err(Unwind::Sync) => {}
            Err(fatal) => return Err(fatal),
        }
    }

    // Append the string pool to the heap image.
    sess.make_text();

    if sess.script == -1 {
        sess.error("No script number specified.  Can't write output files.");
    } else {
        if sess.config.list_code {
            sess.listing = Some(listing::Listing::open(
                source_name,
                &sess.config.out_dir,
                sess.script,
            )?);
        }
        output::assemble(sess, source_name)?;
    }

    // Replay this unit's diagnostics into the listing, then close it.
    let echo = sess.diags.take_echo();
    if let Some(mut l) = sess.listing.take() {
        l.echo(&echo);
        l.close();
    }

    if sess.diags.errors > 0 {
        let n = sess.diags.errors;
        sess.diags.output(&format!(
            "\t{}",
            format!("{} error{}.", n, if n == 1 { "" } else { "s" }).red()
        ));
    } else {
        sess.diags.output(&format!("\t{}", "No errors.".green()));
    }

    Ok(())
}

/// Run a whole compile job over the given source files, including the
/// database read/update cycle.  Returns the job's total error count.
pub fn run_job(sess: &mut Session, files: &[String]) -> PResult<u32> {
    // Read the shared database and the standard headers when present.
    for name in ["selector", "classdef", "system.sh", "game.sh"] {
        parse_aux_file(sess, name)?;
    }
    // Loading the database must never mark it dirty by itself.
    sess.seltbl.added = false;
    sess.classes.added = false;

    for file in files {
        compile_file(sess, file)?;
    }
    sess.diags.finish_job();

    // A partial build must not corrupt the shared class/selector state.
    if sess.diags.total_errors == 0 {
        database::update_database(sess)?;
        database::write_class_tbl(sess)?;
        if sess.config.write_offsets {
            database::write_prop_offsets(sess)?;
        }
    }

    Ok(sess.diags.total_errors)
}

/// Expand `@file` response-file arguments into the filenames they list.
pub fn expand_response_files(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for arg in args {
        if let Some(name) = arg.strip_prefix('@') {
            match std::fs::read_to_string(Path::new(name)) {
                Ok(text) => {
                    for line in text.lines() {
                        let line = line.trim();
                        if !line.is_empty() {
                            out.push(line.to_string());
                        }
                    }
                }
                Err(_) => out.push(arg.clone()),
            }
        } else {
            out.push(arg.clone());
        }
    }
    out
}

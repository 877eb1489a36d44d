/// quillc CLI.
/// Drives whole compile jobs: lock the database, read it, compile each
/// script in command-line order, then rewrite the cross-module state.

use std::path::PathBuf;

use clap::Parser as ClapParser;
use miette::Result;

use quillc::errors::FatalError;
use quillc::lock::DbLock;
use quillc::symbol::{Payload, SymType};
use quillc::{expand_response_files, run_job, Config, Session, Unwind};

// 64 MB stack: deeply nested expressions recurse through the parser and
// the lowering.
const STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(ClapParser)]
#[command(
    name = "quillc",
    version = "0.1.0",
    about = "The Quill script compiler",
    long_about = "quillc — compile Quill scripts (.sc) into heap/hunk resources and \
                  maintain the shared class and selector database.  An argument of the \
                  form @file names a response file listing further sources."
)]
struct Cli {
    /// Source files to compile, in order.
    #[arg(required = true)]
    files: Vec<String>,

    /// Abort the compile if the class database is locked
    #[arg(short = 'a')]
    abort_if_locked: bool,

    /// Include line-number debug records in the hunk
    #[arg(short = 'd')]
    debug_info: bool,

    /// Command-line define (e.g. -D MAC or -D MAC=1)
    #[arg(short = 'D', value_name = "NAME[=VAL]")]
    defines: Vec<String>,

    /// Maximum number of global or local variables
    #[arg(short = 'g', default_value_t = 750, value_name = "N")]
    max_vars: usize,

    /// Generate a code listing (.sl) per file
    #[arg(short = 'l')]
    list_code: bool,

    /// No auto-naming of objects
    #[arg(short = 'n')]
    no_auto_name: bool,

    /// Output directory
    #[arg(short = 'o', value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Output the property-offset vocabulary
    #[arg(short = 'O')]
    write_offsets: bool,

    /// Show forward-referenced selectors
    #[arg(short = 's')]
    show_selectors: bool,

    /// Don't lock the class database
    #[arg(short = 'u')]
    dont_lock: bool,

    /// Verbose output
    #[arg(short = 'v')]
    verbose: bool,

    /// Output words high-byte first (for big-endian targets)
    #[arg(short = 'w')]
    high_byte_first: bool,

    /// Turn off the branch shrink phase
    #[arg(short = 'z')]
    no_shrink: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = std::thread::Builder::new()
        .name("quillc-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(move || std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli))))
        .expect("failed to spawn quillc worker thread")
        .join();

    match result {
        Ok(Ok(outcome)) => match outcome {
            Ok(0) => Ok(()),
            Ok(_) => std::process::exit(1),
            Err(e) => {
                let report = miette::miette!("{}", e);
                eprintln!("Fatal: {:?}", report);
                std::process::exit(3);
            }
        },
        Ok(Err(payload)) | Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                format!("internal error (panic): {}", s)
            } else if let Some(s) = payload.downcast_ref::<String>() {
                format!("internal error (panic): {}", s)
            } else {
                "internal error: unexpected panic in quillc".to_string()
            };
            eprintln!("quillc crashed: {}", msg);
            std::process::exit(3);
        }
    }
}

fn run(cli: Cli) -> std::result::Result<u32, FatalError> {
    let files = expand_response_files(&cli.files);

    // `SINCLUDE` names the include-search directories.
    let mut include_path = Vec::new();
    if let Ok(env) = std::env::var("SINCLUDE") {
        for part in env.split(';').filter(|p| !p.is_empty()) {
            include_path.push(PathBuf::from(part.replace('\\', "/")));
        }
    }

    let config = Config {
        abort_if_locked: cli.abort_if_locked,
        include_debug_info: cli.debug_info,
        max_vars: cli.max_vars,
        list_code: cli.list_code,
        no_auto_name: cli.no_auto_name,
        out_dir: cli.out_dir.unwrap_or_else(|| PathBuf::from(".")),
        write_offsets: cli.write_offsets,
        show_selectors: cli.show_selectors,
        dont_lock: cli.dont_lock,
        verbose: cli.verbose,
        high_byte_first: cli.high_byte_first,
        no_shrink: cli.no_shrink,
        include_path,
    };

    let mut sess = Session::new(config);

    for spec in &cli.defines {
        install_command_line_define(&mut sess, spec)?;
    }

    // Lock the database for the whole job; the guard releases on every
    // exit path.
    let mut lock = DbLock::acquire(
        sess.config.dont_lock,
        sess.config.abort_if_locked,
        sess.config.verbose,
    )
    .map_err(unwrap_fatal)?;

    let total = run_job(&mut sess, &files).map_err(unwrap_fatal)?;

    lock.release();
    if sess.config.verbose {
        println!("Class database unlocked.");
    }

    Ok(total)
}

fn unwrap_fatal(u: Unwind) -> FatalError {
    match u {
        Unwind::Fatal(f) => f,
        Unwind::Sync => FatalError::Message("parse error escaped the recovery anchor".into()),
    }
}

/// `-D NAME[=VAL]`: install a compile-time define before any file is
/// read.
fn install_command_line_define(
    sess: &mut Session,
    spec: &str,
) -> std::result::Result<(), FatalError> {
    let (name, value) = match spec.split_once('=') {
        Some((n, v)) => (n, v),
        None => (spec, "1"),
    };
    if name.is_empty() {
        return Err(FatalError::Message(
            "-D flag used without symbol to define".into(),
        ));
    }
    if sess.syms.lookup(name).is_some() {
        return Err(FatalError::Message(format!(
            "'{}' has already been defined",
            name
        )));
    }
    let id = sess.syms.install_global(name, SymType::Define);
    sess.syms.get_mut(id).payload = Payload::Text(value.to_string());
    Ok(())
}

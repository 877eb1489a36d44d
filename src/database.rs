/// The shared class/selector database.
///
/// At job end (and only when the job compiled cleanly) the compiler
/// rewrites the cross-module state it mutated:
///   • `selector`  — S-expression list of every selector name and number
///   • `classdef`  — one differential class definition per class
///   • `classes`   — indented textual class hierarchy
///   • `<n>.voc`   — selector-name and class-table vocabulary resources,
///                   plus the optional property-offset vocabulary
///
/// The text manifests are the fixpoint of their own readers: parsing a
/// regenerated file and writing it again reproduces it byte for byte.

use std::fs;
use std::path::Path;

use crate::errors::{FatalError, PResult};
use crate::object::ObjectId;
use crate::output::{res_name, MemType, Resource};
use crate::selector::SEL_SUPER;
use crate::session::Session;

pub const SELECTOR_VOCAB: i32 = 997;
pub const CLASSTBL_VOCAB: i32 = 996;
pub const PROPOFS_VOCAB: i32 = 994;

const BAD_SELECTOR: &str = "BAD SELECTOR";

fn write_text(path: &Path, text: &str) -> PResult<()> {
    fs::write(path, text).map_err(|_| {
        FatalError::WriteFailed {
            path: path.display().to_string(),
        }
        .into()
    })
}

/// Rewrite whatever parts of the database this job changed.
pub fn update_database(sess: &mut Session) -> PResult<()> {
    if sess.seltbl.added {
        write_selector_file(sess)?;
        write_selector_vocab(sess)?;
    }
    if sess.classes.added {
        write_class_defs(sess)?;
        write_classes(sess)?;
    }
    sess.seltbl.added = false;
    sess.classes.added = false;
    Ok(())
}

/// The `selector` source file: every known selector name with its number.
pub fn selector_file_text(sess: &Session) -> String {
    let mut out = String::from("(selectors\n");
    for id in sess.syms.selector_ids() {
        let sym = sess.syms.get(id);
        out.push_str(&format!("\t{:<20} {}\n", sym.name, sym.val()));
    }
    out.push_str(")\n");
    out
}

pub fn write_selector_file(sess: &Session) -> PResult<()> {
    write_text(Path::new("selector"), &selector_file_text(sess))
}

/// The `classdef` source file: for each class, only the properties whose
/// value differs from the superclass and the methods declared here.
pub fn class_defs_text(sess: &Session) -> String {
    let mut out = String::new();

    let mut class_num = -1;
    while let Some(id) = sess.classes.next_class(class_num) {
        let cp = sess.classes.get(id);
        class_num = cp.num;
        if cp.num == -1 {
            // The root class is defined by the compiler itself.
            continue;
        }

        out.push_str(&format!(
            "(classdef {}\n\tscript# {}\n\tclass# {}\n\tsuper# {}\n\tfile# \"{}\"\n\n",
            sess.syms.name(cp.sym),
            cp.script as u16,
            cp.num as u16,
            cp.super_num as u16,
            cp.file
        ));

        let sup_num = cp.find_selector(SEL_SUPER).map(|sn| sn.val).unwrap_or(-1);
        let sup = sess
            .classes
            .find(sup_num)
            .or(sess.classes.root)
            .map(|s| sess.classes.get(s));

        out.push_str("\t(properties\n");
        for sn in cp.selectors.iter().filter(|sn| sn.tag.is_property()) {
            if sup.map_or(true, |s| s.selector_differs(sn)) {
                out.push_str(&format!(
                    "\t\t{} {}\n",
                    sess.syms.name(sn.sym),
                    sn.val
                ));
            }
        }
        out.push_str("\t)\n\n");

        out.push_str("\t(methods\n");
        for sn in cp.selectors.iter().filter(|sn| sn.tag.is_method()) {
            if sup.map_or(true, |s| s.selector_differs(sn)) {
                out.push_str(&format!("\t\t{}\n", sess.syms.name(sn.sym)));
            }
        }
        out.push_str("\t)\n)\n\n\n");
    }

    out
}

pub fn write_class_defs(sess: &Session) -> PResult<()> {
    write_text(Path::new("classdef"), &class_defs_text(sess))
}

/// The `classes` file: the class hierarchy as an indented tree.
pub fn classes_text(sess: &Session) -> String {
    let mut out = String::new();
    if let Some(first) = sess.classes.find(0) {
        print_subclasses(sess, first, 0, &mut out);
    }
    out
}

pub fn write_classes(sess: &Session) -> PResult<()> {
    write_text(Path::new("classes"), &classes_text(sess))
}

fn print_subclasses(sess: &Session, id: ObjectId, level: usize, out: &mut String) {
    let cp = sess.classes.get(id);
    let indent = 2 * level;
    let width = 20usize.saturating_sub(indent);
    out.push_str(&format!(
        "{:indent$}{:<width$};{}\n",
        "",
        sess.syms.name(cp.sym),
        cp.file,
        indent = indent,
        width = width,
    ));
    for &sub in &cp.subclasses {
        print_subclasses(sess, sub, level + 1, out);
    }
}

/// The selector-name vocabulary: a high-watermark word, an offset table
/// indexed by selector number, then the NUL-terminated names.  Numbers
/// with no selector resolve to the "BAD SELECTOR" sentinel.
pub fn write_selector_vocab(sess: &Session) -> PResult<()> {
    let max = sess.seltbl.max;
    let tbl_words = (max + 2) as usize;
    let tbl_len = 2 * tbl_words;

    let mut res = Resource::new(MemType::Vocab, sess.config.high_byte_first);

    // Offset table, patched below once the strings are placed.
    let mut table = vec![tbl_len as i32; tbl_words];
    table[0] = max;
    for _ in 0..tbl_words {
        res.write_word(0);
    }

    let mut ofs = tbl_len;
    res.write_bytes(BAD_SELECTOR.as_bytes());
    res.write_byte(0);
    let bad_len = BAD_SELECTOR.len() + 1;
    let mut next = ofs + bad_len;
    // All unclaimed numbers point at the sentinel.
    for t in table.iter_mut().skip(1) {
        *t = ofs as i32;
    }
    ofs = next;

    for id in sess.syms.selector_ids() {
        let sym = sess.syms.get(id);
        let num = sym.val();
        if num < 0 || (num + 1) as usize >= tbl_words {
            continue;
        }
        table[(num + 1) as usize] = ofs as i32;
        res.write_bytes(sym.name.as_bytes());
        res.write_byte(0);
        next = ofs + sym.name.len() + 1;
        ofs = next;
    }

    for (i, v) in table.iter().enumerate() {
        res.patch_word(2 * i, *v);
    }

    let path = sess.config.out_dir.join(res_name(MemType::Vocab, SELECTOR_VOCAB));
    res.save(&path)
}

/// The class-table resource: per class number, a reserved word and the
/// script that defines the class.
pub fn write_class_tbl(sess: &Session) -> PResult<()> {
    let mut res = Resource::new(MemType::Vocab, sess.config.high_byte_first);
    for n in 0..=sess.classes.max_class_num.max(-1) {
        let script = sess
            .classes
            .find(n)
            .map(|id| sess.classes.get(id).script)
            .unwrap_or(0);
        res.write_word(0);
        res.write_word(script);
    }
    let path = sess.config.out_dir.join(res_name(MemType::Vocab, CLASSTBL_VOCAB));
    res.save(&path)
}

/// Optional property-offset vocabulary, built from `offsets.txt`: each
/// `(class selector)` pair maps to the property's word offset.
pub fn write_prop_offsets(sess: &mut Session) -> PResult<()> {
    let Ok(text) = fs::read_to_string("offsets.txt") else {
        sess.diags
            .warning("offsets.txt", 0, "Can't open offsets.txt; skipping offset vocabulary.");
        return Ok(());
    };

    let mut res = Resource::new(MemType::Vocab, sess.config.high_byte_first);

    let mut words = text.split_whitespace();
    while let Some(class_name) = words.next() {
        let Some(sel_name) = words.next() else { break };

        let class = sess
            .syms
            .lookup(class_name)
            .filter(|&id| sess.syms.get(id).ty == crate::symbol::SymType::Class)
            .and_then(|id| sess.syms.get(id).obj());
        let Some(class) = class else {
            sess.diags
                .error("offsets.txt", 0, &format!("Not a class: {}", class_name));
            continue;
        };

        let sel = sess
            .syms
            .selectors
            .get(sel_name)
            .map(|id| sess.syms.get(id).val())
            .and_then(|num| sess.classes.get(class).find_selector(num))
            .filter(|sn| sn.tag.is_property());
        match sel {
            Some(sn) => res.write_word(sn.ofs / 2),
            None => {
                let cname = sess.syms.name(sess.classes.get(class).sym).to_string();
                sess.diags.error(
                    "offsets.txt",
                    0,
                    &format!("Not a selector for class {}: {}", cname, sel_name),
                );
            }
        }
    }

    let path = sess.config.out_dir.join(res_name(MemType::Vocab, PROPOFS_VOCAB));
    res.save(&path)
}

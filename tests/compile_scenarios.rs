/// End-to-end compilation scenarios over the emitted binary images.
///
/// These tests drive whole translation units through the library API and
/// inspect the bytes of the heap/hunk resources:
///   • minimal script shape (header, variables, terminator, fixups)
///   • forward call resolution through the backpatch chains
///   • parse-time constant folding
///   • short-circuit lowering and the branch shrink fixpoint
///   • class inheritance, auto-named instances, selector auto-allocation

use std::fs;

use pretty_assertions::assert_eq;
use quillc::{compile_text, Config, Session};
use tempfile::TempDir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn session_in(dir: &TempDir) -> Session {
    let config = Config {
        out_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    Session::new(config)
}

fn compile(src: &str) -> (Session, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let mut sess = session_in(&dir);
    compile_text(&mut sess, "test.sc", src).expect("compile should not be fatal");
    (sess, dir)
}

fn read_res(dir: &TempDir, name: &str) -> Vec<u8> {
    fs::read(dir.path().join(name)).expect("resource file should exist")
}

/// Little-endian word at a payload offset (skipping the 2-byte header).
fn word_at(bytes: &[u8], payload_ofs: usize) -> u16 {
    u16::from_le_bytes([bytes[2 + payload_ofs], bytes[3 + payload_ofs]])
}

fn payload(bytes: &[u8]) -> &[u8] {
    &bytes[2..]
}

fn find_seq(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ─── S1: minimal script ──────────────────────────────────────────────────────

#[test]
fn minimal_script_images() {
    let (sess, dir) = compile("(script# 0) (procedure (main) (return 42))");
    assert_eq!(sess.diags.errors, 0);

    let heap = read_res(&dir, "0.hep");
    // Resource header: heap type, zero.
    assert_eq!(&heap[0..2], &[0x91, 0x00]);
    // Fixup table offset, empty variables table, terminator, empty fixups.
    assert_eq!(
        payload(&heap),
        &[0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    let hunk = read_res(&dir, "0.scr");
    assert_eq!(&hunk[0..2], &[0x82, 0x00]);
    // Heap-pointer slot and far-text flag are zero; no dispatch entries.
    assert_eq!(word_at(&hunk, 2), 0);
    assert_eq!(word_at(&hunk, 4), 0);
    assert_eq!(word_at(&hunk, 6), 0);
    // ldi.b 42, the explicit return, and the implicit trailing return.
    assert_eq!(&payload(&hunk)[8..12], &[0x35, 42, 0x48, 0x48]);
    // Fixup table: patched offset word points at an empty table.
    let fix_ofs = word_at(&hunk, 0) as usize;
    assert_eq!(fix_ofs, 12);
    assert_eq!(word_at(&hunk, fix_ofs), 0);

    // The info file names the source.
    let inf = fs::read_to_string(dir.path().join("0.inf")).unwrap();
    assert_eq!(inf, "test.sc\n");
}

// ─── S2: forward call resolution ─────────────────────────────────────────────

#[test]
fn forward_call_resolves_to_short_displacement() {
    let (sess, dir) = compile("(script# 1) (procedure (a) (b)) (procedure (b) (return))");
    assert_eq!(sess.diags.errors, 0, "forward call must not diagnose");

    let hunk = read_res(&dir, "1.scr");
    // Procedure a: pushi.b 0, call.b +1 with 0 argument bytes, ret.
    // Procedure b: ret, ret.
    assert_eq!(
        &payload(&hunk)[8..16],
        &[0x39, 0x00, 0x41, 0x01, 0x00, 0x48, 0x48, 0x48]
    );
}

// ─── S3: constant folding ────────────────────────────────────────────────────

#[test]
fn constant_expressions_fold_to_single_load() {
    let (sess, dir) = compile("(script# 3) (procedure (main) (return (+ 1 2 (* 3 4) 5)))");
    assert_eq!(sess.diags.errors, 0);

    let hunk = read_res(&dir, "3.scr");
    // The whole operand tree collapses to `ldi.b 20`.
    assert_eq!(&payload(&hunk)[8..12], &[0x35, 20, 0x48, 0x48]);
    // No arithmetic survives.
    assert!(!payload(&hunk).contains(&0x02), "add must be folded away");
}

#[test]
fn division_by_zero_is_diagnosed_not_folded() {
    let (sess, _dir) = compile("(script# 3) (procedure (main) (return (/ 4 0)))");
    assert!(sess.diags.errors > 0);
}

// ─── S4: short-circuit `and` plus branch shrinking ───────────────────────────

const SHRINK_SRC: &str = "(script# 0)\n\
     (global a 0 b 1 c 2)\n\
     (procedure (doit) (return))\n\
     (procedure (main) (if (and a b c) (doit)))\n";

#[test]
fn short_circuit_branches_take_the_byte_form() {
    let (sess, dir) = compile(SHRINK_SRC);
    assert_eq!(sess.diags.errors, 0);

    let hunk = read_res(&dir, "0.scr");
    let code = &payload(&hunk)[8..];
    // All conditionals end up in the one-byte form.
    assert!(find_seq(code, &[0x31]), "expected bnt.b in the body");
    assert!(
        !code.contains(&0x30) && !code.contains(&0x32),
        "no word-form bnt/jmp may survive stabilization"
    );
}

#[test]
fn shrinking_strictly_reduces_hunk_size() {
    let dir = TempDir::new().unwrap();
    let mut sess = session_in(&dir);
    compile_text(&mut sess, "test.sc", SHRINK_SRC).unwrap();
    let shrunk = read_res(&dir, "0.scr").len();

    let dir2 = TempDir::new().unwrap();
    let mut config = Config {
        out_dir: dir2.path().to_path_buf(),
        ..Default::default()
    };
    config.no_shrink = true;
    let mut sess2 = Session::new(config);
    compile_text(&mut sess2, "test.sc", SHRINK_SRC).unwrap();
    let unshrunk = read_res(&dir2, "0.scr").len();

    assert!(
        shrunk < unshrunk,
        "shrunk image ({}) must be strictly smaller than the long-form image ({})",
        shrunk,
        unshrunk
    );
}

// ─── S5: classes, instances, inheritance ─────────────────────────────────────

const CLASS_SRC: &str = "(script# 5)\n\
     (class C of RootObj (properties x 1 y 2))\n\
     (class D of C (properties y 2 z 3))\n";

#[test]
fn subclass_tracks_superclass_number() {
    let (sess, _dir) = compile(CLASS_SRC);
    assert_eq!(sess.diags.errors, 0);

    let c = sess.classes.find(0).expect("C claims class number 0");
    let d = sess.classes.find(1).expect("D claims class number 1");
    assert_eq!(sess.classes.get(d).super_num, sess.classes.get(c).num);

    // `-super-` carries the superclass number into the template.
    let sup = sess
        .classes
        .get(d)
        .find_selector(quillc::selector::SEL_SUPER)
        .unwrap();
    assert_eq!(sup.val, 0);

    // Property offsets step by two across the inherited sequence.
    let z = sess.classes.get(d).selectors.iter().find(|sn| {
        sess.syms.name(sn.sym) == "z"
    });
    let y_c = sess.classes.get(c).selectors.iter().find(|sn| {
        sess.syms.name(sn.sym) == "y"
    });
    let (z, y_c) = (z.unwrap(), y_c.unwrap());
    assert_eq!(y_c.ofs, 2 * 9);
    assert_eq!(z.ofs, 2 * 10);
}

#[test]
fn classdef_serialization_is_differential() {
    let (sess, _dir) = compile(CLASS_SRC);
    let text = quillc::database::class_defs_text(&sess);

    let d_start = text.find("(classdef D").expect("D must be serialized");
    let d_section = &text[d_start..];

    // D re-declares y with C's value: elided.  z is new: kept.
    assert!(d_section.contains("z 3"));
    assert!(!d_section.contains("y 2"));

    let c_section = &text[..d_start];
    assert!(c_section.contains("x 1"));
    assert!(c_section.contains("y 2"));
}

#[test]
fn regenerated_database_is_a_serializer_fixpoint() {
    let (sess, _dir) = compile(CLASS_SRC);
    let selectors1 = quillc::database::selector_file_text(&sess);
    let classdefs1 = quillc::database::class_defs_text(&sess);

    // Read both files back into a fresh job and serialize again.
    let dir = TempDir::new().unwrap();
    let mut sess2 = session_in(&dir);
    quillc::parse_aux_text(&mut sess2, "selector", &selectors1).unwrap();
    quillc::parse_aux_text(&mut sess2, "classdef", &classdefs1).unwrap();
    assert_eq!(sess2.diags.errors, 0);

    assert_eq!(selectors1, quillc::database::selector_file_text(&sess2));
    assert_eq!(classdefs1, quillc::database::class_defs_text(&sess2));
}

#[test]
fn instances_auto_name_when_the_selector_is_known() {
    let dir = TempDir::new().unwrap();
    let mut sess = session_in(&dir);
    // The `name` selector comes from the database, as it would in a real
    // game tree.
    quillc::parse_aux_text(&mut sess, "selector", "(selectors name 0)").unwrap();

    let src = "(script# 12)\n\
         (class C of RootObj (properties name \"klass\"))\n\
         (instance thing of C)\n";
    compile_text(&mut sess, "test.sc", src).unwrap();
    assert_eq!(sess.diags.errors, 0);

    let inst = sess
        .syms
        .lookup("thing")
        .and_then(|id| sess.syms.get(id).obj())
        .unwrap();
    let name_sn = sess.classes.get(inst).find_selector(0).unwrap();
    assert_eq!(
        name_sn.tag,
        quillc::object::SelTag::Text,
        "unset name defaults to a text property"
    );

    // Both the explicit and the automatic name land in the text pool.
    let heap = read_res(&dir, "12.hep");
    assert!(find_seq(&heap, b"klass\0"));
    assert!(find_seq(&heap, b"thing\0"));
}

#[test]
fn instances_clear_the_class_bit() {
    let src = "(script# 7)\n\
         (class C of RootObj (properties x 1))\n\
         (instance thing of C)\n";
    let (sess, _dir) = compile(src);
    assert_eq!(sess.diags.errors, 0);

    let c = sess.classes.find(0).unwrap();
    let inst = sess
        .syms
        .lookup("thing")
        .and_then(|id| sess.syms.get(id).obj())
        .expect("instance object");

    let info = sess
        .classes
        .get(inst)
        .find_selector(quillc::selector::SEL_INFO)
        .unwrap();
    assert_eq!(info.val & quillc::selector::CLASSBIT, 0);
    let info_c = sess
        .classes
        .get(c)
        .find_selector(quillc::selector::SEL_INFO)
        .unwrap();
    assert_ne!(info_c.val & quillc::selector::CLASSBIT, 0);

    // Inherited selector sequence matches the class, with local methods
    // demoted (here: none), and `-size-` equals the property count.
    assert_eq!(
        sess.classes.get(inst).selectors.len(),
        sess.classes.get(c).selectors.len()
    );
    let size = sess
        .classes
        .get(inst)
        .find_selector(quillc::selector::SEL_SIZE)
        .unwrap();
    assert_eq!(size.val, sess.classes.get(inst).num_props);
}

// ─── S6: selector auto-allocation ────────────────────────────────────────────

#[test]
fn unknown_message_selectors_claim_the_lowest_free_number() {
    let src = "(script# 6)\n\
         (local o)\n\
         (procedure (main) (o frobnicate))\n";
    let (sess, dir) = compile(src);
    assert_eq!(sess.diags.errors, 0);

    // Lowest clear bit in a fresh table is zero.
    let id = sess.syms.lookup("frobnicate").expect("selector installed");
    assert_eq!(sess.syms.get(id).val(), 0);
    assert!(sess.seltbl.is_claimed(0));
    assert!(sess.seltbl.added, "a new claim dirties the database");

    let text = quillc::database::selector_file_text(&sess);
    assert!(text.contains("frobnicate"));

    // The selector vocabulary resolves the new number to the name.
    quillc::database::write_selector_vocab(&sess).unwrap();
    let voc = read_res(&dir, "997.voc");
    let tbl_words = (sess.seltbl.max + 2) as usize;
    let entry = word_at(&voc, 2) as usize; // slot for selector 0
    let bad = 2 * tbl_words;
    assert_ne!(entry, bad, "claimed selector must not be the sentinel");
    let name_bytes = &payload(&voc)[entry..entry + "frobnicate".len()];
    assert_eq!(name_bytes, b"frobnicate");
    // An unclaimed number resolves to "BAD SELECTOR".
    let unused = word_at(&voc, 2 * 2) as usize;
    assert_eq!(&payload(&voc)[unused..unused + 3], b"BAD");
}

// ─── Control flow shapes ─────────────────────────────────────────────────────

#[test]
fn switch_keeps_its_value_on_the_stack() {
    let src = "(script# 8)\n\
         (local v)\n\
         (procedure (main)\n\
            (switch v\n\
               (1 (return 1))\n\
               (else (return 2))))\n";
    let (sess, dir) = compile(src);
    assert_eq!(sess.diags.errors, 0);

    let hunk = read_res(&dir, "8.scr");
    let code = &payload(&hunk)[8..];
    assert!(code.contains(&0x3c), "dup before each case test");
    assert!(code.contains(&0x3a), "toss at the end of the switch");
}

#[test]
fn while_loop_branches_back_to_its_start() {
    let src = "(script# 9)\n\
         (local n)\n\
         (procedure (main) (while (< n 10) (++ n)))\n";
    let (sess, dir) = compile(src);
    assert_eq!(sess.diags.errors, 0);

    let hunk = read_res(&dir, "9.scr");
    let code = &payload(&hunk)[8..];
    // A backward jmp.b has a negative displacement.
    let back_jump = code
        .windows(2)
        .any(|w| w[0] == 0x33 && (w[1] as i8) < 0);
    assert!(back_jump, "expected a short backward jump to the loop head");
}

#[test]
fn break_level_beyond_nesting_warns_but_compiles() {
    let src = "(script# 10)\n\
         (procedure (main) (while 1 (break 5)))\n";
    let (sess, _dir) = compile(src);
    assert_eq!(sess.diags.errors, 0);
    assert!(sess.diags.warnings > 0, "saturating break level warns");
}

// ─── Strings and text relocation ─────────────────────────────────────────────

#[test]
fn strings_land_in_the_heap_with_fixups() {
    let src = "(script# 11)\n\
         (procedure (main) (return \"hello\"))\n";
    let (sess, dir) = compile(src);
    assert_eq!(sess.diags.errors, 0);

    let heap = read_res(&dir, "11.hep");
    assert!(find_seq(&heap, b"hello\0"));

    // The code references the string through a hunk fixup.
    let hunk = read_res(&dir, "11.scr");
    let fix_ofs = word_at(&hunk, 0) as usize;
    let n_fixups = word_at(&hunk, fix_ofs) as usize;
    assert_eq!(n_fixups, 1);
    let site = word_at(&hunk, fix_ofs + 2) as usize;
    // The patched word holds the text-segment address of "hello".
    let addr = word_at(&hunk, site) as usize;
    assert_eq!(&payload(&heap)[addr..addr + 5], b"hello");
}

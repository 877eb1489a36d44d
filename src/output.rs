/// Binary resource emission.
///
/// Each output file starts with a two-byte resource header `{type, 0}`;
/// stream offsets are relative to the byte after it.  Word order defaults
/// to little-endian and flips for big-endian targets.
///
/// Per translation unit the emitter assigns final offsets (heap pass,
/// hunk size convergence, heap pass again), then writes the heap and hunk
/// payloads followed by each stream's fixup table.

use std::fs;
use std::path::Path;

use crate::anode::*;
use crate::bytecode::*;
use crate::diagnostics::DiagnosticEngine;
use crate::errors::{FatalError, PResult};
use crate::listing::Listing;
use crate::optimizer::optimize_hunk;
use crate::session::Session;
use crate::symtab::SymTbls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Heap,
    Hunk,
    Vocab,
}

impl MemType {
    pub fn header_byte(self) -> u8 {
        match self {
            MemType::Heap => 0x91,
            MemType::Hunk => 0x82,
            MemType::Vocab => 0x86,
        }
    }

    pub fn ext(self) -> &'static str {
        match self {
            MemType::Heap => "hep",
            MemType::Hunk => "scr",
            MemType::Vocab => "voc",
        }
    }
}

/// Resource file name for a script or vocabulary number.
pub fn res_name(ty: MemType, num: i32) -> String {
    format!("{}.{}", num as u16, ty.ext())
}

/// An in-memory resource image.
pub struct Resource {
    pub buf: Vec<u8>,
    high_first: bool,
}

impl Resource {
    pub fn new(ty: MemType, high_first: bool) -> Self {
        Resource {
            buf: vec![ty.header_byte(), 0],
            high_first,
        }
    }

    pub fn write_byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub fn write_word(&mut self, v: i32) {
        let u = v as u16;
        if self.high_first {
            self.buf.extend_from_slice(&u.to_be_bytes());
        } else {
            self.buf.extend_from_slice(&u.to_le_bytes());
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrite a word at a payload offset (excluding the header).
    pub fn patch_word(&mut self, payload_ofs: usize, v: i32) {
        let u = v as u16;
        let bytes = if self.high_first {
            u.to_be_bytes()
        } else {
            u.to_le_bytes()
        };
        self.buf[2 + payload_ofs] = bytes[0];
        self.buf[2 + payload_ofs + 1] = bytes[1];
    }

    pub fn save(&self, path: &Path) -> PResult<()> {
        fs::write(path, &self.buf).map_err(|_| FatalError::WriteFailed {
            path: path.display().to_string(),
        })?;
        Ok(())
    }
}

/// Assign final offsets, then write the unit's heap, hunk, and info
/// files.
pub fn assemble(sess: &mut Session, source_name: &str) -> PResult<()> {
    // The variables block goes right after the heap's fixup-offset word:
    // globals for script 0, locals for everything else.
    let values = if sess.script == 0 {
        sess.global_vars.values.clone()
    } else {
        sess.local_vars.values.clone()
    };
    let heap_list = sess.asm.heap.list;
    let front = sess.asm.list(heap_list).first().copied();
    let after_front = sess.asm.list(heap_list).get(1).copied();
    debug_assert!(front.is_some());
    sess.asm
        .insert_before(heap_list, Stream::Heap, after_front, AsmKind::Vars { values });

    // Heap offsets, hunk size convergence, then heap again so property
    // slots holding code offsets see the final values.
    let fix = sess.asm.set_list_offset(heap_list, 0);
    sess.asm.heap.fix_ofs = fix;
    optimize_hunk(&mut sess.asm, sess.config.no_shrink);
    let fix = sess.asm.set_list_offset(heap_list, 0);
    sess.asm.heap.fix_ofs = fix;

    let script = sess.script;
    let high = sess.config.high_byte_first;

    let mut heap = Resource::new(MemType::Heap, high);
    if let Some(l) = sess.listing.as_mut() {
        l.banner("Heap");
    }
    emit_stream(sess, Stream::Heap, &mut heap)?;

    let mut hunk = Resource::new(MemType::Hunk, high);
    if let Some(l) = sess.listing.as_mut() {
        l.banner("Hunk");
    }
    emit_stream(sess, Stream::Hunk, &mut hunk)?;

    let out_dir = sess.config.out_dir.clone();
    heap.save(&out_dir.join(res_name(MemType::Heap, script)))?;
    hunk.save(&out_dir.join(res_name(MemType::Hunk, script)))?;

    let info_path = out_dir.join(format!("{}.inf", script as u16));
    fs::write(&info_path, format!("{}\n", source_name)).map_err(|_| FatalError::WriteFailed {
        path: info_path.display().to_string(),
    })?;

    Ok(())
}

/// Emit one stream: patch its fixup-table offset word, write the payload,
/// then the relocation table.
fn emit_stream(sess: &mut Session, which: Stream, out: &mut Resource) -> PResult<()> {
    let (root, fix_ofs) = match which {
        Stream::Heap => (sess.asm.heap.list, sess.asm.heap.fix_ofs),
        Stream::Hunk => (sess.asm.hunk.list, sess.asm.hunk.fix_ofs),
    };

    // If the payload ends odd, the table starts one pad byte later.
    let padded = fix_ofs + (fix_ofs & 1);
    if let Some(&first) = sess.asm.list(root).first() {
        sess.asm.set_word(first, padded as i32);
    }

    let mut fixups: Vec<usize> = Vec::new();
    {
        let mut ctx = EmitCtx {
            asm: &mut sess.asm,
            syms: &sess.syms,
            diags: &mut sess.diags,
            listing: sess.listing.as_mut(),
            fixups: &mut fixups,
            cur_file: &sess.cur_file,
            cur_line: sess.cur_line,
        };
        ctx.emit_list(root, out)?;
        let collected = ctx.fixups.clone();
        if let Some(l) = ctx.listing.as_deref_mut() {
            l.fixups(padded, &collected);
        }
    }

    if fix_ofs & 1 != 0 {
        out.write_byte(0);
    }
    out.write_word(fixups.len() as i32);
    for f in &fixups {
        out.write_word(*f as i32);
    }

    match which {
        Stream::Heap => sess.asm.heap.fixups = fixups,
        Stream::Hunk => sess.asm.hunk.fixups = fixups,
    }
    Ok(())
}

struct EmitCtx<'a> {
    asm: &'a mut AsmGraph,
    syms: &'a SymTbls,
    diags: &'a mut DiagnosticEngine,
    listing: Option<&'a mut Listing>,
    fixups: &'a mut Vec<usize>,
    cur_file: &'a str,
    cur_line: u32,
}

impl<'a> EmitCtx<'a> {
    fn name(&self, sym: crate::symbol::SymbolId) -> String {
        self.syms.name(sym).to_string()
    }

    fn err(&mut self, msg: &str) {
        let file = self.cur_file.to_string();
        self.diags.error(&file, self.cur_line, msg);
    }

    fn list_line(&mut self, ofs: usize, text: String) {
        if let Some(l) = self.listing.as_deref_mut() {
            l.as_code(ofs, &text);
        }
    }

    fn note(&mut self, text: &str) {
        if let Some(l) = self.listing.as_deref_mut() {
            l.note(text);
        }
    }

    fn emit_list(&mut self, list: ListId, out: &mut Resource) -> PResult<()> {
        for i in 0..self.asm.list(list).len() {
            let id = self.asm.list(list)[i];
            self.emit_node(id, out)?;
        }
        Ok(())
    }

    fn target_offset(&self, r: &Reference) -> Option<usize> {
        r.target()
            .map(|t| self.asm.node(t).offset)
            .filter(|&o| o != UNASSIGNED)
    }

    fn emit_node(&mut self, id: AsmNodeId, out: &mut Resource) -> PResult<()> {
        let ofs = self.asm.node(id).offset;
        let kind = self.asm.node(id).kind.clone();

        match kind {
            AsmKind::Table { name, list } => {
                self.note(&format!("\t\t({})", name));
                self.emit_list(list, out)?;
            }

            AsmKind::CodeBlock { kind, sym, list, .. } => {
                let header = match kind {
                    CodeKind::Method => format!("\n\nMethod: ({})\n", self.name(sym)),
                    CodeKind::Proc => format!("\n\nProcedure: ({})\n", self.name(sym)),
                };
                self.note(&header);
                self.emit_list(list, out)?;
            }

            AsmKind::Word { value } => {
                self.list_line(ofs, format!("word\t${:x}", value as u16));
                out.write_word(value);
            }

            AsmKind::Op { op } => {
                self.list_line(ofs, op_name(op));
                out.write_byte(op);
            }

            AsmKind::Label { number } => {
                self.note(&format!(".{}", number));
            }

            AsmKind::Unsigned { op, value, sym } => {
                let tail = sym.map(|s| format!("\t({})", self.name(s))).unwrap_or_default();
                self.list_line(ofs, format!("{}\t${:x}{}", op_name(op), value as u16, tail));
                out.write_byte(op);
                if op & OP_BYTE != 0 {
                    out.write_byte(value as u8);
                } else {
                    out.write_word(value as i32);
                }
            }

            AsmKind::Signed { op, value } => {
                self.list_line(ofs, format!("{}\t${:x}", op_name(op), value as u16));
                out.write_byte(op);
                if op & OP_BYTE != 0 {
                    out.write_byte(value as u8);
                } else {
                    out.write_word(value);
                }
            }

            AsmKind::VarAccess { op, addr, sym } => {
                let tail = sym.map(|s| format!("\t({})", self.name(s))).unwrap_or_default();
                self.list_line(ofs, format!("{}\t${:x}{}", op_name(op), addr, tail));
                out.write_byte(op);
                if op & OP_BYTE != 0 {
                    out.write_byte(addr as u8);
                } else {
                    out.write_word(addr as i32);
                }
            }

            AsmKind::EffectiveAddr { op, ea_type, addr, sym } => {
                let tail = sym.map(|s| format!("\t({})", self.name(s))).unwrap_or_default();
                self.list_line(ofs, format!("{}\t${:x}{}", op_name(op), addr, tail));
                out.write_byte(op);
                if op & OP_BYTE != 0 {
                    out.write_byte(ea_type);
                    out.write_byte(addr as u8);
                } else {
                    out.write_word(ea_type as i32);
                    out.write_word(addr as i32);
                }
            }

            AsmKind::Call { op, reference, num_args, sym } => {
                let Some(target) = self.target_offset(&reference) else {
                    let name = self.name(sym);
                    self.err(&format!("Undefined procedure: {}", name));
                    return Ok(());
                };
                let size = if op & OP_BYTE != 0 { 3 } else { 4 };
                let disp = target.wrapping_sub(ofs + size) as i32;
                let name = self.name(sym);
                self.list_line(ofs, format!("call\t${:x}\t({})", disp as u16, name));
                out.write_byte(op);
                if op & OP_BYTE != 0 {
                    out.write_byte(disp as u8);
                } else {
                    out.write_word(disp);
                }
                out.write_byte(num_args as u8);
            }

            AsmKind::ExternCall { op, module, entry, num_args, sym } => {
                let name = self.name(sym);
                self.list_line(ofs, format!("{}\t${:x}\t({})", op_name(op), entry, name));
                out.write_byte(op);
                if op & !OP_BYTE == OP_CALLE {
                    if op & OP_BYTE != 0 {
                        out.write_byte(module as u8);
                    } else {
                        out.write_word(module);
                    }
                }
                if op & OP_BYTE != 0 {
                    out.write_byte(entry as u8);
                } else {
                    out.write_word(entry as i32);
                }
                out.write_byte(num_args as u8);
            }

            AsmKind::Branch { op, reference } => {
                let Some(target) = self.target_offset(&reference) else {
                    self.err("Internal error: unresolved branch target");
                    return Ok(());
                };
                let size = if op & OP_BYTE != 0 { 2 } else { 3 };
                let disp = target.wrapping_sub(ofs + size) as i32;
                self.list_line(ofs, format!("{}\t${:x}", op_name(op), disp as u16));
                out.write_byte(op);
                if op & OP_BYTE != 0 {
                    out.write_byte(disp as u8);
                } else {
                    out.write_word(disp);
                }
            }

            AsmKind::Send { op, num_args } => {
                self.list_line(ofs, op_name(op));
                out.write_byte(op);
                out.write_byte(num_args as u8);
            }

            AsmKind::Super { op, class_num, num_args, sym } => {
                let name = self.name(sym);
                self.list_line(ofs, format!("{}\t${:x}\t({})", op_name(op), class_num, name));
                out.write_byte(op);
                if op & OP_BYTE != 0 {
                    out.write_byte(class_num as u8);
                } else {
                    out.write_word(class_num as i32);
                }
                out.write_byte(num_args as u8);
            }

            AsmKind::Dispatch { reference, sym } => match (reference.target(), sym) {
                (Some(t), Some(s)) => {
                    // Entries pointing into the heap are relocated at
                    // load time.
                    if self.asm.node(t).stream == Stream::Heap {
                        self.fixups.push(ofs);
                    }
                    let t_ofs = self.asm.node(t).offset;
                    let name = self.name(s);
                    self.list_line(ofs, format!("dispatch\t${:x}\t({})", t_ofs, name));
                    out.write_word(t_ofs as i32);
                }
                (None, Some(s)) => {
                    let name = self.name(s);
                    self.err(&format!("Undefined public: {}", name));
                    out.write_word(0);
                }
                _ => {
                    self.list_line(ofs, "dispatch\t----".to_string());
                    out.write_word(0);
                }
            },

            AsmKind::ObjRef { reference, sym } => {
                let defined = self.syms.get(sym).obj().is_some();
                match self.target_offset(&reference) {
                    Some(t) if defined => {
                        let name = self.name(sym);
                        self.list_line(ofs, format!("lofsa\t${:x}\t({})", t, name));
                        out.write_byte(OP_LOFSA);
                        self.fixups.push(ofs + 1);
                        out.write_word(t as i32);
                    }
                    _ => {
                        let line = self.syms.get(sym).line_num;
                        let name = self.name(sym);
                        self.err(&format!("Undefined object from line {}: {}", line, name));
                    }
                }
            }

            AsmKind::TextOfs { ofs: text_ofs } => {
                let addr = self.asm.text_start.wrapping_add(text_ofs as usize);
                self.list_line(ofs, format!("lofsa\t${:x}", addr));
                out.write_byte(OP_LOFSA);
                self.fixups.push(ofs + 1);
                out.write_word(addr as i32);
            }

            AsmKind::ObjectHdr { sym, .. } => {
                let name = self.name(sym);
                self.note(&format!("\nObject: {}", name));
            }

            AsmKind::IntProp { sym, val } => {
                let name = self.name(sym);
                self.list_line(ofs, format!("prop\t${:x}\t({})", val as u16, name));
                out.write_word(val);
            }

            AsmKind::TextProp { sym, val } => {
                let addr = (self.asm.text_start as i32).wrapping_add(val);
                let name = self.name(sym);
                self.list_line(ofs, format!("text\t${:x}\t({})", addr as u16, name));
                self.fixups.push(ofs);
                out.write_word(addr);
            }

            AsmKind::OfsProp { sym, target } => {
                let value = target.map(|t| self.asm.node(t).offset).unwrap_or(0);
                let name = self.name(sym);
                self.list_line(ofs, format!("ofs\t${:x}\t({})", value as u16, name));
                out.write_word(value as i32);
            }

            AsmKind::MethodRec { sym, method } => {
                let value = self.asm.node(method).offset;
                let name = self.name(sym);
                self.list_line(ofs, format!("local\t${:x}\t({})", value as u16, name));
                out.write_word(value as i32);
            }

            AsmKind::TextRec { str } => {
                if let Some(l) = self.listing.as_deref_mut() {
                    l.text(ofs, &str);
                }
                out.write_bytes(str.as_bytes());
                out.write_byte(0);
            }

            AsmKind::Vars { values } => {
                self.note("\n\nVariables:");
                self.list_line(ofs, format!("word\t${:x}", values.len()));
                out.write_word(values.len() as i32);
                for (i, v) in values.iter().enumerate() {
                    let slot = ofs + 2 + 2 * i;
                    let value = match v {
                        VarInit::None => 0,
                        VarInit::Num(n) => *n,
                        VarInit::Text(t) => {
                            self.fixups.push(slot);
                            (self.asm.text_start as i32).wrapping_add(*t)
                        }
                    };
                    self.list_line(slot, format!("word\t${:x}", value as u16));
                    out.write_word(value);
                }
            }

            AsmKind::LineNum { line } => {
                out.write_byte(OP_LINE_NUM);
                out.write_word(line as i32);
            }
        }
        Ok(())
    }
}

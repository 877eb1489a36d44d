/// Assembly nodes.
///
/// Lowering produces a graph of emission records split across two streams:
/// the heap list (variables, object templates, strings) and the hunk list
/// (bytecode, dispatch table, class dictionaries).  Nodes live in one arena
/// and are addressed by id; order within a stream is a list of ids, with
/// tables and code blocks owning nested lists.
///
/// Forward references (branches, calls, dispatch entries, object loads) are
/// carried by a `Reference`: either the resolved target node, or a link to
/// the next unresolved user of the same symbol.  Backpatching swings every
/// link in the chain to the target once the definition is lowered.

use crate::bytecode::*;
use crate::object::ObjectId;
use crate::symbol::{SymbolId, KERNEL};

/// Offset value meaning "not yet assigned".
pub const UNASSIGNED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmNodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Heap,
    Hunk,
}

/// Either the resolved target of a forward reference or the next
/// unresolved use of the same symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefValue {
    Target(AsmNodeId),
    Chain(Option<AsmNodeId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub value: RefValue,
}

impl Reference {
    pub fn new() -> Self {
        Reference {
            value: RefValue::Chain(None),
        }
    }

    pub fn target(&self) -> Option<AsmNodeId> {
        match self.value {
            RefValue::Target(t) => Some(t),
            RefValue::Chain(_) => None,
        }
    }
}

impl Default for Reference {
    fn default() -> Self {
        Reference::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Proc,
    Method,
}

/// Initial value of one slot in a variables block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarInit {
    None,
    Num(i32),
    /// Offset into the text segment; relocated against the text start.
    Text(i32),
}

#[derive(Debug, Clone)]
pub enum AsmKind {
    /// Bare 16-bit word.
    Word { value: i32 },
    /// Operand-less opcode.
    Op { op: u8 },
    /// Branch target marker; emits nothing.
    Label { number: u32 },
    /// Opcode with an unsigned operand (pushi, link, class, &rest).
    Unsigned {
        op: u8,
        value: u32,
        sym: Option<SymbolId>,
    },
    /// Opcode with a signed operand (ldi).
    Signed { op: u8, value: i32 },
    /// Packed variable access.
    VarAccess {
        op: u8,
        addr: u16,
        sym: Option<SymbolId>,
    },
    /// Load effective address.
    EffectiveAddr {
        op: u8,
        ea_type: u8,
        addr: u16,
        sym: Option<SymbolId>,
    },
    /// Call to a procedure in this unit; displacement backpatched.
    Call {
        op: u8,
        reference: Reference,
        num_args: u16,
        sym: SymbolId,
    },
    /// Call into the kernel or another script.
    ExternCall {
        op: u8,
        module: i32,
        entry: u32,
        num_args: u16,
        sym: SymbolId,
    },
    /// Branch; displacement backpatched through a label.
    Branch { op: u8, reference: Reference },
    /// `send` or `self` message dispatch.
    Send { op: u8, num_args: u16 },
    /// `super` message dispatch with explicit class number.
    Super {
        op: u8,
        class_num: u32,
        num_args: u16,
        sym: SymbolId,
    },
    /// Dispatch-table entry holding the absolute offset of a public.
    Dispatch {
        reference: Reference,
        sym: Option<SymbolId>,
    },
    /// Load the absolute offset of an object template.
    ObjRef { reference: Reference, sym: SymbolId },
    /// Load the absolute offset of a string in the text segment.
    TextOfs { ofs: u32 },
    /// Object banner; emits nothing, anchors the template in listings.
    ObjectHdr { sym: SymbolId, num: i32 },
    /// Integer property slot.
    IntProp { sym: SymbolId, val: i32 },
    /// Text property slot, relocated against the text start.
    TextProp { sym: SymbolId, val: i32 },
    /// Property slot that receives another node's offset (dictionaries).
    OfsProp {
        sym: SymbolId,
        target: Option<AsmNodeId>,
    },
    /// Method-dictionary entry resolving to the method's code offset.
    MethodRec { sym: SymbolId, method: AsmNodeId },
    /// NUL-terminated string in the text segment.
    TextRec { str: String },
    /// The variables block at the head of the heap.
    Vars { values: Vec<VarInit> },
    /// Source line-number debug record.
    LineNum { line: u32 },
    /// Named nested table (dispatch table, property lists, dictionaries).
    Table { name: &'static str, list: ListId },
    /// Procedure or method body.
    CodeBlock {
        kind: CodeKind,
        sym: SymbolId,
        obj: Option<ObjectId>,
        list: ListId,
    },
}

#[derive(Debug)]
pub struct AsmNode {
    pub offset: usize,
    pub stream: Stream,
    pub kind: AsmKind,
}

/// One output stream: a root list plus its relocation table.
pub struct FixupStream {
    pub list: ListId,
    pub fixups: Vec<usize>,
    /// Offset of the fixup table, set by the final offset pass.
    pub fix_ofs: usize,
}

pub struct AsmGraph {
    nodes: Vec<AsmNode>,
    lists: Vec<Vec<AsmNodeId>>,
    /// Current-emission-list stack: lowering an object body temporarily
    /// redirects node creation into a nested table.
    cur: Vec<(ListId, Stream)>,
    pub heap: FixupStream,
    pub hunk: FixupStream,
    /// First code block in the hunk; dictionaries are inserted before it.
    pub code_start: Option<AsmNodeId>,
    /// Heap offset of the first text record.
    pub text_start: usize,
    next_label: u32,
    /// Offset passes may claim short branch forms only while set.
    pub shrink: bool,
}

impl AsmGraph {
    pub fn new() -> Self {
        AsmGraph {
            nodes: Vec::new(),
            lists: vec![Vec::new(), Vec::new()],
            cur: Vec::new(),
            heap: FixupStream {
                list: ListId(0),
                fixups: Vec::new(),
                fix_ofs: 0,
            },
            hunk: FixupStream {
                list: ListId(1),
                fixups: Vec::new(),
                fix_ofs: 0,
            },
            code_start: None,
            text_start: UNASSIGNED,
            next_label: 0,
            shrink: false,
        }
    }

    pub fn node(&self, id: AsmNodeId) -> &AsmNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: AsmNodeId) -> &mut AsmNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn list(&self, id: ListId) -> &[AsmNodeId] {
        &self.lists[id.0 as usize]
    }

    pub fn new_list(&mut self) -> ListId {
        let id = ListId(self.lists.len() as u32);
        self.lists.push(Vec::new());
        id
    }

    /// Reset both streams for the next translation unit.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lists.clear();
        self.lists.push(Vec::new());
        self.lists.push(Vec::new());
        self.heap = FixupStream {
            list: ListId(0),
            fixups: Vec::new(),
            fix_ofs: 0,
        };
        self.hunk = FixupStream {
            list: ListId(1),
            fixups: Vec::new(),
            fix_ofs: 0,
        };
        self.cur.clear();
        self.code_start = None;
        self.text_start = UNASSIGNED;
        self.next_label = 0;
        self.shrink = false;
    }

    // ── current-list management ──────────────────────────────────────────

    pub fn open_stream(&mut self, stream: Stream) {
        let list = match stream {
            Stream::Heap => self.heap.list,
            Stream::Hunk => self.hunk.list,
        };
        self.cur.push((list, stream));
    }

    /// Redirect node creation into a nested list, inheriting the stream.
    pub fn open_list(&mut self, list: ListId) {
        let stream = self.cur.last().map(|&(_, s)| s).unwrap_or(Stream::Hunk);
        self.cur.push((list, stream));
    }

    pub fn close_list(&mut self) {
        self.cur.pop();
    }

    pub fn cur_stream(&self) -> Stream {
        self.cur.last().map(|&(_, s)| s).unwrap_or(Stream::Hunk)
    }

    fn alloc(&mut self, stream: Stream, kind: AsmKind) -> AsmNodeId {
        let id = AsmNodeId(self.nodes.len() as u32);
        self.nodes.push(AsmNode {
            offset: UNASSIGNED,
            stream,
            kind,
        });
        id
    }

    /// Create a node on the current list.
    pub fn push(&mut self, kind: AsmKind) -> AsmNodeId {
        let &(list, stream) = self.cur.last().expect("no current list");
        let id = self.alloc(stream, kind);
        self.lists[list.0 as usize].push(id);
        id
    }

    pub fn push_op(&mut self, op: u8) -> AsmNodeId {
        self.push(AsmKind::Op { op })
    }

    /// Create a node in `list`, inserted before `before` (appended when
    /// `before` is absent from the list or `None`).
    pub fn insert_before(
        &mut self,
        list: ListId,
        stream: Stream,
        before: Option<AsmNodeId>,
        kind: AsmKind,
    ) -> AsmNodeId {
        let id = self.alloc(stream, kind);
        let items = &mut self.lists[list.0 as usize];
        let at = before
            .and_then(|b| items.iter().position(|&n| n == b))
            .unwrap_or(items.len());
        items.insert(at, id);
        id
    }

    pub fn new_label_node(&mut self) -> AsmNodeId {
        let number = self.next_label;
        self.next_label += 1;
        self.push(AsmKind::Label { number })
    }

    /// Label numbering restarts for each code block (listing cosmetics).
    pub fn reset_labels(&mut self) {
        self.next_label = 0;
    }

    // ── backpatching ─────────────────────────────────────────────────────

    fn reference_mut(&mut self, id: AsmNodeId) -> Option<&mut Reference> {
        match &mut self.node_mut(id).kind {
            AsmKind::Call { reference, .. }
            | AsmKind::Branch { reference, .. }
            | AsmKind::Dispatch { reference, .. }
            | AsmKind::ObjRef { reference, .. } => Some(reference),
            _ => None,
        }
    }

    /// Attach `node` to the pending-use chain headed in `slot`, or resolve
    /// it immediately when the symbol is already defined.
    pub fn add_backpatch(&mut self, slot: &mut crate::symbol::RefSlot, node: AsmNodeId) {
        use crate::symbol::RefSlot;
        match *slot {
            RefSlot::Defined(target) => {
                if let Some(r) = self.reference_mut(node) {
                    r.value = RefValue::Target(target);
                }
            }
            RefSlot::Pending(head) => {
                if let Some(r) = self.reference_mut(node) {
                    r.value = RefValue::Chain(head);
                }
                *slot = RefSlot::Pending(Some(node));
            }
        }
    }

    /// Resolve every reference on the chain headed at `head` to `target`.
    pub fn backpatch(&mut self, head: Option<AsmNodeId>, target: AsmNodeId) {
        let mut cur = head;
        while let Some(id) = cur {
            let next = match self.reference_mut(id) {
                Some(r) => {
                    let next = match r.value {
                        RefValue::Chain(n) => n,
                        RefValue::Target(_) => None,
                    };
                    r.value = RefValue::Target(target);
                    next
                }
                None => None,
            };
            cur = next;
        }
    }

    pub fn set_target(&mut self, id: AsmNodeId, target: AsmNodeId) {
        if let Some(r) = self.reference_mut(id) {
            r.value = RefValue::Target(target);
        }
    }

    // ── sizing and offset assignment ─────────────────────────────────────

    fn target_offset(&self, r: &Reference) -> Option<usize> {
        match r.target() {
            Some(t) => {
                let ofs = self.node(t).offset;
                if ofs == UNASSIGNED {
                    None
                } else {
                    Some(ofs)
                }
            }
            None => None,
        }
    }

    /// Short transfer forms reach targets within a signed 8-bit
    /// displacement of the instruction end.
    fn reachable(a: usize, b: usize) -> bool {
        a.abs_diff(b) < 128
    }

    /// Byte size of a node at its current offset.  During the shrink phase
    /// branches and calls with reachable targets claim the short form;
    /// afterwards the chosen form is frozen.
    pub fn size_of(&mut self, id: AsmNodeId) -> usize {
        // Transfer nodes mutate their opcode byte; handle them first.
        let (new_op, size) = match &self.nodes[id.0 as usize].kind {
            AsmKind::Call { op, reference, .. } => {
                let here = self.nodes[id.0 as usize].offset;
                let (op, sz) = self.transfer_size(*op, reference, here, 5, 1);
                (Some(op), sz)
            }
            AsmKind::Branch { op, reference } => {
                let here = self.nodes[id.0 as usize].offset;
                let (op, sz) = self.transfer_size(*op, reference, here, 4, 0);
                (Some(op), sz)
            }
            k => (None, self.fixed_size(k)),
        };

        if let Some(op2) = new_op {
            match &mut self.nodes[id.0 as usize].kind {
                AsmKind::Call { op, .. } | AsmKind::Branch { op, .. } => *op = op2,
                _ => {}
            }
        }
        size
    }

    fn transfer_size(
        &self,
        op: u8,
        reference: &Reference,
        here: usize,
        span: usize,
        extra: usize,
    ) -> (u8, usize) {
        if !self.shrink {
            let sz = if op & OP_BYTE != 0 { 2 } else { 3 };
            return (op, sz + extra);
        }
        match self.target_offset(reference) {
            None => (op, 3 + extra),
            Some(t) if Self::reachable(t, here.wrapping_add(span)) => (op | OP_BYTE, 2 + extra),
            Some(_) => (op & !OP_BYTE, 3 + extra),
        }
    }

    fn fixed_size(&self, kind: &AsmKind) -> usize {
        match kind {
            AsmKind::Word { .. }
            | AsmKind::Dispatch { .. }
            | AsmKind::IntProp { .. }
            | AsmKind::TextProp { .. }
            | AsmKind::OfsProp { .. }
            | AsmKind::MethodRec { .. } => 2,
            AsmKind::Op { .. } => 1,
            AsmKind::Label { .. } | AsmKind::ObjectHdr { .. } => 0,
            AsmKind::Unsigned { op, .. }
            | AsmKind::Signed { op, .. }
            | AsmKind::VarAccess { op, .. } => {
                if op & OP_BYTE != 0 {
                    2
                } else {
                    3
                }
            }
            AsmKind::EffectiveAddr { op, .. } => {
                if op & OP_BYTE != 0 {
                    3
                } else {
                    5
                }
            }
            AsmKind::ExternCall { op, .. } => {
                let base = if op & !OP_BYTE == OP_CALLE { 3 } else { 2 };
                let wide = if op & OP_BYTE != 0 { 0 } else { 1 };
                base + wide + 1
            }
            AsmKind::Send { .. } => 2,
            AsmKind::Super { op, .. } => (if op & OP_BYTE != 0 { 2 } else { 3 }) + 1,
            AsmKind::ObjRef { .. } | AsmKind::TextOfs { .. } => 3,
            AsmKind::TextRec { str } => str.len() + 1,
            AsmKind::Vars { values } => 2 * (values.len() + 1),
            AsmKind::LineNum { .. } => 3,
            AsmKind::Call { .. } | AsmKind::Branch { .. } => unreachable!(),
            AsmKind::Table { .. } | AsmKind::CodeBlock { .. } => {
                unreachable!("nested lists are sized by set_list_offset")
            }
        }
    }

    /// Assign offsets across `list` starting at `ofs`; returns the offset
    /// past the last node.  Recurses into nested tables and code blocks.
    pub fn set_list_offset(&mut self, list: ListId, mut ofs: usize) -> usize {
        for i in 0..self.lists[list.0 as usize].len() {
            let id = self.lists[list.0 as usize][i];
            self.nodes[id.0 as usize].offset = ofs;
            match &self.nodes[id.0 as usize].kind {
                AsmKind::Table { list: sub, .. } | AsmKind::CodeBlock { list: sub, .. } => {
                    let sub = *sub;
                    ofs = self.set_list_offset(sub, ofs);
                }
                AsmKind::TextRec { .. } => {
                    if self.text_start == UNASSIGNED {
                        self.text_start = ofs;
                    }
                    ofs += self.size_of(id);
                }
                _ => {
                    ofs += self.size_of(id);
                }
            }
        }
        ofs
    }

    // ── helpers for node construction with value fixup ───────────────────

    pub fn set_word(&mut self, id: AsmNodeId, v: i32) {
        if let AsmKind::Word { value } = &mut self.node_mut(id).kind {
            *value = v;
        }
    }

    /// Patch a placeholder immediate.  The operand width chosen at
    /// construction is kept.
    pub fn set_unsigned_value(&mut self, id: AsmNodeId, v: u32) {
        if let AsmKind::Unsigned { value, .. } = &mut self.node_mut(id).kind {
            *value = v;
        }
    }

    pub fn set_num_args(&mut self, id: AsmNodeId, n: u16) {
        match &mut self.node_mut(id).kind {
            AsmKind::Call { num_args, .. }
            | AsmKind::ExternCall { num_args, .. }
            | AsmKind::Send { num_args, .. }
            | AsmKind::Super { num_args, .. } => *num_args = n,
            _ => {}
        }
    }

    pub fn set_ofs_prop_target(&mut self, id: AsmNodeId, target: AsmNodeId) {
        if let AsmKind::OfsProp { target: t, .. } = &mut self.node_mut(id).kind {
            *t = Some(target);
        }
    }
}

impl Default for AsmGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// An unsigned immediate claims the one-byte form when its value fits.
pub fn unsigned_op(op: u8, value: u32) -> u8 {
    op | if value < 256 { OP_BYTE } else { 0 }
}

/// A signed immediate claims the one-byte form when |value| fits in 7 bits.
pub fn signed_op(op: u8, value: i32) -> u8 {
    op | if value.unsigned_abs() < 128 { OP_BYTE } else { 0 }
}

/// Opcode of an external call, chosen by target module.
pub fn extern_op(module: i32, entry: u32) -> u8 {
    match module {
        KERNEL => OP_CALLK | if entry < 256 { OP_BYTE } else { 0 },
        0 => OP_CALLB | if entry < 256 { OP_BYTE } else { 0 },
        m => {
            OP_CALLE
                | if (m as u32) < 256 && entry < 256 {
                    OP_BYTE
                } else {
                    0
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::RefSlot;

    fn graph_with_hunk() -> AsmGraph {
        let mut g = AsmGraph::new();
        g.open_stream(Stream::Hunk);
        g
    }

    #[test]
    fn backpatch_resolves_whole_chain() {
        let mut g = graph_with_hunk();
        let mut slot = RefSlot::Pending(None);

        let b1 = g.push(AsmKind::Branch {
            op: OP_BNT,
            reference: Reference::new(),
        });
        g.add_backpatch(&mut slot, b1);
        let b2 = g.push(AsmKind::Branch {
            op: OP_JMP,
            reference: Reference::new(),
        });
        g.add_backpatch(&mut slot, b2);

        let head = match slot {
            RefSlot::Pending(h) => h,
            _ => panic!("slot must still be pending"),
        };
        assert_eq!(head, Some(b2));

        let label = g.new_label_node();
        g.backpatch(head, label);

        for id in [b1, b2] {
            match &g.node(id).kind {
                AsmKind::Branch { reference, .. } => {
                    assert_eq!(reference.target(), Some(label));
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn already_defined_symbols_resolve_directly() {
        let mut g = graph_with_hunk();
        let target = g.push_op(OP_RET);
        let mut slot = RefSlot::Defined(target);
        let d = g.push(AsmKind::Dispatch {
            reference: Reference::new(),
            sym: None,
        });
        g.add_backpatch(&mut slot, d);
        match &g.node(d).kind {
            AsmKind::Dispatch { reference, .. } => assert_eq!(reference.target(), Some(target)),
            _ => unreachable!(),
        }
        assert_eq!(slot, RefSlot::Defined(target));
    }

    #[test]
    fn branch_claims_short_form_only_while_shrinking() {
        let mut g = graph_with_hunk();
        let b = g.push(AsmKind::Branch {
            op: OP_JMP,
            reference: Reference::new(),
        });
        let l = g.new_label_node();
        g.set_target(b, l);

        g.set_list_offset(g.hunk.list, 0);
        // Without shrinking, the long form is kept.
        assert_eq!(g.size_of(b), 3);

        g.shrink = true;
        g.set_list_offset(g.hunk.list, 0);
        assert_eq!(g.size_of(b), 2);

        // The claimed short form survives stabilization.
        g.shrink = false;
        assert_eq!(g.size_of(b), 2);
    }

    #[test]
    fn unsigned_width_tracks_value() {
        assert_eq!(unsigned_op(OP_PUSHI, 3), OP_PUSHI | OP_BYTE);
        assert_eq!(unsigned_op(OP_PUSHI, 256), OP_PUSHI);
        assert_eq!(signed_op(OP_LOADI, -127), OP_LOADI | OP_BYTE);
        assert_eq!(signed_op(OP_LOADI, 128), OP_LOADI);
        assert_eq!(extern_op(KERNEL, 4), OP_CALLK | OP_BYTE);
        assert_eq!(extern_op(0, 700), OP_CALLB);
        assert_eq!(extern_op(12, 3), OP_CALLE | OP_BYTE);
    }
}

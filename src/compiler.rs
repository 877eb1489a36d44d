/// Lowering: parse tree → assembly-node graph.
///
/// One routine per parse-node kind, each appending nodes to the current
/// emission list.  Object bodies temporarily redirect the current list
/// into the heap stream; everything else lands in the hunk.  Forward
/// references (calls, object loads, branches to labels) go through the
/// backpatch chains threaded through the symbols.

use crate::anode::*;
use crate::ast::{PNode, PnKind};
use crate::bytecode::*;
use crate::object::{ObjectId, SelTag, OBJECTNUM};
use crate::session::{LoopFrame, LoopKind, Session};
use crate::symbol::{self, Keyword, Payload, RefSlot, SymType, SymbolId};

impl Session {
    /// Start the assembly lists for a translation unit.
    pub fn init_asm(&mut self) {
        self.local_vars.kill();
        self.asm.clear();
        self.last_line_num = 0;

        // Both streams lead with the offset of their fixup table.
        self.asm.open_stream(Stream::Heap);
        self.asm.push(AsmKind::Word { value: 0 });
        self.asm.close_list();

        self.asm.open_stream(Stream::Hunk);
        self.asm.push(AsmKind::Word { value: 0 });
        // Slot for the loader's heap pointer, then the far-text flag.
        self.asm.push(AsmKind::Word { value: 0 });
        self.asm.push(AsmKind::Word { value: 0 });
        let count = self.asm.push(AsmKind::Word { value: 0 });
        let entries = self.asm.new_list();
        self.asm.push(AsmKind::Table {
            name: "dispatch table",
            list: entries,
        });
        self.num_disp_entries = Some(count);
        self.disp_list = Some(entries);
        // The hunk stays the current list for top-level code.
    }

    // ── backpatch plumbing ───────────────────────────────────────────────

    /// Route `node` through the symbol's resolution slot: resolved
    /// directly when the symbol is defined, chained otherwise.
    fn backpatch_via_symbol(&mut self, sym: SymbolId, node: AsmNodeId) {
        let mut slot = std::mem::take(&mut self.syms.get_mut(sym).slot);
        self.asm.add_backpatch(&mut slot, node);
        self.syms.get_mut(sym).slot = slot;
    }

    /// Define `sym` as `target`, resolving every pending use.
    fn define_symbol_here(&mut self, sym: SymbolId, target: AsmNodeId) {
        let slot = std::mem::take(&mut self.syms.get_mut(sym).slot);
        if let RefSlot::Pending(head) = slot {
            self.asm.backpatch(head, target);
        }
        self.syms.get_mut(sym).slot = RefSlot::Defined(target);
    }

    /// Emit a label for every branch pending on `slot`, then clear it.
    pub fn make_label(&mut self, slot: &mut RefSlot) {
        if let RefSlot::Pending(Some(head)) = *slot {
            let lab = self.asm.new_label_node();
            self.asm.backpatch(Some(head), lab);
        }
        *slot = RefSlot::Pending(None);
    }

    fn branch_to_slot(&mut self, op: u8, slot: &mut RefSlot) {
        let b = self.asm.push(AsmKind::Branch {
            op,
            reference: Reference::new(),
        });
        self.asm.add_backpatch(slot, b);
    }

    fn branch_to_node(&mut self, op: u8, target: AsmNodeId) {
        let b = self.asm.push(AsmKind::Branch {
            op,
            reference: Reference::new(),
        });
        self.asm.set_target(b, target);
    }

    // ── main dispatch ────────────────────────────────────────────────────

    /// Recursively compile code for a parse node.
    pub fn compile(&mut self, pn: &PNode) {
        if self.config.include_debug_info
            && pn.kind != PnKind::Proc
            && pn.kind != PnKind::Method
            && pn.line > self.last_line_num
        {
            self.asm.push(AsmKind::LineNum { line: pn.line });
            self.last_line_num = pn.line;
        }

        match pn.kind {
            PnKind::Elist => {
                for child in &pn.children {
                    self.compile(child);
                }
            }
            PnKind::Expr => {
                if let Some(c) = pn.first() {
                    self.compile(c);
                }
            }
            PnKind::Assign => self.make_assign(pn),
            PnKind::Select | PnKind::Num => self.make_immediate(pn.val),
            PnKind::String => self.make_string(pn),
            PnKind::Global
            | PnKind::Local
            | PnKind::Tmp
            | PnKind::Parm
            | PnKind::Index
            | PnKind::Prop => self.make_access(pn, OP_LDST | OP_LOAD),
            PnKind::Class => self.make_class_id(pn),
            PnKind::Obj => self.make_obj_id(pn),
            PnKind::Extern | PnKind::Call => self.make_call(pn),
            PnKind::Send => self.make_send(pn),
            PnKind::Unary => self.make_unary(pn),
            PnKind::Binary => self.make_binary(pn),
            PnKind::Nary => self.make_nary(pn),
            PnKind::Comp => self.make_comp(pn),
            PnKind::Return => self.make_return(pn),
            PnKind::If => self.make_if(pn),
            PnKind::Cond => self.make_cond(pn),
            PnKind::Switch | PnKind::SwitchTo => self.make_switch(pn),
            PnKind::IncDec => self.make_incdec(pn),
            PnKind::Proc | PnKind::Method => self.make_proc(pn),
            PnKind::While => self.make_while(pn),
            PnKind::Repeat => self.make_repeat(pn),
            PnKind::For => self.make_for(pn),
            PnKind::Break => self.make_break(pn),
            PnKind::BreakIf => self.make_break_if(pn),
            PnKind::Cont => self.make_continue(pn),
            PnKind::ContIf => self.make_cont_if(pn),
            _ => self.error(&format!(
                "Internal error: unhandled node type in compile(): {:?}",
                pn.kind
            )),
        }
    }

    // ── leaves ───────────────────────────────────────────────────────────

    fn make_immediate(&mut self, val: i32) {
        self.asm.push(AsmKind::Signed {
            op: signed_op(OP_LOADI, val),
            value: val,
        });
    }

    fn make_string(&mut self, pn: &PNode) {
        self.asm.push(AsmKind::TextOfs {
            ofs: pn.val as u32,
        });
    }

    /// Compile code to access the variable indicated by `pn`.
    fn make_access(&mut self, pn: &PNode, code: u8) {
        let mut code = code;
        let indexed = pn.kind == PnKind::Index;
        let (addr, var_kind, sym) = if indexed {
            let child = &pn.children[0];
            if code == OP_LDST | OP_STORE {
                // The value to store goes on the stack under the index.
                self.asm.push_op(OP_PUSH);
            }
            self.compile(&pn.children[1]);
            if code != OP_LEA {
                code |= OP_INDEX;
            }
            (child.val as u16, child.kind, child.sym)
        } else {
            (pn.val as u16, pn.kind, pn.sym)
        };

        if code == OP_LEA {
            let mut ea = match var_kind {
                PnKind::Global => OP_GLOBAL,
                PnKind::Local => OP_LOCAL,
                PnKind::Tmp => OP_TMP,
                PnKind::Parm => OP_PARM,
                _ => panic!("bad variable type in make_access()"),
            };
            if indexed {
                ea |= OP_INDEX;
            }
            let op = if addr < 256 { code | OP_BYTE } else { code };
            self.asm.push(AsmKind::EffectiveAddr {
                op,
                ea_type: ea,
                addr,
                sym,
            });
            return;
        }

        if var_kind == PnKind::Prop {
            code = match code & OP_TYPE {
                OP_STORE => OP_ATOP,
                OP_INC => OP_IPTOA,
                OP_DEC => OP_DPTOA,
                _ => OP_PTOA,
            };
        } else {
            code |= match var_kind {
                PnKind::Global => OP_GLOBAL,
                PnKind::Local => OP_LOCAL,
                PnKind::Tmp => OP_TMP,
                PnKind::Parm => OP_PARM,
                _ => {
                    self.error("Internal error: bad variable type in make_access()");
                    return;
                }
            };
        }
        if addr < 256 {
            code |= OP_BYTE;
        }
        self.asm.push(AsmKind::VarAccess { op: code, addr, sym });
    }

    fn make_class_id(&mut self, pn: &PNode) {
        let num = pn
            .sym
            .and_then(|s| self.syms.get(s).obj())
            .map(|o| self.classes.get(o).num)
            .unwrap_or(pn.val);
        self.asm.push(AsmKind::Unsigned {
            op: unsigned_op(OP_CLASS, num as u32),
            value: num as u32,
            sym: pn.sym,
        });
    }

    fn make_obj_id(&mut self, pn: &PNode) {
        let sym_id = match pn.sym {
            Some(s) => s,
            None => return,
        };
        if self.syms.get(sym_id).payload == Payload::Int(symbol::OBJ_SELF) {
            self.asm.push_op(OP_SELF_ID);
            return;
        }

        let an = self.asm.push(AsmKind::ObjRef {
            reference: Reference::new(),
            sym: sym_id,
        });
        let obj = self.syms.get(sym_id).obj();
        let defined_elsewhere = match obj {
            Some(o) if Some(o) != self.cur_obj => self.classes.get(o).an,
            _ => None,
        };
        match defined_elsewhere {
            Some(target) => self.asm.set_target(an, target),
            None => self.backpatch_via_symbol(sym_id, an),
        }
    }

    fn make_call(&mut self, pn: &PNode) {
        // Arg count placeholder, patched once the args are compiled.
        let count = self.asm.push(AsmKind::Unsigned {
            op: unsigned_op(OP_PUSHI, 0),
            value: 0,
            sym: None,
        });
        let num_args = self.make_args(&pn.children);
        self.asm.set_unsigned_value(count, num_args as u32);

        let sym_id = match pn.sym {
            Some(s) => s,
            None => return,
        };
        if pn.kind == PnKind::Call {
            let call = self.asm.push(AsmKind::Call {
                op: OP_CALL,
                reference: Reference::new(),
                num_args: (2 * num_args) as u16,
                sym: sym_id,
            });
            self.backpatch_via_symbol(sym_id, call);
        } else {
            let (script, entry) = match self.syms.get(sym_id).payload {
                Payload::Extern { script, entry } => (script, entry),
                _ => {
                    let name = self.syms.name(sym_id).to_string();
                    self.error(&format!("Not an external procedure: {}", name));
                    return;
                }
            };
            self.asm.push(AsmKind::ExternCall {
                op: extern_op(script, entry),
                module: script,
                entry,
                num_args: (2 * num_args) as u16,
                sym: sym_id,
            });
        }
    }

    /// Push call/message arguments.  A rest-parameter child emits its own
    /// instruction rather than a pushed value.
    fn make_args(&mut self, args: &[PNode]) -> i32 {
        let mut num_args = 0;
        for arg in args {
            if arg.kind == PnKind::Rest {
                self.asm.push(AsmKind::Unsigned {
                    op: OP_REST | OP_BYTE,
                    value: arg.val as u32,
                    sym: None,
                });
            } else {
                self.compile(arg);
                self.asm.push_op(OP_PUSH);
                num_args += 1;
            }
        }
        num_args
    }

    fn make_send(&mut self, pn: &PNode) {
        let receiver = &pn.children[0];

        let mut num_args = 0;
        for msg in &pn.children[1..] {
            num_args += self.make_message(&msg.children);
        }

        let an = if receiver.kind == PnKind::Obj && receiver.val == symbol::OBJ_SELF {
            self.asm.push(AsmKind::Send {
                op: OP_SELF,
                num_args: 0,
            })
        } else if receiver.kind == PnKind::Super {
            let class_num = receiver.val as u32;
            self.asm.push(AsmKind::Super {
                op: unsigned_op(OP_SUPER, class_num),
                class_num,
                num_args: 0,
                sym: receiver.sym.unwrap_or(SymbolId(0)),
            })
        } else {
            self.compile(receiver);
            self.asm.push(AsmKind::Send {
                op: OP_SEND,
                num_args: 0,
            })
        };
        self.asm.set_num_args(an, (2 * num_args) as u16);
    }

    /// Push one message group: selector, arg count, arguments.  Returns
    /// the number of stack words the group occupies.
    fn make_message(&mut self, msg: &[PNode]) -> i32 {
        self.compile(&msg[0]);
        self.asm.push_op(OP_PUSH);

        // The count placeholder keeps the word form: its value is not
        // known until the arguments have been compiled.
        let count = self.asm.push(AsmKind::Unsigned {
            op: OP_PUSHI,
            value: 0,
            sym: None,
        });
        let n = self.make_args(&msg[1..]);
        self.asm.set_unsigned_value(count, n as u32);
        n + 2
    }

    // ── operators ────────────────────────────────────────────────────────

    fn make_unary(&mut self, pn: &PNode) {
        if let Some(c) = pn.first() {
            self.compile(c);
        }
        let op = match pn.val {
            symbol::U_NEG => OP_NEG,
            symbol::U_NOT => OP_NOT,
            _ => OP_BNOT,
        };
        self.asm.push_op(op);
    }

    fn make_binary(&mut self, pn: &PNode) {
        self.compile(&pn.children[0]);
        self.asm.push_op(OP_PUSH);
        self.compile(&pn.children[1]);
        let op = match pn.val {
            symbol::B_MINUS => OP_SUB,
            symbol::B_DIV => OP_DIV,
            symbol::B_SLEFT => OP_SHL,
            symbol::B_SRIGHT => OP_SHR,
            _ => OP_MOD,
        };
        self.asm.push_op(op);
    }

    fn make_nary(&mut self, pn: &PNode) {
        self.compile(&pn.children[0]);
        let op = match pn.val {
            symbol::N_PLUS => OP_ADD,
            symbol::N_MUL => OP_MUL,
            symbol::N_BITOR => OP_OR,
            symbol::N_BITAND => OP_AND,
            _ => OP_XOR,
        };
        for arg in &pn.children[1..] {
            self.asm.push_op(OP_PUSH);
            self.compile(arg);
            self.asm.push_op(op);
        }
    }

    fn make_assign(&mut self, pn: &PNode) {
        // Arithmetic-op assignments start with the current value on the
        // stack.
        if pn.val != symbol::A_EQ {
            self.make_access(&pn.children[0], OP_LDST | OP_LOAD);
            self.asm.push_op(OP_PUSH);
        }

        self.compile(&pn.children[1]);

        if pn.val != symbol::A_EQ {
            let op = match pn.val {
                symbol::A_PLUS => OP_ADD,
                symbol::A_MUL => OP_MUL,
                symbol::A_MINUS => OP_SUB,
                symbol::A_DIV => OP_DIV,
                symbol::A_SLEFT => OP_SHL,
                symbol::A_SRIGHT => OP_SHR,
                symbol::A_XOR => OP_XOR,
                symbol::A_AND => OP_AND,
                _ => OP_OR,
            };
            self.asm.push_op(op);
        }

        self.make_access(&pn.children[0], OP_LDST | OP_STORE);
    }

    fn make_return(&mut self, pn: &PNode) {
        if let Some(c) = pn.first() {
            self.compile(c);
        }
        self.asm.push_op(OP_RET);
    }

    /// Comparisons are nary with an early out: the moment the truth value
    /// is known, evaluation stops.
    fn make_comp(&mut self, pn: &PNode) {
        match pn.val {
            symbol::N_OR => self.make_or(&pn.children),
            symbol::N_AND => self.make_and(&pn.children),
            op => {
                let mut early_out = RefSlot::Pending(None);

                self.compile(&pn.children[0]);
                self.asm.push_op(OP_PUSH);
                self.compile(&pn.children[1]);
                self.make_comp_op(op);

                for node in &pn.children[2..] {
                    self.branch_to_slot(OP_BNT, &mut early_out);
                    // Re-push the previous operand to chain the test.
                    self.asm.push_op(OP_PPREV);
                    self.compile(node);
                    self.make_comp_op(op);
                }

                self.make_label(&mut early_out);
            }
        }
    }

    fn make_and(&mut self, args: &[PNode]) {
        let mut early_out = RefSlot::Pending(None);
        self.compile(&args[0]);
        for arg in &args[1..] {
            self.branch_to_slot(OP_BNT, &mut early_out);
            self.compile(arg);
        }
        self.make_label(&mut early_out);
    }

    fn make_or(&mut self, args: &[PNode]) {
        let mut early_out = RefSlot::Pending(None);
        self.compile(&args[0]);
        for arg in &args[1..] {
            self.branch_to_slot(OP_BT, &mut early_out);
            self.compile(arg);
        }
        self.make_label(&mut early_out);
    }

    fn make_comp_op(&mut self, op: i32) {
        let code = match op {
            symbol::C_GT => OP_GT,
            symbol::C_GE => OP_GE,
            symbol::C_LT => OP_LT,
            symbol::C_LE => OP_LE,
            symbol::C_EQ => OP_EQ,
            symbol::C_NE => OP_NE,
            symbol::C_UGT => OP_UGT,
            symbol::C_UGE => OP_UGE,
            symbol::C_ULT => OP_ULT,
            _ => OP_ULE,
        };
        self.asm.push_op(code);
    }

    // ── control flow ─────────────────────────────────────────────────────

    fn make_if(&mut self, pn: &PNode) {
        self.compile(&pn.children[0]);

        let mut else_label = RefSlot::Pending(None);
        self.branch_to_slot(OP_BNT, &mut else_label);

        if let Some(then) = pn.child(1) {
            self.compile(then);
        }

        match pn.child(2) {
            None => self.make_label(&mut else_label),
            Some(_) => {
                let mut done_label = RefSlot::Pending(None);
                self.branch_to_slot(OP_JMP, &mut done_label);
                self.make_label(&mut else_label);
                // The else branch is compiled after its entry label.
                let else_body = &pn.children[2];
                self.compile(else_body);
                self.make_label(&mut done_label);
            }
        }
    }

    fn make_cond(&mut self, pn: &PNode) {
        let mut done = RefSlot::Pending(None);
        let mut next = RefSlot::Pending(None);
        let mut else_seen = false;

        // Children alternate between tests and bodies; bodies are always
        // expression lists, which is how a missing body is recognized.
        let mut i = 0;
        while i < pn.children.len() {
            let condition = &pn.children[i];
            i += 1;
            let body = if i < pn.children.len() && pn.children[i].kind == PnKind::Elist {
                let b = Some(&pn.children[i]);
                i += 1;
                b
            } else {
                None
            };
            let at_end = i == pn.children.len();

            if condition.kind != PnKind::Else {
                if else_seen {
                    self.error("Else must come at end of cond statement");
                }
                self.compile(condition);

                // A trailing test with no body simply falls through.
                if at_end && body.is_none() {
                    break;
                }
                if body.is_some() && at_end {
                    self.branch_to_slot(OP_BNT, &mut done);
                } else {
                    self.branch_to_slot(OP_BNT, &mut next);
                }
            } else if else_seen {
                self.error("Multiple else clauses");
            } else {
                else_seen = true;
            }

            if let Some(body) = body {
                self.compile(body);
            }

            if !at_end {
                self.branch_to_slot(OP_JMP, &mut done);
                self.make_label(&mut next);
            }
        }

        self.make_label(&mut done);
    }

    fn make_switch(&mut self, pn: &PNode) {
        let mut done = RefSlot::Pending(None);
        let mut next = RefSlot::Pending(None);
        let mut else_seen = false;

        // The switch value lives on the stack for the whole statement.
        self.compile(&pn.children[0]);
        self.asm.push_op(OP_PUSH);

        let cases = &pn.children[1..];
        let mut i = 0;
        while i < cases.len() {
            let case = &cases[i];
            i += 1;
            let body = if i < cases.len() && cases[i].kind == PnKind::Elist {
                let b = Some(&cases[i]);
                i += 1;
                b
            } else {
                None
            };
            let at_end = i == cases.len();

            if case.kind != PnKind::Else {
                if else_seen {
                    self.error("Else must come at end of switch statement");
                }
                self.asm.push_op(OP_DUP);
                self.compile(case);
                self.asm.push_op(OP_EQ);

                if at_end && body.is_none() {
                    break;
                }
                if at_end && body.is_some() {
                    self.branch_to_slot(OP_BNT, &mut done);
                } else {
                    self.branch_to_slot(OP_BNT, &mut next);
                }
            } else if else_seen {
                self.error("Multiple else clauses");
            } else {
                else_seen = true;
            }

            if let Some(body) = body {
                self.compile(body);
            }

            if !at_end {
                self.branch_to_slot(OP_JMP, &mut done);
                self.make_label(&mut next);
            }
        }

        self.make_label(&mut done);

        // Take the switch value off the stack.
        self.asm.push_op(OP_TOSS);
    }

    fn make_incdec(&mut self, pn: &PNode) {
        let code = if pn.val == Keyword::Inc as i32 {
            OP_LDST | OP_INC
        } else {
            OP_LDST | OP_DEC
        };
        if let Some(c) = pn.first() {
            self.make_access(c, code);
        }
    }

    // ── loops ────────────────────────────────────────────────────────────

    fn push_loop(&mut self, kind: LoopKind) -> AsmNodeId {
        let start = self.asm.new_label_node();
        self.loops.push(LoopFrame {
            kind,
            start,
            cont: RefSlot::Defined(start),
            end: RefSlot::Pending(None),
        });
        start
    }

    /// Branch through a slot owned by a loop frame.
    fn branch_to_loop_slot(&mut self, op: u8, idx: usize, end: bool) {
        let mut slot = {
            let frame = &mut self.loops[idx];
            std::mem::take(if end { &mut frame.end } else { &mut frame.cont })
        };
        self.branch_to_slot(op, &mut slot);
        let frame = &mut self.loops[idx];
        *(if end { &mut frame.end } else { &mut frame.cont }) = slot;
    }

    fn finish_loop(&mut self) {
        let mut frame = self.loops.pop().expect("loop stack underflow");
        self.make_label(&mut frame.end);
    }

    fn make_while(&mut self, pn: &PNode) {
        let start = self.push_loop(LoopKind::While);

        self.compile(&pn.children[0]);
        let idx = self.loops.len() - 1;
        self.branch_to_loop_slot(OP_BNT, idx, true);

        if let Some(body) = pn.child(1) {
            self.compile(body);
        }

        self.branch_to_node(OP_JMP, start);
        self.finish_loop();
    }

    fn make_repeat(&mut self, pn: &PNode) {
        let start = self.push_loop(LoopKind::Repeat);

        if let Some(body) = pn.child(0) {
            self.compile(body);
        }

        self.branch_to_node(OP_JMP, start);
        self.finish_loop();
    }

    fn make_for(&mut self, pn: &PNode) {
        // children: init list, condition, step list, body list.
        self.compile(&pn.children[0]);

        let start = self.push_loop(LoopKind::For);
        let idx = self.loops.len() - 1;
        // The continue label points at the step, not the test.
        self.loops[idx].cont = RefSlot::Pending(None);

        self.compile(&pn.children[1]);
        self.branch_to_loop_slot(OP_BNT, idx, true);

        self.compile(&pn.children[3]);

        let mut cont = std::mem::take(&mut self.loops[idx].cont);
        self.make_label(&mut cont);
        self.loops[idx].cont = cont;
        self.compile(&pn.children[2]);

        self.branch_to_node(OP_JMP, start);
        self.finish_loop();
    }

    /// Loop frame `level` levels out from the innermost, saturating at
    /// the outermost.
    fn loop_at_level(&mut self, level: i32) -> Option<usize> {
        if self.loops.is_empty() {
            self.error("Not in a loop.");
            return None;
        }
        let out = (level.max(1) - 1) as usize;
        Some(self.loops.len() - 1 - out.min(self.loops.len() - 1))
    }

    fn make_break(&mut self, pn: &PNode) {
        if let Some(idx) = self.loop_at_level(pn.val) {
            self.branch_to_loop_slot(OP_JMP, idx, true);
        }
    }

    fn make_break_if(&mut self, pn: &PNode) {
        if let Some(c) = pn.first() {
            self.compile(c);
        }
        if let Some(idx) = self.loop_at_level(pn.val) {
            self.branch_to_loop_slot(OP_BT, idx, true);
        }
    }

    fn make_continue(&mut self, pn: &PNode) {
        if let Some(idx) = self.loop_at_level(pn.val) {
            if self.loops[idx].kind == LoopKind::For {
                self.branch_to_loop_slot(OP_JMP, idx, false);
            } else {
                let start = self.loops[idx].start;
                self.branch_to_node(OP_JMP, start);
            }
        }
    }

    fn make_cont_if(&mut self, pn: &PNode) {
        if let Some(c) = pn.first() {
            self.compile(c);
        }
        if let Some(idx) = self.loop_at_level(pn.val) {
            if self.loops[idx].kind == LoopKind::For {
                self.branch_to_loop_slot(OP_BT, idx, false);
            } else {
                let start = self.loops[idx].start;
                self.branch_to_node(OP_BT, start);
            }
        }
    }

    // ── procedures, methods, objects ─────────────────────────────────────

    /// Compile a whole procedure or method body.
    fn make_proc(&mut self, pn: &PNode) {
        let sym_id = pn.sym.expect("procedure node without symbol");
        let kind = if pn.kind == PnKind::Proc {
            CodeKind::Proc
        } else {
            CodeKind::Method
        };

        let list = self.asm.new_list();
        let block = self.asm.push(AsmKind::CodeBlock {
            kind,
            sym: sym_id,
            obj: self.cur_obj,
            list,
        });
        if self.asm.code_start.is_none() {
            self.asm.code_start = Some(block);
        }
        self.asm.reset_labels();

        self.syms.get_mut(sym_id).ty = if kind == CodeKind::Proc {
            SymType::Proc
        } else {
            SymType::Select
        };

        // Resolve every call that was already compiled against this
        // procedure.
        self.define_symbol_here(sym_id, block);

        self.asm.open_list(list);

        if self.config.include_debug_info {
            self.asm.push(AsmKind::LineNum { line: pn.line });
            self.last_line_num = pn.line;
        }

        // Reserve the temporary variables.
        if pn.val != 0 {
            self.asm.push(AsmKind::Unsigned {
                op: unsigned_op(OP_LINK, pn.val as u32),
                value: pn.val as u32,
                sym: None,
            });
        }

        if let Some(body) = pn.child(0) {
            self.compile(body);
        }

        if self.config.include_debug_info {
            let line = self.cur_line;
            self.asm.push(AsmKind::LineNum { line });
        }
        self.asm.push_op(OP_RET);

        self.asm.close_list();
    }

    /// Build the dispatch table from the `public` declarations.
    pub fn make_dispatch(&mut self, max_entry: i32) {
        let list = self.disp_list.expect("assembly not initialized");
        if let Some(count) = self.num_disp_entries {
            self.asm.set_word(count, max_entry + 1);
        }

        self.asm.open_list(list);
        for n in 0..=max_entry {
            // The latest declaration of an entry number wins.
            let sym = self
                .publics
                .iter()
                .rev()
                .find(|p| p.entry == n as u32)
                .map(|p| p.sym);
            let d = self.asm.push(AsmKind::Dispatch {
                reference: Reference::new(),
                sym,
            });
            if let Some(sym) = sym {
                self.backpatch_via_symbol(sym, d);
            }
        }
        self.asm.close_list();
    }

    /// Lower an object: template and property values on the heap, class
    /// dictionaries on the hunk (before the first code block).
    pub fn make_object(&mut self, obj_id: ObjectId) {
        let (obj_sym, obj_num, selectors) = {
            let o = self.classes.get(obj_id);
            (o.sym, o.num, o.selectors.clone())
        };

        let mut p_dict = None;
        let mut m_dict = None;

        // Heap side: object header and the property table.
        self.asm.open_stream(Stream::Heap);
        let hdr = self.asm.push(AsmKind::ObjectHdr {
            sym: obj_sym,
            num: obj_num,
        });
        self.classes.get_mut(obj_id).an = Some(hdr);

        let props_list = self.asm.new_list();
        let props = self.asm.push(AsmKind::Table {
            name: "properties",
            list: props_list,
        });
        self.asm.open_list(props_list);
        for sn in selectors.iter().filter(|sn| sn.tag.is_property()) {
            match sn.tag {
                SelTag::Text => {
                    self.asm.push(AsmKind::TextProp {
                        sym: sn.sym,
                        val: sn.val,
                    });
                }
                SelTag::PropDict => {
                    p_dict = Some(self.asm.push(AsmKind::OfsProp {
                        sym: sn.sym,
                        target: None,
                    }));
                }
                SelTag::MethDict => {
                    m_dict = Some(self.asm.push(AsmKind::OfsProp {
                        sym: sn.sym,
                        target: None,
                    }));
                }
                _ => {
                    self.asm.push(AsmKind::IntProp {
                        sym: sn.sym,
                        val: sn.val,
                    });
                }
            }
        }
        self.asm.close_list();
        self.asm.close_list(); // heap stream

        // References to the object resolve to its property table.
        self.define_symbol_here(obj_sym, props);

        // Hunk side: the dictionaries go in front of all code.
        let hunk = self.asm.hunk.list;
        let before = self.asm.code_start;
        self.asm.insert_before(
            hunk,
            Stream::Hunk,
            before,
            AsmKind::ObjectHdr {
                sym: obj_sym,
                num: obj_num,
            },
        );

        let pd_list = self.asm.new_list();
        let pd = self.asm.insert_before(
            hunk,
            Stream::Hunk,
            before,
            AsmKind::Table {
                name: "property dictionary",
                list: pd_list,
            },
        );
        self.asm.open_list(pd_list);
        if obj_num != OBJECTNUM {
            for sn in selectors.iter().filter(|sn| sn.tag.is_property()) {
                self.asm.push(AsmKind::Word { value: sn.num });
            }
        }
        self.asm.close_list();
        if let Some(p) = p_dict {
            self.asm.set_ofs_prop_target(p, pd);
        }

        let md_list = self.asm.new_list();
        let md = self.asm.insert_before(
            hunk,
            Stream::Hunk,
            before,
            AsmKind::Table {
                name: "method dictionary",
                list: md_list,
            },
        );
        self.asm.open_list(md_list);
        let count_word = self.asm.push(AsmKind::Word { value: 0 });
        let mut num_meth = 0;
        for sn in selectors.iter().filter(|sn| sn.tag == SelTag::Local) {
            if let Some(code) = sn.code {
                self.asm.push(AsmKind::Word { value: sn.num });
                self.asm.push(AsmKind::MethodRec {
                    sym: sn.sym,
                    method: code,
                });
                // Release the selector symbol for the next object that
                // defines it.
                self.syms.get_mut(sn.sym).slot = RefSlot::Pending(None);
                num_meth += 1;
            }
        }
        self.asm.set_word(count_word, num_meth);
        self.asm.close_list();
        if let Some(m) = m_dict {
            self.asm.set_ofs_prop_target(m, md);
        }
    }

    /// Append the text pool to the heap, after a terminating null word.
    pub fn make_text(&mut self) {
        self.asm.open_stream(Stream::Heap);
        self.asm.push(AsmKind::Word { value: 0 });
        let strings: Vec<String> = self.text.items().iter().map(|t| t.str.clone()).collect();
        for s in strings {
            self.asm.push(AsmKind::TextRec { str: s });
        }
        self.asm.close_list();
    }
}

/// Expression grammar.
///
/// All compound expressions are parenthesized with the operator first.
/// Nary, binary, and unary operators with all-constant operands collapse
/// to a single numeric node at parse time.

use crate::ast::{PNode, PnKind};
use crate::errors::{PResult, Unwind};
use crate::object::SelTag;
use crate::parser::{Parser, OPTIONAL, REQUIRED};
use crate::symbol::*;

impl<'s> Parser<'s> {
    /// `expression-list ::= expression*` — the expressions are collected
    /// under a single list node.
    pub fn expr_list_into(&mut self, parent: &mut PNode, required: bool) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::Elist, self.line());

        let mut req = required;
        let mut num_expr = 0;
        while self.expression(&mut pn, req)? {
            num_expr += 1;
            req = false;
        }

        if num_expr > 0 {
            parent.add(pn);
        }
        Ok(!req)
    }

    /// A single expression in value position.
    pub fn expression(&mut self, parent: &mut PNode, required: bool) -> PResult<bool> {
        let line = self.line();
        let looked = self.lookup_tok()?;

        if self.is_var() {
            self.unget();
            return self.variable(parent);
        }

        match self.ty() {
            SymType::Num => {
                let mut pn = PNode::new(PnKind::Num, line);
                pn.val = self.val();
                parent.add(pn);
                Ok(true)
            }

            SymType::Rest => {
                let mut pn = PNode::new(PnKind::Rest, line);
                pn.val = self.val();
                parent.add(pn);
                Ok(true)
            }

            SymType::Select => {
                if looked.is_some() {
                    let t = self.text();
                    self.error(&format!("Selector {} used as value without #", t))?;
                }
                Ok(false)
            }

            SymType::Ident | SymType::Obj => {
                // Unknown identifiers are assumed to be objects defined
                // elsewhere.
                let sym = if self.ty() == SymType::Ident {
                    let name = self.text();
                    let id = self.sess.syms.install_module(&name, SymType::Obj);
                    self.lex.tok.ty = SymType::Obj;
                    self.lex.tok.sym = Some(id);
                    id
                } else {
                    looked.expect("object token carries its symbol")
                };
                let mut pn = PNode::new(PnKind::Obj, line);
                pn.sym = Some(sym);
                // `self` and friends keep their sentinel values visible to
                // the lowering.
                if let Payload::Int(v) = self.sess.syms.get(sym).payload {
                    pn.val = v;
                }
                parent.add(pn);
                Ok(true)
            }

            SymType::Class => {
                let mut pn = PNode::new(PnKind::Class, line);
                if self.val() == OBJ_SUPER {
                    match self.super_of_cur_obj() {
                        Some((sym, num)) => {
                            pn.sym = Some(sym);
                            pn.val = num;
                        }
                        None => {
                            self.severe("Not in a method.")?;
                            return Ok(false);
                        }
                    }
                } else {
                    pn.sym = looked;
                    pn.val = looked
                        .and_then(|s| self.sess.syms.get(s).obj())
                        .map(|o| self.sess.classes.get(o).num)
                        .unwrap_or(0);
                }
                parent.add(pn);
                Ok(true)
            }

            SymType::Str => {
                let mut pn = PNode::new(PnKind::String, line);
                let text = self.text();
                pn.val = self.sess.text.find(&text) as i32;
                parent.add(pn);
                Ok(true)
            }

            SymType::OpenP => {
                let is_expr = self.compound_expression(parent)?;
                let closed = self.close_block()?;
                Ok(closed && is_expr)
            }

            _ => {
                if required {
                    let t = self.text();
                    self.severe(&format!("Expression required: {}", t))?;
                } else {
                    self.unget();
                }
                Ok(false)
            }
        }
    }

    /// Class number and symbol of the current object's superclass.
    fn super_of_cur_obj(&self) -> Option<(SymbolId, i32)> {
        let obj = self.sess.cur_obj?;
        let sup = self.sess.classes.find(self.sess.classes.get(obj).super_num)?;
        let sup = self.sess.classes.get(sup);
        Some((sup.sym, sup.num))
    }

    /// The parenthesized expression forms: calls, sends, operators, and
    /// control flow.
    fn compound_expression(&mut self, parent: &mut PNode) -> PResult<bool> {
        let old_select_var = self.selector_is_var;
        self.selector_is_var = true;

        let r = self.compound_expression_inner(parent);

        self.selector_is_var = old_select_var;
        r
    }

    fn compound_expression_inner(&mut self, parent: &mut PNode) -> PResult<bool> {
        let looked = self.lookup_tok()?;

        if self.is_proc() {
            return self.call(parent, looked);
        }
        if self.is_obj() {
            return self.send(parent, looked);
        }

        match self.ty() {
            SymType::Nary => self.nary_expr(parent),
            SymType::Binary => self.binary_expr(parent),
            SymType::Assign => self.assignment(parent),
            SymType::Unary => self.unary_expr(parent),
            SymType::Comp => self.comp_expr(parent),
            SymType::Rest => self.rest(parent),
            SymType::Keyword => match Keyword::from_i32(self.val()) {
                Keyword::Return => self.ret(parent),
                Keyword::Break => self.brk(parent, PnKind::Break),
                Keyword::BreakIf => self.brk_if(parent, PnKind::BreakIf),
                Keyword::Cont => self.brk(parent, PnKind::Cont),
                Keyword::ContIf => self.brk_if(parent, PnKind::ContIf),
                Keyword::While => self.while_loop(parent),
                Keyword::Repeat => self.repeat_loop(parent),
                Keyword::For => self.for_loop(parent),
                Keyword::If => self.if_expr(parent),
                Keyword::Cond => self.cond_expr(parent),
                Keyword::Switch => self.switch_expr(parent, PnKind::Switch),
                Keyword::SwitchTo => self.switch_to(parent),
                Keyword::Inc | Keyword::Dec => self.inc_dec(parent),
                Keyword::Define => {
                    self.define()?;
                    Ok(true)
                }
                Keyword::Enum => {
                    self.do_enum()?;
                    Ok(true)
                }
                Keyword::Class | Keyword::Instance | Keyword::Method | Keyword::Proc => {
                    // Out of synch: unwind to the top-level anchor.
                    self.sess.error("Mismatched parentheses!");
                    Err(Unwind::Sync)
                }
                _ => {
                    let t = self.text();
                    self.severe(&format!("Expected an expression here: {}", t))?;
                    Ok(true)
                }
            },
            _ => {
                let t = self.text();
                self.severe(&format!("Expected an expression here: {}", t))?;
                Ok(true)
            }
        }
    }

    // ── calls and sends ──────────────────────────────────────────────────

    /// `call ::= procedure-symbol expression*`
    fn call(&mut self, parent: &mut PNode, looked: Option<SymbolId>) -> PResult<bool> {
        let sym = looked.expect("procedure token carries its symbol");
        let kind = if self.sess.syms.get(sym).ty == SymType::Extern {
            PnKind::Extern
        } else {
            PnKind::Call
        };
        let mut pn = PNode::new(kind, self.line());
        pn.val = self.val();
        pn.sym = Some(sym);

        while self.expression(&mut pn, OPTIONAL)? {}

        parent.add(pn);
        Ok(true)
    }

    /// `send ::= (object | variable) message+`
    fn send(&mut self, parent: &mut PNode, looked: Option<SymbolId>) -> PResult<bool> {
        let line = self.line();
        let mut pn = PNode::new(PnKind::Send, line);

        let mut recv_sym = looked;
        let mut was_unknown = false;
        let obj_name;
        if self.ty() == SymType::Class && self.val() == OBJ_SUPER {
            let mut dn = PNode::new(PnKind::Super, line);
            match self.super_of_cur_obj() {
                Some((sym, num)) => {
                    dn.sym = Some(sym);
                    dn.val = num;
                }
                None => {
                    self.severe("Not in a method.")?;
                    return Ok(false);
                }
            }
            pn.add(dn);
            obj_name = "super".to_string();
        } else {
            if self.ty() == SymType::Ident && looked.is_none() {
                let name = self.text();
                recv_sym = Some(self.sess.syms.install_module(&name, SymType::Obj));
                was_unknown = true;
            }
            self.unget();
            self.expression(&mut pn, REQUIRED)?;
            obj_name = pn
                .first()
                .and_then(|c| c.sym)
                .map(|s| self.sess.syms.name(s).to_string())
                .unwrap_or_else(|| "object".to_string());
        }

        // Collect the messages to send to the object.
        let mut n_msgs = 0;
        while self.message(&mut pn, recv_sym)? {
            n_msgs += 1;
        }

        if n_msgs == 0 {
            // A bare unknown identifier is a forward reference to a
            // procedure defined later in the unit.
            if was_unknown && pn.children.len() == 1 {
                if let Some(sym) = recv_sym {
                    let s = self.sess.syms.get_mut(sym);
                    s.ty = SymType::Proc;
                    s.payload = Payload::Int(UNDEFINED);
                    let mut call = PNode::new(PnKind::Call, line);
                    call.val = UNDEFINED;
                    call.sym = Some(sym);
                    parent.add(call);
                    return Ok(true);
                }
            }
            self.error(&format!("No messages sent to {}", obj_name))?;
            return Ok(false);
        }

        parent.add(pn);
        Ok(true)
    }

    /// One `selector arg*` group of a send; groups are separated by
    /// commas.
    fn message(&mut self, pn: &mut PNode, obj: Option<SymbolId>) -> PResult<bool> {
        let old_select_var = self.selector_is_var;
        self.selector_is_var = true;

        let r = (|| -> PResult<bool> {
            let Some(msg_sel) = self.get_selector(obj)? else {
                return Ok(false);
            };

            let line = self.line();
            let mp = pn.add(PNode::new(PnKind::Msg, line));

            if self.sess.syms.get(msg_sel).ty != SymType::Select {
                // The "selector" is a variable: its value selects at run
                // time.
                self.unget();
                self.expression(mp, REQUIRED)?;
            } else {
                let mut node = PNode::new(PnKind::Select, line);
                node.val = self.sess.syms.get(msg_sel).val();
                node.sym = Some(msg_sel);
                mp.add(node);
            }
            let sel_num = self.sess.syms.get(msg_sel).val();
            let cur_receiver = self.receiver;

            let mut n_args = 0;
            while self.expression(mp, OPTIONAL)? {
                n_args += 1;
            }

            // Properties take at most one argument; more usually means a
            // missing comma.
            if n_args > 1 {
                if let Some(recv) = cur_receiver {
                    let plain_prop = self
                        .sess
                        .classes
                        .get(recv)
                        .find_selector(sel_num)
                        .map_or(false, |sn| {
                            sn.tag != SelTag::Local && sn.tag != SelTag::Method
                        });
                    if plain_prop {
                        self.error(
                            "More than one argument passed to property:  possible missing comma",
                        )?;
                    }
                }
            }

            Ok(true)
        })();

        self.selector_is_var = old_select_var;
        r
    }

    /// Message selector, auto-installed at the next free selector number
    /// when previously unknown.  Returns nothing at the end of a send.
    pub fn get_selector(&mut self, obj: Option<SymbolId>) -> PResult<Option<SymbolId>> {
        self.get_token()?;
        if self.ty() == SymType::Comma {
            self.get_token()?;
        }
        if self.ty() != SymType::Ident {
            self.unget();
            return Ok(None);
        }

        let name = self.text();
        let msg_sel = match self.sess.syms.lookup(&name) {
            Some(id) => id,
            None => self.install_new_selector(&name)?,
        };
        let sym = self.sess.syms.get(msg_sel);
        self.lex.tok.ty = sym.ty;
        self.lex.tok.val = sym.val();
        self.lex.tok.sym = Some(msg_sel);

        if self.ty() != SymType::Select && !self.is_var() {
            let t = self.text();
            self.severe(&format!("Selector required: {}", t))?;
            return Ok(None);
        }

        if self.is_var()
            && self.ty() != SymType::Prop
            && self.ty() != SymType::Select
            && self.sess.syms.selectors.get(&name).is_some()
        {
            self.error(&format!("{} is both a selector and a variable.", name))?;
            return Ok(None);
        }

        // When the receiver is statically known, the selector must belong
        // to it.
        self.receiver = None;
        if !self.is_var() {
            if let Some(oid) = obj {
                let osym_ty = self.sess.syms.get(oid).ty;
                let payload = self.sess.syms.get(oid).payload.clone();
                if matches!(osym_ty, SymType::Obj | SymType::Class) {
                    let recv = match payload {
                        Payload::Int(OBJ_SELF) => self.sess.cur_obj,
                        Payload::Int(OBJ_SUPER) => {
                            let sup = self.sess.cur_obj.and_then(|o| {
                                self.sess.classes.find(self.sess.classes.get(o).super_num)
                            });
                            if sup.is_none() {
                                self.severe("RootObj has no super.")?;
                                self.sess.cur_obj
                            } else {
                                sup
                            }
                        }
                        Payload::Object(o) => Some(o),
                        _ => None,
                    };
                    if let Some(r) = recv {
                        self.receiver = Some(r);
                        if self
                            .sess
                            .classes
                            .get(r)
                            .find_selector(self.sess.syms.get(msg_sel).val())
                            .is_none()
                        {
                            let oname = self.sess.syms.name(oid).to_string();
                            let sname = self.sess.syms.name(msg_sel).to_string();
                            self.error(&format!("Not a selector for {}: {}", oname, sname))?;
                            return Ok(None);
                        }
                    }
                }
            }
        }

        Ok(Some(msg_sel))
    }

    // ── variables ────────────────────────────────────────────────────────

    /// `variable ::= var-symbol | '[' var-symbol expression ']'`
    pub fn variable(&mut self, parent: &mut PNode) -> PResult<bool> {
        let looked = self.lookup_tok()?;
        if self.ty() == SymType::OpenBracket {
            return self.array(parent);
        }

        if !self.is_var() {
            let t = self.text();
            self.severe(&format!("Variable name expected: {}.", t))?;
            return Ok(false);
        }

        let mut pn = PNode::new(pn_kind_for(self.ty()), self.line());
        pn.val = self.val();
        pn.sym = looked.or(self.tok_sym());
        parent.add(pn);
        Ok(true)
    }

    fn array(&mut self, parent: &mut PNode) -> PResult<bool> {
        if !self.get_symbol()? {
            return Ok(false);
        }
        if !matches!(
            self.ty(),
            SymType::Global | SymType::Local | SymType::Param | SymType::Temp
        ) {
            let t = self.text();
            self.severe(&format!("Array name expected: {}.", t))?;
            return Ok(false);
        }

        let line = self.line();
        let mut pn = PNode::new(PnKind::Index, line);
        let mut node = PNode::new(pn_kind_for(self.ty()), line);
        node.val = self.val();
        node.sym = self.tok_sym();
        pn.add(node);

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }

        self.get_token()?;
        if self.ty() != SymType::CloseBracket {
            let t = self.text();
            self.error(&format!("Expected closing ']': {}.", t))?;
            return Ok(false);
        }

        parent.add(pn);
        Ok(true)
    }

    /// `&rest parameter-name`
    fn rest(&mut self, parent: &mut PNode) -> PResult<bool> {
        self.lookup_tok()?;
        if !self.is_var() || self.ty() != SymType::Param {
            let t = self.text();
            self.severe(&format!("Variable name expected: {}.", t))?;
            return Ok(false);
        }
        let mut pn = PNode::new(PnKind::Rest, self.line());
        pn.val = self.val();
        parent.add(pn);
        Ok(true)
    }

    // ── operators with constant folding ──────────────────────────────────

    /// `nary-expr ::= nary-op expression expression+`
    fn nary_expr(&mut self, parent: &mut PNode) -> PResult<bool> {
        let op = self.val();
        let logic = op == N_AND || op == N_OR;
        let mut pn = PNode::new(
            if logic { PnKind::Comp } else { PnKind::Nary },
            self.line(),
        );
        pn.val = op;

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }
        if !logic && !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }
        while self.expression(&mut pn, OPTIONAL)? {}

        // Collect every constant operand into the first constant node.
        if let Some(first) = pn.children.iter().position(|c| c.kind == PnKind::Num) {
            let mut acc = pn.children[first].val;
            let mut i = first + 1;
            while i < pn.children.len() {
                if pn.children[i].kind == PnKind::Num {
                    let v = pn.children[i].val;
                    acc = match op {
                        N_PLUS => acc.wrapping_add(v),
                        N_MUL => acc.wrapping_mul(v),
                        N_BITXOR => acc ^ v,
                        N_BITAND => acc & v,
                        N_BITOR => acc | v,
                        N_AND => (acc != 0 && v != 0) as i32,
                        N_OR => (acc != 0 || v != 0) as i32,
                        _ => acc,
                    };
                    pn.children.remove(i);
                } else {
                    i += 1;
                }
            }
            pn.children[first].val = acc;
        }

        // A single remaining constant collapses the whole expression.
        if pn.children.len() == 1 && pn.children[0].kind == PnKind::Num {
            pn.kind = PnKind::Num;
            pn.val = pn.children[0].val;
            pn.children.clear();
        }

        parent.add(pn);
        Ok(true)
    }

    /// `binary-expr ::= binary-op expression expression`
    fn binary_expr(&mut self, parent: &mut PNode) -> PResult<bool> {
        let op = self.val();
        let mut pn = PNode::new(PnKind::Binary, self.line());
        pn.val = op;

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }

        // `-` with a single operand is a negation.
        if op != B_MINUS {
            if !self.expression(&mut pn, REQUIRED)? {
                return Ok(false);
            }
        } else if !self.expression(&mut pn, OPTIONAL)? {
            pn.kind = PnKind::Unary;
            pn.val = U_NEG;
            if pn.children[0].kind == PnKind::Num {
                pn.kind = PnKind::Num;
                pn.val = pn.children[0].val.wrapping_neg();
                pn.children.clear();
            }
            parent.add(pn);
            return Ok(true);
        }

        if pn.children[0].kind == PnKind::Num && pn.children[1].kind == PnKind::Num {
            let v1 = pn.children[0].val;
            let v2 = pn.children[1].val;
            pn.kind = PnKind::Num;
            pn.val = match op {
                B_MINUS => v1.wrapping_sub(v2),
                B_DIV => {
                    if v2 == 0 {
                        self.severe("division by zero.")?;
                        return Ok(false);
                    }
                    v1.wrapping_div(v2)
                }
                B_MOD => {
                    if v2 == 0 {
                        self.severe("division by zero.")?;
                        return Ok(false);
                    }
                    v1.wrapping_rem(v2)
                }
                B_SLEFT => v1.wrapping_shl(v2 as u32),
                _ => v1.wrapping_shr(v2 as u32),
            };
            pn.children.clear();
        }

        parent.add(pn);
        Ok(true)
    }

    /// `unary-expr ::= unary-op expression`
    fn unary_expr(&mut self, parent: &mut PNode) -> PResult<bool> {
        let op = self.val();
        let mut pn = PNode::new(PnKind::Unary, self.line());
        pn.val = op;

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }

        if pn.children[0].kind == PnKind::Num {
            let v = pn.children[0].val;
            pn.kind = PnKind::Num;
            pn.val = match op {
                U_NOT => (v == 0) as i32,
                U_BNOT => v ^ -1,
                _ => v.wrapping_neg(),
            };
            pn.children.clear();
        }

        parent.add(pn);
        Ok(true)
    }

    /// `comp-expr ::= comp-op expression expression+` — chained
    /// comparisons with early-out.
    fn comp_expr(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::Comp, self.line());
        pn.val = self.val();

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }
        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }
        while self.expression(&mut pn, OPTIONAL)? {}

        parent.add(pn);
        Ok(true)
    }

    /// `assignment ::= assign-op variable expression`
    fn assignment(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::Assign, self.line());
        pn.val = self.val();

        let ok = self.variable(&mut pn)? && self.expression(&mut pn, REQUIRED)?;
        if ok {
            parent.add(pn);
        }
        Ok(ok)
    }

    /// `('++' | '--') variable`
    fn inc_dec(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::IncDec, self.line());
        pn.val = self.val();

        if self.variable(&mut pn)? {
            parent.add(pn);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ── statements ───────────────────────────────────────────────────────

    fn ret(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::Return, self.line());
        self.expression(&mut pn, OPTIONAL)?;
        parent.add(pn);
        Ok(true)
    }

    /// `break`/`continue` with an optional loop level.
    fn brk(&mut self, parent: &mut PNode, kind: PnKind) -> PResult<bool> {
        let mut pn = PNode::new(kind, self.line());
        self.get_token()?;
        if self.ty() == SymType::Num {
            pn.val = self.val();
        } else {
            self.unget();
            pn.val = 1;
        }
        if pn.val > self.loop_nest {
            self.warning(if kind == PnKind::Break {
                "Break level greater than loop nesting count."
            } else {
                "Continue level greater than loop nesting count."
            });
        }
        parent.add(pn);
        Ok(true)
    }

    /// `breakif`/`contif`: conditional expression, then optional level.
    fn brk_if(&mut self, parent: &mut PNode, kind: PnKind) -> PResult<bool> {
        let mut pn = PNode::new(kind, self.line());

        if !self.expression(&mut pn, REQUIRED)? {
            self.severe("Conditional required in 'breakif'.")?;
            return Ok(false);
        }

        self.get_token()?;
        if self.ty() == SymType::Num {
            pn.val = self.val();
        } else {
            self.unget();
            pn.val = 1;
        }
        if pn.val > self.loop_nest {
            self.warning(if kind == PnKind::BreakIf {
                "Break level greater than loop nesting count."
            } else {
                "Continue level greater than loop nesting count."
            });
        }
        parent.add(pn);
        Ok(true)
    }

    /// `while ::= 'while' expression expression*`
    fn while_loop(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::While, self.line());

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }

        self.loop_nest += 1;
        let r = self.expr_list_into(&mut pn, OPTIONAL);
        self.loop_nest -= 1;
        r?;

        parent.add(pn);
        Ok(true)
    }

    /// `repeat ::= 'repeat' expression+`
    fn repeat_loop(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::Repeat, self.line());

        self.loop_nest += 1;
        let r = self.expr_list_into(&mut pn, OPTIONAL);
        self.loop_nest -= 1;
        r?;

        parent.add(pn);
        Ok(true)
    }

    /// `for ::= 'for' (init) condition (step) body*`
    fn for_loop(&mut self, parent: &mut PNode) -> PResult<bool> {
        let line = self.line();
        let mut pn = PNode::new(PnKind::For, line);

        // Initialization.
        if !self.open_block()? {
            self.severe("Need loop initialization.")?;
            return Ok(false);
        }
        let mut init = PNode::new(PnKind::Elist, line);
        let mut req = OPTIONAL;
        while self.expression(&mut init, req)? {
            req = false;
        }
        pn.add(init);
        self.close_block()?;

        // Termination condition.
        if !self.expression(&mut pn, OPTIONAL)? {
            self.severe("Need loop termination.")?;
            return Ok(false);
        }

        // Re-initialization.
        if !self.open_block()? {
            self.severe("Need loop re-initialization.")?;
            return Ok(false);
        }
        let mut step = PNode::new(PnKind::Elist, line);
        while self.expression(&mut step, OPTIONAL)? {}
        pn.add(step);
        self.close_block()?;

        // Body.
        self.loop_nest += 1;
        let mut body = PNode::new(PnKind::Elist, line);
        let r = (|| -> PResult<()> {
            while self.expression(&mut body, OPTIONAL)? {}
            Ok(())
        })();
        self.loop_nest -= 1;
        r?;
        pn.add(body);

        parent.add(pn);
        Ok(true)
    }

    /// `if ::= 'if' expression expression+ ['else' expression+]`
    fn if_expr(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::If, self.line());

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }
        if !self.expr_list_into(&mut pn, OPTIONAL)? {
            return Ok(false);
        }

        self.get_token()?;
        if self.keyword() == Keyword::Else {
            if !self.expr_list_into(&mut pn, OPTIONAL)? {
                return Ok(false);
            }
        } else {
            self.unget();
        }

        parent.add(pn);
        Ok(true)
    }

    /// `cond ::= 'cond' (open expression expression* close)+
    ///           [open 'else' expression+ close]`
    fn cond_expr(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::Cond, self.line());

        self.get_token()?;
        while self.ty().is_open() {
            self.get_token()?;
            if self.keyword() == Keyword::Else {
                pn.add(PNode::new(PnKind::Else, self.line()));
            } else {
                self.unget();
                if !self.expression(&mut pn, REQUIRED)? {
                    return Ok(false);
                }
            }

            self.expr_list_into(&mut pn, OPTIONAL)?;
            self.close_block()?;
            self.get_token()?;
        }
        self.unget();

        parent.add(pn);
        Ok(true)
    }

    /// `switch ::= 'switch' expression (open value expression* close)+
    ///             [open 'else' expression+ close]`
    fn switch_expr(&mut self, parent: &mut PNode, kind: PnKind) -> PResult<bool> {
        let mut pn = PNode::new(kind, self.line());

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }

        self.get_token()?;
        while self.ty().is_open() {
            self.get_token()?;
            if self.keyword() == Keyword::Else {
                pn.add(PNode::new(PnKind::Else, self.line()));
            } else {
                self.unget();
                if !self.expression(&mut pn, REQUIRED)? {
                    return Ok(false);
                }
            }

            self.expr_list_into(&mut pn, OPTIONAL)?;
            self.close_block()?;
            self.get_token()?;
        }
        self.unget();

        parent.add(pn);
        Ok(true)
    }

    /// `switchto ::= 'switchto' expression (open expression* close)+` —
    /// cases are numbered implicitly from zero.
    fn switch_to(&mut self, parent: &mut PNode) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::SwitchTo, self.line());
        let mut case_val = 0;

        if !self.expression(&mut pn, REQUIRED)? {
            return Ok(false);
        }

        while self.open_block()? {
            let mut case = PNode::new(PnKind::Num, self.line());
            case.val = case_val;
            case_val += 1;
            pn.add(case);
            self.expr_list_into(&mut pn, OPTIONAL)?;
            self.close_block()?;
        }
        self.unget();

        parent.add(pn);
        Ok(true)
    }
}

/// Parse-node kind for a variable-like symbol type.
fn pn_kind_for(ty: SymType) -> PnKind {
    match ty {
        SymType::Class => PnKind::Class,
        SymType::Obj => PnKind::Obj,
        SymType::Select | SymType::Local => PnKind::Local,
        SymType::Global => PnKind::Global,
        SymType::Temp => PnKind::Tmp,
        SymType::Param => PnKind::Parm,
        SymType::Prop => PnKind::Prop,
        _ => panic!("bad symbol type for a variable reference"),
    }
}

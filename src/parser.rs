/// Recursive-descent parser for top-level forms.
///
/// Each top-level form is parsed and lowered before the next is read.  A
/// recovery anchor wraps every form: losing synchronization (mismatched
/// parentheses) unwinds to the anchor and compilation resumes with the
/// next form.  Ordinary errors skip to the next closing parenthesis and
/// keep going.

use crate::anode::VarInit;
use crate::ast::{PNode, PnKind};
use crate::errors::{FatalError, PResult, Unwind};
use crate::lexer::Lexer;
use crate::object::{ObjKind, Object, ObjectId, SelTag, OBJECTNUM};
use crate::session::{Public, Session, VarKind};
use crate::symbol::{Keyword, Payload, SymType, SymbolId, DEFINED, UNDEFINED};

pub const REQUIRED: bool = true;
pub const OPTIONAL: bool = false;

pub struct Parser<'s> {
    pub lex: Lexer,
    pub sess: &'s mut Session,
    /// Loop nesting depth, for validating `break n` / `continue n`.
    pub loop_nest: i32,
    /// Inside a parameter list, unknown selectors are fair parameter names.
    pub in_parm_list: bool,
    /// A selector may resolve as a property variable in this context.
    pub selector_is_var: bool,
    /// Receiver of the message currently being parsed.
    pub receiver: Option<ObjectId>,
}

impl<'s> Parser<'s> {
    pub fn new(sess: &'s mut Session) -> Self {
        let mut lex = Lexer::new();
        lex.input.include_path = sess.config.include_path.clone();
        Parser {
            lex,
            sess,
            loop_nest: 0,
            in_parm_list: false,
            selector_is_var: false,
            receiver: None,
        }
    }

    // ── token plumbing ───────────────────────────────────────────────────

    pub fn ty(&self) -> SymType {
        self.lex.tok.ty
    }

    pub fn val(&self) -> i32 {
        self.lex.tok.val
    }

    pub fn text(&self) -> String {
        self.lex.tok.text.clone()
    }

    pub fn tok_sym(&self) -> Option<SymbolId> {
        self.lex.tok.sym
    }

    pub fn line(&self) -> u32 {
        self.lex.cur_line()
    }

    fn sync_pos(&mut self) {
        self.sess.cur_file = self.lex.cur_file();
        self.sess.cur_line = self.lex.cur_line();
    }

    pub fn next_token(&mut self) -> PResult<bool> {
        let r = self.lex.next_token(&self.sess.syms, &mut self.sess.diags)?;
        self.sync_pos();
        Ok(r)
    }

    pub fn new_token(&mut self) -> PResult<bool> {
        let r = self.lex.new_token(&self.sess.syms, &mut self.sess.diags)?;
        self.sync_pos();
        Ok(r)
    }

    pub fn get_token(&mut self) -> PResult<()> {
        self.lex.get_token(&self.sess.syms, &mut self.sess.diags)?;
        self.sync_pos();
        Ok(())
    }

    pub fn unget(&mut self) {
        self.lex.unget();
    }

    /// Report an error, then skip to the next closing parenthesis.
    pub fn error(&mut self, msg: &str) -> PResult<()> {
        self.sess.error(msg);
        if !self.ty().is_close() {
            self.lex.get_rest(true, &self.sess.syms, &mut self.sess.diags)?;
        } else {
            self.unget();
        }
        Ok(())
    }

    /// An expectation failure while parsing; same policy as `error`.
    pub fn severe(&mut self, msg: &str) -> PResult<()> {
        self.error(msg)
    }

    pub fn warning(&mut self, msg: &str) {
        self.sess.warning(msg);
    }

    // ── token classification (after lookup) ──────────────────────────────

    /// Fetch a token and resolve identifiers against the symbol
    /// environment.  Inside a method, a selector naming a property of the
    /// current object demotes to a property-variable access.
    pub fn lookup_tok(&mut self) -> PResult<Option<SymbolId>> {
        self.get_token()?;

        if self.ty() == SymType::Hash {
            return self.immediate();
        }

        let mut found = None;
        if self.ty() == SymType::Ident {
            if let Some(id) = self.sess.syms.lookup(&self.lex.tok.text) {
                let sym = self.sess.syms.get(id);
                self.lex.tok.ty = sym.ty;
                self.lex.tok.val = sym.val();
                self.lex.tok.sym = Some(id);
                found = Some(id);
            }
        } else {
            found = self.lex.tok.sym;
        }

        if self.ty() == SymType::Select {
            if let Some(oid) = self.sess.cur_obj {
                if !self.sess.classes.get(oid).selectors.is_empty() {
                    let entry = self
                        .sess
                        .classes
                        .get(oid)
                        .find_selector(self.val())
                        .map(|sn| (sn.tag, sn.ofs));
                    match entry {
                        None => {
                            if !self.in_parm_list {
                                let name = self.text();
                                self.error(&format!(
                                    "Not a selector for current class/object: {}",
                                    name
                                ))?;
                                found = None;
                            }
                        }
                        Some((tag, ofs)) => {
                            if tag != SelTag::Local && tag != SelTag::Method {
                                self.lex.tok.ty = SymType::Prop;
                                self.lex.tok.val = ofs;
                            }
                        }
                    }
                }
            }
        }

        Ok(found)
    }

    /// `#selector` — the selector's number as an immediate value.
    fn immediate(&mut self) -> PResult<Option<SymbolId>> {
        self.get_token()?;
        if self.ty() == SymType::Ident {
            let found = self.sess.syms.lookup(&self.lex.tok.text);
            match found {
                Some(id) if self.sess.syms.get(id).ty == SymType::Select => {
                    self.lex.tok.val = self.sess.syms.get(id).val();
                    self.lex.tok.ty = SymType::Num;
                    self.lex.tok.sym = Some(id);
                    return Ok(Some(id));
                }
                _ => {
                    let name = self.text();
                    self.error(&format!("Selector required: {}", name))?;
                }
            }
        }
        Ok(None)
    }

    pub fn is_var(&self) -> bool {
        match self.ty() {
            SymType::Global
            | SymType::Local
            | SymType::Temp
            | SymType::Param
            | SymType::Prop
            | SymType::OpenBracket => true,
            SymType::Select => {
                self.selector_is_var
                    && self
                        .sess
                        .cur_obj
                        .and_then(|o| self.sess.classes.get(o).find_selector(self.val()))
                        .map_or(false, |sn| sn.tag == SelTag::Prop)
            }
            _ => false,
        }
    }

    pub fn is_proc(&self) -> bool {
        matches!(self.ty(), SymType::Proc | SymType::Extern)
    }

    pub fn is_obj(&self) -> bool {
        matches!(
            self.ty(),
            SymType::Obj | SymType::Class | SymType::Ident | SymType::OpenP
        ) || self.is_var()
    }

    pub fn is_number(&self) -> bool {
        matches!(self.ty(), SymType::Num | SymType::Str)
    }

    /// Keyword denoted by the current token, if any.
    pub fn keyword(&mut self) -> Keyword {
        match self.sess.syms.lookup(&self.lex.tok.text) {
            Some(id) if self.sess.syms.get(id).ty == SymType::Keyword => {
                let val = self.sess.syms.get(id).val();
                self.lex.tok.ty = SymType::Keyword;
                self.lex.tok.val = val;
                Keyword::from_i32(val)
            }
            _ => Keyword::Undefined,
        }
    }

    pub fn get_keyword(&mut self, which: Keyword) -> PResult<()> {
        self.get_token()?;
        if self.keyword() != which {
            let str = match which {
                Keyword::Of => "of",
                Keyword::ScriptNum => "script#",
                Keyword::ClassNum => "class#",
                Keyword::Super => "super#",
                Keyword::File => "file#",
                _ => "keyword",
            };
            self.sess.error(&format!("{} keyword missing.", str));
            self.unget();
        }
        Ok(())
    }

    /// Parse a constant expression and leave its value in the token slot.
    pub fn get_number(&mut self, what: &str) -> PResult<bool> {
        self.get_number_or_string_tok(what, false)
    }

    pub fn get_number_or_string(&mut self, what: &str) -> PResult<bool> {
        self.get_number_or_string_tok(what, true)
    }

    fn get_number_or_string_tok(&mut self, what: &str, string_ok: bool) -> PResult<bool> {
        let mut pn = PNode::new(PnKind::Expr, self.line());
        self.expression(&mut pn, REQUIRED)?;

        let ok = match pn.first() {
            Some(c) if c.kind == PnKind::Num => {
                self.lex.tok.ty = SymType::Num;
                self.lex.tok.val = c.val;
                true
            }
            Some(c) if c.kind == PnKind::String && string_ok => {
                self.lex.tok.ty = SymType::Str;
                self.lex.tok.val = c.val;
                true
            }
            _ => false,
        };
        if !ok {
            self.error(&format!("{} required.", what))?;
        }
        Ok(ok)
    }

    pub fn get_string(&mut self, what: &str) -> PResult<bool> {
        self.get_token()?;
        if self.ty() != SymType::Str {
            let t = self.text();
            self.severe(&format!("{} required: {}", what, t))?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Fetch a token that must already be in the symbol table; its values
    /// are loaded into the token slot.
    pub fn get_symbol(&mut self) -> PResult<bool> {
        self.get_token()?;
        match self.sess.syms.lookup(&self.lex.tok.text) {
            None => {
                let t = self.text();
                self.severe(&format!("{} not defined.", t))?;
                Ok(false)
            }
            Some(id) => {
                let sym = self.sess.syms.get(id);
                self.lex.tok.ty = sym.ty;
                self.lex.tok.val = sym.val();
                self.lex.tok.sym = Some(id);
                Ok(true)
            }
        }
    }

    pub fn is_ident(&mut self) -> PResult<bool> {
        if self.ty() != SymType::Ident {
            let t = self.text();
            self.severe(&format!("Identifier required: {}", t))?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn is_undefined_ident(&mut self) -> PResult<bool> {
        if !self.is_ident()? {
            return Ok(false);
        }
        if self.sess.syms.lookup(&self.lex.tok.text).is_some() {
            let t = self.text();
            self.warning(&format!("Redefinition of {}.", t));
        }
        Ok(true)
    }

    pub fn get_ident(&mut self) -> PResult<bool> {
        self.get_token()?;
        self.is_undefined_ident()
    }

    pub fn open_block(&mut self) -> PResult<bool> {
        self.get_token()?;
        Ok(self.ty().is_open())
    }

    pub fn close_block(&mut self) -> PResult<bool> {
        self.get_token()?;
        if self.ty() == SymType::CloseP {
            Ok(true)
        } else {
            let t = self.text();
            self.severe(&format!("Expected closing parenthesis: {}", t))?;
            Ok(false)
        }
    }

    // ── top level ────────────────────────────────────────────────────────

    /// Parse one translation unit from the already-pushed input source.
    pub fn parse(&mut self) -> PResult<bool> {
        self.sess.init_asm();
        self.sess.syms.clear_asm_refs();

        while self.new_token()? {
            // A top-level form must start with an opening parenthesis.
            if !self.ty().is_open() {
                let t = self.text();
                self.error(&format!("Opening parenthesis expected: {}", t))?;
                loop {
                    if !self.new_token()? {
                        return self.finish_parse();
                    }
                    if self.ty().is_open() {
                        break;
                    }
                }
            }

            // Recovery anchor: a lost-synchronization unwind abandons the
            // current form and continues with the next one.
            match self.top_form() {
                Ok(()) | Err(Unwind::Sync) => {}
                Err(fatal) => return Err(fatal),
            }
        }

        self.finish_parse()
    }

    fn finish_parse(&mut self) -> PResult<bool> {
        if self.lex.nested_cond > 0 {
            self.sess.error("#if without #endif");
            self.lex.nested_cond = 0;
        }
        Ok(self.sess.diags.errors == 0)
    }

    fn top_form(&mut self) -> PResult<()> {
        if !self.new_token()? {
            self.severe("Keyword required.")?;
            return Ok(());
        }

        match self.keyword() {
            Keyword::ScriptNum => {
                if self.get_number("Script #")? {
                    if self.sess.script != -1 {
                        let n = self.sess.script;
                        self.severe(&format!("Script # already defined to be {}.", n))?;
                    } else {
                        self.sess.script = self.val();
                    }
                }
            }
            Keyword::Include => {
                self.include()?;
                // The rest of the include line is dropped when the file
                // pops, so there is no closing parenthesis to consume.
                return Ok(());
            }
            Keyword::Public => self.do_public()?,
            Keyword::Extern => self.do_extern()?,
            Keyword::GlobalDecl => self.global_decl()?,
            Keyword::Global => self.global()?,
            Keyword::Local => self.local()?,
            Keyword::Define => self.define()?,
            Keyword::Enum => self.do_enum()?,
            Keyword::Proc => self.procedure()?,
            Keyword::Class => self.do_class()?,
            Keyword::Instance => self.instance()?,
            Keyword::ClassDef => self.define_class()?,
            Keyword::Selectors => self.init_selectors()?,
            Keyword::Undefined => {
                let t = self.text();
                self.severe(&format!("Keyword required: {}", t))?;
            }
            _ => {
                let t = self.text();
                self.severe(&format!("Not a top-level keyword: {}.", t))?;
            }
        }

        self.close_block()?;
        Ok(())
    }

    fn include(&mut self) -> PResult<()> {
        self.get_token()?;
        if self.ty() != SymType::Ident && self.ty() != SymType::Str {
            let t = self.text();
            self.severe(&format!("Need a filename: {}", t))?;
        } else {
            let name = self.text();
            if !self.lex.input.push_file(&name, false)? {
                return Err(FatalError::OpenFailed {
                    path: name,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }
                .into());
            }
        }
        Ok(())
    }

    // ── defines and enums ────────────────────────────────────────────────

    /// `define ::= 'define' symbol rest-of-expression`
    pub fn define(&mut self) -> PResult<()> {
        // The name is read raw: an existing define must not expand here.
        if !self.next_token()? {
            return Ok(());
        }
        if self.ty() != SymType::Ident {
            let t = self.text();
            self.severe(&format!("Identifier required: {}", t))?;
            return Ok(());
        }

        let name = self.text();
        let existing = self.sess.syms.lookup(&name);
        let sym = match existing {
            None => self.sess.syms.install_local(&name, SymType::Define),
            Some(id) => {
                if self.sess.syms.get(id).ty != SymType::Define {
                    // A change in symbol kind, not just a re-define.
                    self.error(&format!("Redefinition of {}", name))?;
                    return Ok(());
                }
                id
            }
        };

        self.lex
            .get_rest(false, &self.sess.syms, &mut self.sess.diags)?;
        let body = self.text();

        if existing.is_some() {
            let old = match &self.sess.syms.get(sym).payload {
                Payload::Text(t) => t.trim().to_string(),
                _ => String::new(),
            };
            if old != body.trim() {
                self.warning(&format!(
                    "Redefinition of {} from {} to {}",
                    name,
                    old,
                    body.trim()
                ));
                self.sess.syms.get_mut(sym).payload = Payload::Text(body);
            }
        } else {
            self.sess.syms.get_mut(sym).payload = Payload::Text(body);
        }
        Ok(())
    }

    /// `enum ::= 'enum' [number] (symbol | (= symbol expr))+`
    pub fn do_enum(&mut self) -> PResult<()> {
        let mut val = 0i32;
        loop {
            // Member names are read raw so earlier defines don't expand.
            if !self.next_token()? {
                return Err(FatalError::EarlyEnd.into());
            }
            if self.ty().is_close() {
                break;
            }

            if self.ty() == SymType::Num {
                val = self.val();
            } else if self.is_undefined_ident()? {
                let name = self.text();
                let sym = self.sess.syms.install_local(&name, SymType::Define);

                // Optional initializer expression.
                self.lookup_tok()?;
                if self.ty() != SymType::Assign {
                    self.unget();
                } else if self.get_number("Constant expression required")? {
                    val = self.val();
                }
                self.sess.syms.get_mut(sym).payload = Payload::Text(val.to_string());
                val += 1;
            }
        }
        self.unget();
        Ok(())
    }

    fn definition(&mut self) -> PResult<()> {
        self.get_token()?;
        match self.keyword() {
            Keyword::Define => self.define()?,
            Keyword::Enum => self.do_enum()?,
            _ => {
                let t = self.text();
                self.severe(&format!("define or enum expected: {}", t))?;
            }
        }
        self.close_block()?;
        Ok(())
    }

    // ── variables ────────────────────────────────────────────────────────

    fn var_values(&mut self, kind: VarKind) -> &mut Vec<VarInit> {
        match kind {
            VarKind::Local => &mut self.sess.local_vars.values,
            _ => &mut self.sess.global_vars.values,
        }
    }

    /// Initial value(s) for a variable: `= num` or `= [num ...]`.
    /// Returns the number of values consumed (1 if none given), or -1 on
    /// overflow.
    fn initial_value(&mut self, kind: VarKind, offset: usize, array_size: usize) -> PResult<i32> {
        self.lookup_tok()?;
        if self.ty() != SymType::Assign {
            self.unget();
            return Ok(1);
        }

        if offset + array_size > self.sess.config.max_vars {
            return Ok(-1);
        }
        if self.var_values(kind).len() < offset + array_size {
            self.var_values(kind).resize(offset + array_size, VarInit::None);
        }

        self.get_token()?;
        if self.ty() != SymType::OpenBracket {
            self.unget();
            if !self.get_number_or_string("Initial value")? {
                return Ok(array_size as i32);
            }
            let init = self.tok_var_init();
            for i in 0..array_size {
                let redefined = self.var_values(kind)[offset + i] != VarInit::None;
                if redefined {
                    self.error(&format!("Redefinition of index {}", offset + i))?;
                }
                self.var_values(kind)[offset + i] = init;
            }
            return Ok(array_size as i32);
        }

        // Bracketed list of initial values.
        let mut n = 0usize;
        loop {
            self.get_token()?;
            if self.ty() == SymType::CloseBracket {
                break;
            }
            self.unget();
            if !self.get_number_or_string("Initial value")? {
                break;
            }
            let init = self.tok_var_init();
            if self.var_values(kind).len() <= offset + n {
                self.var_values(kind).resize(offset + n + 1, VarInit::None);
            }
            self.var_values(kind)[offset + n] = init;
            n += 1;
        }
        Ok(n as i32)
    }

    fn tok_var_init(&self) -> VarInit {
        if self.ty() == SymType::Str {
            VarInit::Text(self.val())
        } else {
            VarInit::Num(self.val())
        }
    }

    /// Forward declaration of global variables (in scripts other than 0).
    fn global_decl(&mut self) -> PResult<()> {
        loop {
            self.get_token()?;
            if self.ty().is_close() {
                break;
            }
            if !self.is_ident()? {
                break;
            }
            let name = self.text();
            if !self.get_number("Variable #")? {
                break;
            }
            let num = self.val();

            match self.sess.syms.lookup(&name) {
                Some(id) => {
                    let sym = self.sess.syms.get(id);
                    if sym.ty != SymType::Global {
                        self.error(&format!("Redefinition of {} as a global.", name))?;
                        break;
                    }
                    if sym.val() != num {
                        let old = sym.val();
                        self.error(&format!(
                            "Redefinition of {} with different global index ({} expected, {} found).",
                            name, old, num
                        ))?;
                        break;
                    }
                }
                None => {
                    let id = self.sess.syms.install_local(&name, SymType::Global);
                    self.sess.syms.get_mut(id).payload = Payload::Int(num);
                }
            }
        }
        self.unget();
        Ok(())
    }

    fn global(&mut self) -> PResult<()> {
        if self.sess.script != 0 {
            self.sess.error("Globals only allowed in script 0.");
        }

        loop {
            self.get_token()?;
            if self.ty().is_close() {
                break;
            }
            if self.ty().is_open() {
                self.definition()?;
                continue;
            }
            if !self.is_ident()? {
                break;
            }
            let name = self.text();
            if !self.get_number("Variable #")? {
                break;
            }
            let num = self.val();

            let offset = match self.sess.syms.lookup(&name) {
                Some(id) => {
                    let sym = self.sess.syms.get(id);
                    if sym.ty != SymType::Global {
                        self.error(&format!("Redefinition of {} as a global.", name))?;
                        break;
                    }
                    if sym.val() != num {
                        let old = sym.val();
                        self.error(&format!(
                            "Redefinition of {} with different global index ({} expected, {} found).",
                            name, old, num
                        ))?;
                        break;
                    }
                    sym.val()
                }
                None => {
                    let id = self.sess.syms.install_local(&name, SymType::Global);
                    self.sess.syms.get_mut(id).payload = Payload::Int(num);
                    num
                }
            };

            let n = self.initial_value(VarKind::Global, offset.max(0) as usize, 1)?;
            if n == -1 || self.sess.global_vars.values.len() > self.sess.config.max_vars {
                let max = self.sess.config.max_vars;
                self.error(&format!("Too many variables. Max is {}.", max))?;
                break;
            }
        }

        self.sess.global_vars.kind = VarKind::Global;
        self.unget();
        Ok(())
    }

    fn local(&mut self) -> PResult<()> {
        if self.sess.script == 0 {
            self.sess.error("Only globals allowed in script 0.");
        }
        if !self.sess.local_vars.values.is_empty() {
            self.sess.error("Only one local statement allowed");
        }

        let mut size = 0usize;
        loop {
            self.get_token()?;
            if self.ty().is_close() {
                break;
            }
            if self.ty() == SymType::OpenBracket {
                // `[name count]` declares an array.
                if !self.get_ident()? {
                    break;
                }
                let name = self.text();
                let id = self.sess.syms.install_local(&name, SymType::Local);
                self.sess.syms.get_mut(id).payload = Payload::Int(size as i32);
                if !self.get_number("Array size")? {
                    break;
                }
                let array_size = self.val().max(0) as usize;
                self.get_token()?;
                if self.ty() != SymType::CloseBracket {
                    self.severe("no closing ']' in array declaration")?;
                    break;
                }
                let n = self.initial_value(VarKind::Local, size, array_size)?;
                if n == -1 {
                    let max = self.sess.config.max_vars;
                    self.error(&format!("Too many variables. Max is {}.", max))?;
                    break;
                }
                size += (n.max(0) as usize).max(array_size);
            } else if self.ty().is_open() {
                self.definition()?;
                continue;
            } else if self.is_undefined_ident()? {
                let name = self.text();
                let id = self.sess.syms.install_local(&name, SymType::Local);
                self.sess.syms.get_mut(id).payload = Payload::Int(size as i32);
                let n = self.initial_value(VarKind::Local, size, 1)?;
                if n == -1 {
                    let max = self.sess.config.max_vars;
                    self.error(&format!("Too many variables. Max is {}.", max))?;
                    break;
                }
                size += n.max(0) as usize;
            }
            if size > self.sess.config.max_vars {
                let max = self.sess.config.max_vars;
                self.error(&format!("Too many variables. Max is {}.", max))?;
                break;
            }
        }

        // Pad the value list out to the declared size.
        if self.sess.local_vars.values.len() < size {
            self.sess.local_vars.values.resize(size, VarInit::None);
        }
        self.sess.local_vars.kind = VarKind::Local;
        self.unget();
        Ok(())
    }

    // ── externals and publics ────────────────────────────────────────────

    /// `extern ::= 'extern' (symbol script# entry#)+`
    fn do_extern(&mut self) -> PResult<()> {
        loop {
            self.get_token()?;
            if self.ty().is_close() {
                break;
            }
            if self.ty().is_open() {
                self.definition()?;
                continue;
            }

            let name = self.text();
            let sym = self
                .sess
                .syms
                .lookup(&name)
                .unwrap_or_else(|| self.sess.syms.install_local(&name, SymType::Extern));

            if !self.get_number("Script #")? {
                break;
            }
            let script = self.val();
            if !self.get_number("Entry #")? {
                break;
            }
            let entry = self.val().max(0) as u32;
            self.sess.syms.get_mut(sym).payload = Payload::Extern { script, entry };
        }
        self.unget();
        Ok(())
    }

    /// `public ::= 'public' (symbol number)+`
    fn do_public(&mut self) -> PResult<()> {
        loop {
            self.get_token()?;
            if self.ty().is_close() {
                break;
            }

            let name = self.text();
            let sym = match self.sess.syms.lookup(&name) {
                None => self.sess.syms.install_module(&name, SymType::Obj),
                Some(id) if self.sess.syms.get(id).ty == SymType::Extern => {
                    self.sess.syms.install_module(&name, SymType::Ident)
                }
                Some(id) => id,
            };

            if !self.get_number("Entry #")? {
                break;
            }
            let entry = self.val().max(0) as u32;
            self.sess.publics.push(Public { sym, entry });
            if entry as i32 > self.sess.public_max {
                self.sess.public_max = entry as i32;
            }
        }
        self.unget();

        let max = self.sess.public_max;
        self.sess.make_dispatch(max);
        Ok(())
    }

    // ── procedures ───────────────────────────────────────────────────────

    /// `procedure ::= 'procedure' call-def expression*` — or a forward
    /// declaration: `procedure ::= 'procedure' procedure-name+`.
    pub fn procedure(&mut self) -> PResult<()> {
        self.get_token()?;
        self.unget();

        if self.ty().is_open() {
            self.sess.syms.push_scope();
            let r = (|| -> PResult<()> {
                if let Some(mut node) = self.call_def(SymType::Proc)? {
                    self.expr_list_into(&mut node, OPTIONAL)?;
                    self.sess.compile(&node);
                }
                Ok(())
            })();
            self.sess.syms.pop_scope();
            r
        } else {
            loop {
                self.get_token()?;
                if self.ty().is_close() {
                    break;
                }
                if self.ty() == SymType::Ident {
                    let name = self.text();
                    let id = self.sess.syms.install_local(&name, SymType::Proc);
                    self.sess.syms.get_mut(id).payload = Payload::Int(UNDEFINED);
                }
            }
            self.unget();
            Ok(())
        }
    }

    /// `call-def ::= open symbol [variable+] [&tmp variable+] close`
    pub fn call_def(&mut self, what: SymType) -> PResult<Option<PNode>> {
        if !self.open_block()? {
            self.unget();
            self.error("expected opening parenthesis or brace.")?;
            return Ok(None);
        }
        let node = self.call_def_inner(what)?;
        self.close_block()?;
        Ok(node)
    }

    fn call_def_inner(&mut self, what: SymType) -> PResult<Option<PNode>> {
        self.get_token()?;
        let name = self.text();
        let line = self.line();
        let existing = self.sess.syms.lookup(&name);

        let sym = match what {
            SymType::Proc => match existing {
                None => {
                    let id = self.sess.syms.install_module(&name, SymType::Proc);
                    self.sess.syms.get_mut(id).payload = Payload::Int(DEFINED);
                    id
                }
                Some(id) => {
                    let s = self.sess.syms.get(id);
                    if s.ty != SymType::Proc || s.val() != UNDEFINED {
                        self.severe(&format!("{} is already defined.", name))?;
                        return Ok(None);
                    }
                    self.sess.syms.get_mut(id).payload = Payload::Int(DEFINED);
                    id
                }
            },
            _ => {
                // A method: the name must be a method selector of the
                // current object.
                let obj = self.sess.cur_obj;
                let ok = existing.map_or(false, |id| {
                    let num = self.sess.syms.get(id).val();
                    obj.and_then(|o| self.sess.classes.get(o).find_selector(num))
                        .map_or(false, |sn| sn.tag.is_method())
                });
                if !ok {
                    let obj_name = obj
                        .map(|o| self.sess.syms.name(self.sess.classes.get(o).sym).to_string())
                        .unwrap_or_default();
                    self.severe(&format!("{} is not a method for class {}", name, obj_name))?;
                    return Ok(None);
                }
                existing.unwrap()
            }
        };

        let mut node = PNode::new(
            if what == SymType::Proc {
                PnKind::Proc
            } else {
                PnKind::Method
            },
            line,
        );
        node.sym = Some(sym);
        node.val = self.parameter_list()?;
        Ok(Some(node))
    }

    /// `parameter-list ::= [variable+] ['&tmp' variable+]`.  Returns the
    /// number of temporary variables.
    fn parameter_list(&mut self) -> PResult<i32> {
        let mut parm_ofs: i32 = 1;
        let mut parm_type = SymType::Param;

        self.in_parm_list = true;
        let r = (|| -> PResult<i32> {
            loop {
                self.lookup_tok()?;
                if self.ty().is_close() {
                    break;
                }
                match self.ty() {
                    SymType::Keyword if self.val() == Keyword::Tmp as i32 => {
                        // Temporaries follow; record where the parameters
                        // ended for `&rest`.
                        self.add_rest(parm_ofs);
                        parm_ofs = 0;
                        parm_type = SymType::Temp;
                    }
                    SymType::Ident => {
                        self.new_parm(parm_ofs, parm_type)?;
                        parm_ofs += 1;
                    }
                    SymType::OpenBracket => {
                        if !self.get_ident()? {
                            break;
                        }
                        self.new_parm(parm_ofs, parm_type)?;
                        if !self.get_number("array size")? {
                            return Ok(0);
                        }
                        parm_ofs += self.val();
                        self.get_token()?;
                        if self.ty() != SymType::CloseBracket {
                            let t = self.text();
                            self.sess.error(&format!("expecting closing ']': {}.", t));
                            self.unget();
                        }
                    }
                    SymType::Select => {
                        let is_cur = self
                            .sess
                            .cur_obj
                            .and_then(|o| self.sess.classes.get(o).find_selector(self.val()))
                            .is_some();
                        if is_cur {
                            let t = self.text();
                            self.error(&format!("{} is a selector for current object.", t))?;
                        } else {
                            let name = self.text();
                            let id = self.sess.syms.install_local(&name, parm_type);
                            self.sess.syms.get_mut(id).payload = Payload::Int(parm_ofs);
                            parm_ofs += 1;
                        }
                    }
                    _ => {
                        let t = self.text();
                        self.error(&format!("Non-identifier in parameter list: {}", t))?;
                    }
                }
            }

            if parm_type == SymType::Param {
                self.add_rest(parm_ofs);
            }
            self.unget();
            Ok(if parm_type == SymType::Param {
                0
            } else {
                parm_ofs
            })
        })();
        self.in_parm_list = false;
        r
    }

    fn new_parm(&mut self, n: i32, ty: SymType) -> PResult<()> {
        let name = self.text();
        if self.sess.syms.lookup(&name).is_some() {
            self.warning(&format!("Redefinition of '{}'.", name));
        }
        let id = self.sess.syms.install_local(&name, ty);
        self.sess.syms.get_mut(id).payload = Payload::Int(n);
        Ok(())
    }

    fn add_rest(&mut self, ofs: i32) {
        let id = self.sess.syms.install_local("&rest", SymType::Rest);
        self.sess.syms.get_mut(id).payload = Payload::Int(ofs);
    }

    // ── classes and instances ────────────────────────────────────────────

    /// `class ::= 'class' class-name 'of' super instance-body`
    fn do_class(&mut self) -> PResult<()> {
        // A class definition always dirties the database.
        self.sess.classes.added = true;

        let mut class_num = OBJECTNUM;
        let mut super_num = OBJECTNUM;

        let looked = self.lookup_tok()?;
        let name = self.text();
        let (sym, existing_obj) = match looked {
            None => (self.sess.syms.install_class(&name), None),
            Some(id) => {
                if self.ty() != SymType::Class && self.ty() != SymType::Obj {
                    self.severe(&format!("Redefinition of {}.", name))?;
                    return Ok(());
                }
                let obj = self.sess.syms.get(id).obj();
                if let Some(o) = obj {
                    class_num = self.sess.classes.get(o).num;
                    super_num = self.sess.classes.get(o).super_num;
                }
                // Move the symbol into the class scope if it is not
                // already there.  The id is kept so pending references
                // still resolve.
                if self.sess.syms.get(id).ty != SymType::Class {
                    self.sess.syms.remove(&name);
                    self.sess.syms.get_mut(id).ty = SymType::Class;
                    self.sess
                        .syms
                        .adopt_into(crate::symtab::ScopeKind::Classes, id);
                }
                (id, obj)
            }
        };

        self.get_keyword(Keyword::Of)?;

        let super_sym = self.lookup_tok()?;
        if super_sym.is_none() || self.ty() != SymType::Class {
            let t = self.text();
            self.severe(&format!("{} is not a class.", t))?;
            return Ok(());
        }
        let super_id = match self.sess.syms.get(super_sym.unwrap()).obj() {
            Some(o) => o,
            None => {
                let t = self.text();
                self.severe(&format!("{} is not a class.", t))?;
                return Ok(());
            }
        };
        let super_class_num = self.sess.classes.get(super_id).num;

        if super_num != OBJECTNUM && super_num != super_class_num {
            return Err(FatalError::Message(format!(
                "Can't change superclass of {}",
                name
            ))
            .into());
        }

        let the_class = match existing_obj {
            Some(o) if super_num != OBJECTNUM => {
                // Redefinition of a class reloaded from the database: its
                // selectors restart from the superclass.
                self.sess.classes.rederive(o, super_id);
                o
            }
            _ => {
                let mut c = Object::new(ObjKind::Class, sym);
                c.super_num = super_class_num;
                let id = self.sess.classes.alloc(c);
                self.sess.classes.dup_from(id, super_id);
                let num = if class_num == OBJECTNUM {
                    self.sess.classes.claim_next_number(id)?
                } else {
                    self.sess.classes.set_number(id, class_num);
                    class_num
                };
                self.sess.classes.get_mut(id).num = num;
                self.sess.syms.get_mut(sym).payload = Payload::Object(id);
                self.sess.classes.get_mut(super_id).subclasses.push(id);
                id
            }
        };

        {
            let script = self.sess.script;
            let file = self.lex.cur_file();
            let c = self.sess.classes.get_mut(the_class);
            c.sym = sym;
            c.super_num = super_class_num;
            c.script = script;
            c.file = file;
            if let Some(sn) = c.find_selector_mut(crate::selector::SEL_SUPER) {
                sn.val = super_class_num;
            }
        }

        self.instance_body(the_class)
    }

    /// `instance ::= 'instance' symbol 'of' class-name instance-body`
    fn instance(&mut self) -> PResult<()> {
        let looked = self.lookup_tok()?;
        let name = self.text();
        let obj_sym = match looked {
            None => self.sess.syms.install_local(&name, SymType::Obj),
            Some(id) => {
                if self.ty() == SymType::Ident || self.ty() == SymType::Obj {
                    self.sess.syms.get_mut(id).ty = SymType::Obj;
                    if self.sess.syms.get(id).obj().is_some() {
                        self.error(&format!("Duplicate instance name: {}", name))?;
                    }
                    id
                } else {
                    self.severe(&format!("Redefinition of {}.", name))?;
                    return Ok(());
                }
            }
        };

        self.get_keyword(Keyword::Of)?;

        let super_sym = self.lookup_tok()?;
        if super_sym.is_none() || self.ty() != SymType::Class {
            let t = self.text();
            self.severe(&format!("{} is not a class.", t))?;
            return Ok(());
        }
        let super_id = match self.sess.syms.get(super_sym.unwrap()).obj() {
            Some(o) => o,
            None => {
                let t = self.text();
                self.severe(&format!("{} is not a class.", t))?;
                return Ok(());
            }
        };
        let super_class_num = self.sess.classes.get(super_id).num;

        let mut obj = Object::new(ObjKind::Instance, obj_sym);
        obj.num = OBJECTNUM;
        obj.super_num = super_class_num;
        obj.script = self.sess.script;
        obj.file = self.lex.cur_file();
        let id = self.sess.classes.alloc(obj);
        self.sess.classes.dup_from(id, super_id);
        self.sess.classes.get_mut(id).num = OBJECTNUM;
        self.sess.syms.get_mut(obj_sym).payload = Payload::Object(id);

        if let Some(sn) = self
            .sess
            .classes
            .get_mut(id)
            .find_selector_mut(crate::selector::SEL_SUPER)
        {
            sn.val = super_class_num;
        }

        self.instance_body(id)
    }

    /// `instance-body ::= (property-list | method-def | procedure)*`
    fn instance_body(&mut self, obj: ObjectId) -> PResult<()> {
        self.sess.syms.push_scope();
        self.sess.cur_obj = Some(obj);

        let r = self.instance_body_inner(obj);

        self.sess.cur_obj = None;
        self.sess.syms.pop_scope();
        r
    }

    fn instance_body_inner(&mut self, obj: ObjectId) -> PResult<()> {
        // The `name` property defaults to the object's own name; a
        // sentinel tells us whether the body assigned one.
        let name_num = self.sess.name_symbol.map(|s| self.sess.syms.get(s).val());
        if let Some(num) = name_num {
            if let Some(sn) = self.sess.classes.get_mut(obj).find_selector_mut(num) {
                sn.val = -1;
            }
        }

        loop {
            self.get_token()?;
            if !self.ty().is_open() {
                break;
            }

            self.get_token()?;
            let kw = self.keyword();
            if matches!(kw, Keyword::Class | Keyword::Instance) {
                // Out of synch; unwind to the top-level anchor.
                self.sess.error("Mismatched parentheses!");
                return Err(Unwind::Sync);
            }

            let r = match kw {
                Keyword::PropList => self.declaration(obj, true),
                Keyword::MethodList => self.declaration(obj, false),
                Keyword::Method => self.method_def(obj),
                Keyword::Proc => self.procedure(),
                Keyword::Define => self.define(),
                Keyword::Enum => self.do_enum(),
                _ => {
                    let t = self.text();
                    self.severe(&format!(
                        "Only property and method definitions allowed: {}.",
                        t
                    ))
                }
            };
            match r {
                // Recover within the object body and try the next form.
                Err(Unwind::Sync) => continue,
                other => other?,
            }

            self.close_block()?;
        }
        self.unget();

        // Fill the automatic `name` property for bodies that did not set
        // one.
        let auto_name = !self.sess.config.no_auto_name;
        if let Some(num) = name_num {
            let pending = self
                .sess
                .classes
                .get(obj)
                .find_selector(num)
                .map_or(false, |sn| sn.val == -1);
            if pending && auto_name {
                let sym = self.sess.classes.get(obj).sym;
                let name = self.sess.syms.name(sym).to_string();
                let ofs = self.sess.text.find(&name) as i32;
                let sn = self.sess.classes.get_mut(obj).find_selector_mut(num).unwrap();
                sn.tag = SelTag::Text;
                sn.val = ofs;
            }
        }

        // Instances clear the class bit in `-info-`.
        let is_instance = self.sess.syms.get(self.sess.classes.get(obj).sym).ty == SymType::Obj;
        let num_props = self.sess.classes.get(obj).num_props;
        let class_num = self.sess.classes.get(obj).num;
        {
            let o = self.sess.classes.get_mut(obj);
            if is_instance {
                if let Some(sn) = o.find_selector_mut(crate::selector::SEL_INFO) {
                    sn.val &= !crate::selector::CLASSBIT;
                }
            }
            // `-size-` is the number of properties; `-script-` carries the
            // class number until the loader overwrites it.
            if let Some(sn) = o.find_selector_mut(crate::selector::SEL_SIZE) {
                sn.val = num_props;
            }
            if let Some(sn) = o.find_selector_mut(crate::selector::SEL_SCRIPT) {
                sn.val = class_num;
            }
        }

        self.sess.make_object(obj);
        Ok(())
    }

    /// Property or method list within a class/instance body.
    fn declaration(&mut self, obj: ObjectId, props: bool) -> PResult<()> {
        loop {
            self.get_token()?;
            if self.ty().is_close() {
                break;
            }
            if self.ty().is_open() {
                self.definition()?;
                continue;
            }

            let name = self.text();
            let mut sym = self.sess.syms.lookup(&name);
            let is_class = self.sess.classes.get(obj).num != OBJECTNUM;
            if sym.is_none() && is_class {
                // A new selector: allocate the next free number.
                let num = self.sess.seltbl.next_free()?;
                sym = Some(self.sess.install_selector(&name, num)?);
            }

            let Some(sym) = sym else {
                self.error(&format!("Not a selector: {}", name))?;
                continue;
            };
            let sel_num = self.sess.syms.get(sym).val();

            let existing = self
                .sess
                .classes
                .get(obj)
                .find_selector(sel_num)
                .map(|sn| sn.tag);
            if existing.is_none() {
                if is_class {
                    let tag = if props { SelTag::Prop } else { SelTag::Method };
                    self.sess
                        .classes
                        .get_mut(obj)
                        .add_selector(sym, sel_num, tag);
                } else {
                    self.error("Can't declare property or method in instance.")?;
                    self.get_token()?;
                    if !self.is_number() {
                        self.unget();
                    }
                    continue;
                }
            }

            let tag = self
                .sess
                .classes
                .get(obj)
                .find_selector(sel_num)
                .map(|sn| sn.tag)
                .unwrap();
            let wrong_kind = self.sess.syms.get(sym).ty != SymType::Select
                || (props && !tag.is_property())
                || (!props && tag.is_property());
            if wrong_kind {
                self.error(&format!(
                    "Not a {}: {}.",
                    if props { "property" } else { "method" },
                    name
                ))?;
                self.get_token()?;
                if !self.is_number() {
                    self.unget();
                }
                continue;
            }

            if props {
                if !self.get_number_or_string("Initial property value")? {
                    continue;
                }
                let val = self.val();
                let is_text = self.ty() == SymType::Str;
                let sn = self
                    .sess
                    .classes
                    .get_mut(obj)
                    .find_selector_mut(sel_num)
                    .unwrap();
                sn.val = val;
                sn.tag = if is_text { SelTag::Text } else { SelTag::Prop };
            }
        }
        self.unget();
        Ok(())
    }

    /// `method-def ::= 'method' call-def expression*`
    fn method_def(&mut self, obj: ObjectId) -> PResult<()> {
        self.sess.syms.push_scope();
        let r = (|| -> PResult<()> {
            let Some(mut node) = self.call_def(SymType::Select)? else {
                return Ok(());
            };
            let sym = node.sym.expect("method node carries its selector");
            let sel_num = self.sess.syms.get(sym).val();

            let is_prop = self
                .sess
                .classes
                .get(obj)
                .find_selector(sel_num)
                .map_or(true, |sn| sn.tag.is_property());
            if self.sess.syms.get(sym).ty != SymType::Select || is_prop {
                let name = self.sess.syms.name(sym).to_string();
                self.error(&format!("Not a method: {}", name))?;
            } else if self.sess.syms.get(sym).slot.defined().is_some() {
                let name = self.sess.syms.name(sym).to_string();
                self.error(&format!("Method already defined: {}", name))?;
            } else {
                self.expr_list_into(&mut node, OPTIONAL)?;
                self.sess.compile(&node);

                let code = self.sess.syms.get(sym).slot.defined();
                let sn = self
                    .sess
                    .classes
                    .get_mut(obj)
                    .find_selector_mut(sel_num)
                    .unwrap();
                sn.tag = SelTag::Local;
                sn.code = code;
            }
            Ok(())
        })();
        self.sess.syms.pop_scope();
        r
    }

    /// `classdef` — reload a class definition from the database.
    fn define_class(&mut self) -> PResult<()> {
        let looked = self.lookup_tok()?;
        let name = self.text();
        let sym = match looked {
            None => self.sess.syms.install_class(&name),
            Some(_) if matches!(self.ty(), SymType::Ident | SymType::Obj) => {
                self.sess.syms.remove(&name);
                self.sess.syms.install_class(&name)
            }
            Some(_) => {
                self.severe(&format!("Redefinition of {}.", name))?;
                return Ok(());
            }
        };

        self.get_keyword(Keyword::ScriptNum)?;
        if !self.get_number("Script #")? {
            return Ok(());
        }
        let script_num = self.val();
        self.get_keyword(Keyword::ClassNum)?;
        if !self.get_number("Class #")? {
            return Ok(());
        }
        let class_num = self.val();
        self.get_keyword(Keyword::Super)?;
        if !self.get_number("Super #")? {
            return Ok(());
        }
        let super_num = self.val();
        self.get_keyword(Keyword::File)?;
        if !self.get_string("File name")? {
            return Ok(());
        }
        let file = self.text();

        let Some(super_id) = self.sess.classes.find(super_num).or_else(|| {
            if super_num == -1 {
                self.sess.classes.root
            } else {
                None
            }
        }) else {
            return Err(
                FatalError::Message(format!("Can't find superclass for {}\n", name)).into(),
            );
        };

        let mut c = Object::new(ObjKind::Class, sym);
        c.super_num = super_num;
        c.script = script_num;
        c.num = class_num;
        c.file = file;
        let id = self.sess.classes.alloc(c);
        self.sess.classes.dup_from(id, super_id);
        self.sess.syms.get_mut(sym).payload = Payload::Object(id);
        self.sess.classes.get_mut(super_id).subclasses.push(id);

        if !self.sess.classes.set_number(id, class_num) {
            let holder = self
                .sess
                .classes
                .find(class_num)
                .map(|o| self.sess.syms.name(self.sess.classes.get(o).sym).to_string())
                .unwrap_or_default();
            self.severe(&format!("{} is already class #{}.", holder, class_num))?;
            return Ok(());
        }

        // Property and method lists.
        loop {
            self.get_token()?;
            if !self.ty().is_open() {
                break;
            }
            self.get_token()?;
            match self.keyword() {
                Keyword::PropList => self.def_class_items(id, true)?,
                Keyword::MethodList => self.def_class_items(id, false)?,
                _ => {
                    let t = self.text();
                    self.severe(&format!(
                        "Only properties or methods allowed in 'class': {}",
                        t
                    ))?;
                }
            }
            self.close_block()?;
        }
        self.unget();
        Ok(())
    }

    fn def_class_items(&mut self, obj: ObjectId, props: bool) -> PResult<()> {
        loop {
            let looked = self.lookup_tok()?;
            if self.ty().is_close() {
                break;
            }

            if looked.is_none() || self.sess.syms.get(looked.unwrap()).ty != SymType::Select {
                let t = self.text();
                self.error(&format!("Not a selector: {}", t))?;
                if props {
                    self.get_token()?;
                    if !self.is_number() {
                        self.unget();
                    }
                }
                continue;
            }
            let sym = looked.unwrap();
            let sel_num = self.sess.syms.get(sym).val();

            let existing = self
                .sess
                .classes
                .get(obj)
                .find_selector(sel_num)
                .map(|sn| sn.tag);
            if let Some(tag) = existing {
                if props != tag.is_property() {
                    let t = self.text();
                    self.error(&format!(
                        "Already defined as {}: {}",
                        if tag.is_property() { "property" } else { "method" },
                        t
                    ))?;
                    if props {
                        self.get_token()?;
                        if !self.is_number() {
                            self.unget();
                        }
                    }
                    continue;
                }
            } else {
                let tag = if props { SelTag::Prop } else { SelTag::Method };
                self.sess
                    .classes
                    .get_mut(obj)
                    .add_selector(sym, sel_num, tag);
            }

            if !props {
                // Methods listed in a classdef were declared by this
                // class.
                let sn = self
                    .sess
                    .classes
                    .get_mut(obj)
                    .find_selector_mut(sel_num)
                    .unwrap();
                sn.tag = SelTag::Local;
            } else {
                if !self.get_number("initial selector value")? {
                    continue;
                }
                let val = self.val();
                let sn = self
                    .sess
                    .classes
                    .get_mut(obj)
                    .find_selector_mut(sel_num)
                    .unwrap();
                if sn.tag != SelTag::PropDict && sn.tag != SelTag::MethDict {
                    sn.tag = SelTag::Prop;
                }
                sn.val = val;
            }
        }
        self.unget();
        Ok(())
    }

    /// `(selectors (name number)+)` — seed the selector table from the
    /// database.
    fn init_selectors(&mut self) -> PResult<()> {
        loop {
            let looked = self.lookup_tok()?;
            if self.ty().is_close() {
                break;
            }

            if looked.is_some() && self.ty() != SymType::Select {
                let t = self.text();
                self.error(&format!("Redefinition of {}.", t))?;
                self.get_token()?;
                if !self.is_number() {
                    self.unget();
                }
                continue;
            }
            let name = self.text();

            if !self.get_number("Selector number")? {
                continue;
            }
            let num = self.val();
            match looked {
                None => {
                    self.sess.install_selector(&name, num)?;
                }
                Some(id) => {
                    self.sess.seltbl.claim(num)?;
                    self.sess.syms.get_mut(id).payload = Payload::Int(num);
                }
            }
        }
        self.unget();

        // These selectors came from the database itself; nothing new to
        // write back.
        self.sess.seltbl.added = false;
        Ok(())
    }

    /// Auto-install an unknown message selector at the next free number.
    pub fn install_new_selector(&mut self, name: &str) -> PResult<SymbolId> {
        let num = self.sess.seltbl.next_free()?;
        let id = self.sess.install_selector(name, num)?;
        if self.sess.config.show_selectors {
            self.sess
                .info(&format!("{} is being installed as a selector.", name));
        }
        Ok(id)
    }
}

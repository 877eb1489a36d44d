/// The block-scoped symbol environment.
///
/// Four persistent roots (module, globals, classes, selectors) sit under a
/// LIFO stack of transient scopes pushed for each procedure, method, or
/// object body.  Lookup walks transient scopes innermost-first, then the
/// module scope, then globals, classes, and selectors; the first hit wins.
/// Installation always targets a specific named scope.

use indexmap::IndexMap;

use crate::symbol::{RefSlot, SymType, Symbol, SymbolId};

#[derive(Debug, Default)]
pub struct Scope {
    names: IndexMap<String, SymbolId>,
    /// Retain the scope for listing/disassembly after it is popped.
    pub keep: bool,
}

impl Scope {
    fn new(keep: bool) -> Self {
        Scope {
            names: IndexMap::new(),
            keep,
        }
    }

    pub fn get(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.names.values().copied()
    }
}

/// Which named scope an installation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Innermost transient scope if any, else the module scope.
    Local,
    Module,
    Global,
    Classes,
    Selectors,
}

pub struct SymTbls {
    arena: Vec<Symbol>,
    pub globals: Scope,
    pub classes: Scope,
    pub selectors: Scope,
    pub module: Scope,
    stack: Vec<Scope>,
    retained: Vec<Scope>,
    /// Set while a listing is being produced so popped scopes survive for
    /// the disassembly pass.
    pub keep_popped: bool,
    /// False until the first translation unit starts; until then,
    /// module-less installs land in the global scope (the database and
    /// header files are read before any unit).
    pub module_active: bool,
}

impl Default for SymTbls {
    fn default() -> Self {
        Self::new()
    }
}

impl SymTbls {
    pub fn new() -> Self {
        SymTbls {
            arena: Vec::new(),
            globals: Scope::new(true),
            classes: Scope::new(true),
            selectors: Scope::new(true),
            module: Scope::new(false),
            stack: Vec::new(),
            retained: Vec::new(),
            keep_popped: false,
            module_active: false,
        }
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.arena[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.arena[id.0 as usize]
    }

    pub fn name(&self, id: SymbolId) -> &str {
        &self.get(id).name
    }

    fn alloc(&mut self, sym: Symbol) -> SymbolId {
        let id = SymbolId(self.arena.len() as u32);
        self.arena.push(sym);
        id
    }

    /// Install a fresh symbol into the named scope.  Shadowing an existing
    /// name in an outer scope is legal; duplicates within one scope replace
    /// the old binding (the caller diagnoses redefinitions).
    pub fn install_in(&mut self, scope: ScopeKind, name: &str, ty: SymType) -> SymbolId {
        let id = self.alloc(Symbol::new(name, ty));
        let tbl = match scope {
            ScopeKind::Local => match self.stack.last_mut() {
                Some(s) => s,
                None if self.module_active => &mut self.module,
                None => &mut self.globals,
            },
            ScopeKind::Module => &mut self.module,
            ScopeKind::Global => &mut self.globals,
            ScopeKind::Classes => &mut self.classes,
            ScopeKind::Selectors => &mut self.selectors,
        };
        tbl.names.insert(name.to_string(), id);
        id
    }

    pub fn install_local(&mut self, name: &str, ty: SymType) -> SymbolId {
        self.install_in(ScopeKind::Local, name, ty)
    }

    pub fn install_module(&mut self, name: &str, ty: SymType) -> SymbolId {
        self.install_in(ScopeKind::Module, name, ty)
    }

    pub fn install_global(&mut self, name: &str, ty: SymType) -> SymbolId {
        self.install_in(ScopeKind::Global, name, ty)
    }

    pub fn install_class(&mut self, name: &str) -> SymbolId {
        self.install_in(ScopeKind::Classes, name, SymType::Class)
    }

    pub fn install_selector(&mut self, name: &str) -> SymbolId {
        self.install_in(ScopeKind::Selectors, name, SymType::Select)
    }

    /// Scope-stack walk, first match wins.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        for scope in self.stack.iter().rev() {
            if let Some(id) = scope.get(name) {
                return Some(id);
            }
        }
        self.module
            .get(name)
            .or_else(|| self.globals.get(name))
            .or_else(|| self.classes.get(name))
            .or_else(|| self.selectors.get(name))
    }

    /// Remove the binding for `name` from the innermost scope that has it,
    /// returning the symbol id.  The arena entry itself survives (assembly
    /// nodes may still reference it).
    pub fn remove(&mut self, name: &str) -> Option<SymbolId> {
        for scope in self.stack.iter_mut().rev() {
            if let Some(id) = scope.names.shift_remove(name) {
                return Some(id);
            }
        }
        self.module
            .names
            .shift_remove(name)
            .or_else(|| self.globals.names.shift_remove(name))
            .or_else(|| self.classes.names.shift_remove(name))
            .or_else(|| self.selectors.names.shift_remove(name))
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.remove(name).is_some()
    }

    /// Rebind an existing symbol into a named scope (keeping its id, so
    /// pending references survive the move).
    pub fn adopt_into(&mut self, scope: ScopeKind, id: SymbolId) {
        let name = self.get(id).name.clone();
        let tbl = match scope {
            ScopeKind::Local => match self.stack.last_mut() {
                Some(s) => s,
                None if self.module_active => &mut self.module,
                None => &mut self.globals,
            },
            ScopeKind::Module => &mut self.module,
            ScopeKind::Global => &mut self.globals,
            ScopeKind::Classes => &mut self.classes,
            ScopeKind::Selectors => &mut self.selectors,
        };
        tbl.names.insert(name, id);
    }

    /// Push a transient scope for a procedure/method/object body.
    pub fn push_scope(&mut self) -> usize {
        self.stack.push(Scope::new(false));
        self.stack.len()
    }

    /// Pop the innermost transient scope.  Retained when a listing needs
    /// the names later, discarded otherwise.
    pub fn pop_scope(&mut self) {
        if let Some(scope) = self.stack.pop() {
            if self.keep_popped {
                self.retained.push(scope);
            }
        }
    }

    /// Start a fresh module scope for the next translation unit, dropping
    /// any transient leftovers from the previous one.
    pub fn reset_module(&mut self) {
        self.stack.clear();
        self.retained.clear();
        self.module_active = true;
        let old = std::mem::replace(&mut self.module, Scope::new(false));
        if self.keep_popped {
            self.retained.push(old);
        }
    }

    /// Invalidate every resolution slot that points into the previous
    /// unit's assembly arena.  Runs between translation units.
    pub fn clear_asm_refs(&mut self) {
        for sym in &mut self.arena {
            sym.slot = RefSlot::Pending(None);
        }
    }

    /// All selector symbols in installation order.
    pub fn selector_ids(&self) -> Vec<SymbolId> {
        self.selectors.ids().collect()
    }

    /// All class symbols in installation order.
    pub fn class_ids(&self) -> Vec<SymbolId> {
        self.classes.ids().collect()
    }
}

/// The builtin operators and keywords, installed once per job into the
/// global scope.
pub fn install_builtins(syms: &mut SymTbls) {
    use crate::symbol::Keyword as K;
    use crate::symbol::*;

    let keywords: &[(&str, K)] = &[
        ("include", K::Include),
        ("public", K::Public),
        ("extern", K::Extern),
        ("globaldecl", K::GlobalDecl),
        ("global", K::Global),
        ("local", K::Local),
        ("define", K::Define),
        ("enum", K::Enum),
        ("procedure", K::Proc),
        ("selectors", K::Selectors),
        ("class-def", K::ClassDef),
        ("classdef", K::ClassDef),
        ("script#", K::ScriptNum),
        ("class#", K::ClassNum),
        ("super#", K::Super),
        ("class", K::Class),
        ("properties", K::PropList),
        ("methods", K::MethodList),
        ("method", K::Method),
        ("instance", K::Instance),
        ("of", K::Of),
        ("kindof", K::Of),
        ("kind-of", K::Of),
        ("&tmp", K::Tmp),
        ("return", K::Return),
        ("break", K::Break),
        ("breakif", K::BreakIf),
        ("continue", K::Cont),
        ("contif", K::ContIf),
        ("while", K::While),
        ("repeat", K::Repeat),
        ("for", K::For),
        ("if", K::If),
        ("else", K::Else),
        ("cond", K::Cond),
        ("switch", K::Switch),
        ("switchto", K::SwitchTo),
        ("++", K::Inc),
        ("--", K::Dec),
        ("&rest", K::Rest),
        ("file#", K::File),
    ];
    for &(name, kw) in keywords {
        let id = syms.install_global(name, SymType::Keyword);
        syms.get_mut(id).payload = Payload::Int(kw as i32);
    }

    let ops: &[(&str, SymType, i32)] = &[
        ("+", SymType::Nary, N_PLUS),
        ("*", SymType::Nary, N_MUL),
        ("^", SymType::Nary, N_BITXOR),
        ("&", SymType::Nary, N_BITAND),
        ("|", SymType::Nary, N_BITOR),
        ("and", SymType::Nary, N_AND),
        ("or", SymType::Nary, N_OR),
        ("-", SymType::Binary, B_MINUS),
        ("/", SymType::Binary, B_DIV),
        ("mod", SymType::Binary, B_MOD),
        ("<<", SymType::Binary, B_SLEFT),
        (">>", SymType::Binary, B_SRIGHT),
        ("=", SymType::Assign, A_EQ),
        ("+=", SymType::Assign, A_PLUS),
        ("*=", SymType::Assign, A_MUL),
        ("-=", SymType::Assign, A_MINUS),
        ("/=", SymType::Assign, A_DIV),
        ("<<=", SymType::Assign, A_SLEFT),
        (">>=", SymType::Assign, A_SRIGHT),
        ("^=", SymType::Assign, A_XOR),
        ("&=", SymType::Assign, A_AND),
        ("|=", SymType::Assign, A_OR),
        ("~", SymType::Unary, U_BNOT),
        ("not", SymType::Unary, U_NOT),
        ("neg", SymType::Unary, U_NEG),
        (">", SymType::Comp, C_GT),
        (">=", SymType::Comp, C_GE),
        ("<", SymType::Comp, C_LT),
        ("<=", SymType::Comp, C_LE),
        ("u>", SymType::Comp, C_UGT),
        ("u>=", SymType::Comp, C_UGE),
        ("u<", SymType::Comp, C_ULT),
        ("u<=", SymType::Comp, C_ULE),
        ("==", SymType::Comp, C_EQ),
        ("!=", SymType::Comp, C_NE),
        ("TRUE", SymType::Num, 1),
        ("FALSE", SymType::Num, 0),
        ("argc", SymType::Param, 0),
    ];
    for &(name, ty, val) in ops {
        let id = syms.install_global(name, ty);
        syms.get_mut(id).payload = Payload::Int(val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_scopes_shadow_and_pop() {
        let mut syms = SymTbls::new();
        let g = syms.install_global("door", SymType::Global);
        syms.push_scope();
        let l = syms.install_local("door", SymType::Temp);
        assert_eq!(syms.lookup("door"), Some(l));
        syms.pop_scope();
        assert_eq!(syms.lookup("door"), Some(g));
    }

    #[test]
    fn module_scope_precedes_globals() {
        let mut syms = SymTbls::new();
        let g = syms.install_global("x", SymType::Global);
        let m = syms.install_module("x", SymType::Obj);
        assert_eq!(syms.lookup("x"), Some(m));
        syms.reset_module();
        assert_eq!(syms.lookup("x"), Some(g));
    }

    #[test]
    fn install_local_targets_innermost() {
        let mut syms = SymTbls::new();
        // Before any unit starts, module-less installs are global.
        let pre = syms.install_local("pre", SymType::Define);
        assert_eq!(syms.globals.get("pre"), Some(pre));
        syms.reset_module();
        // No transient scope: local installs land in the module scope.
        let a = syms.install_local("a", SymType::Local);
        assert_eq!(syms.module.get("a"), Some(a));
        syms.push_scope();
        let b = syms.install_local("b", SymType::Temp);
        syms.pop_scope();
        assert_eq!(syms.lookup("b"), None);
        // The arena entry is still addressable.
        assert_eq!(syms.get(b).name, "b");
    }

    #[test]
    fn clear_asm_refs_resets_slots() {
        use crate::anode::AsmNodeId;
        let mut syms = SymTbls::new();
        let id = syms.install_global("p", SymType::Proc);
        syms.get_mut(id).slot = RefSlot::Defined(AsmNodeId(4));
        syms.clear_asm_refs();
        assert_eq!(syms.get(id).slot, RefSlot::Pending(None));
    }

    #[test]
    fn builtins_resolve() {
        let mut syms = SymTbls::new();
        install_builtins(&mut syms);
        let plus = syms.lookup("+").unwrap();
        assert_eq!(syms.get(plus).ty, SymType::Nary);
        let kw = syms.lookup("while").unwrap();
        assert_eq!(syms.get(kw).ty, SymType::Keyword);
        assert_eq!(syms.get(syms.lookup("argc").unwrap()).val(), 0);
    }
}

/// Parse tree nodes.
///
/// One node kind per syntactic form; `val` is overloaded per kind (literal
/// value, operator code, variable offset, selector number, break level,
/// temp-var count).

use crate::symbol::SymbolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnKind {
    /// Expression list (statement sequence).
    Elist,
    /// Single wrapped expression.
    Expr,
    Assign,
    Select,
    Num,
    String,
    Global,
    Local,
    Tmp,
    Parm,
    /// Indexed variable access `[var expr]`.
    Index,
    /// Property accessed as a variable inside a method.
    Prop,
    Class,
    Obj,
    Super,
    Extern,
    Call,
    Send,
    /// One message group within a send.
    Msg,
    Unary,
    Binary,
    Nary,
    Comp,
    Return,
    If,
    Cond,
    Switch,
    SwitchTo,
    Else,
    IncDec,
    Proc,
    Method,
    While,
    Repeat,
    For,
    Break,
    BreakIf,
    Cont,
    ContIf,
    Rest,
}

#[derive(Debug)]
pub struct PNode {
    pub kind: PnKind,
    pub val: i32,
    pub sym: Option<SymbolId>,
    pub line: u32,
    pub children: Vec<PNode>,
}

impl PNode {
    pub fn new(kind: PnKind, line: u32) -> Self {
        PNode {
            kind,
            val: 0,
            sym: None,
            line,
            children: Vec::new(),
        }
    }

    pub fn add(&mut self, child: PNode) -> &mut PNode {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    pub fn child(&self, n: usize) -> Option<&PNode> {
        self.children.get(n)
    }

    pub fn first(&self) -> Option<&PNode> {
        self.children.first()
    }
}

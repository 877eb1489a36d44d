/// Job-wide compiler state.
///
/// One `Session` lives for the whole compile job: the symbol environment,
/// the class and selector registries, and the text pool persist across
/// translation units, while the assembly graph and variable lists are
/// reset per unit.

use std::path::PathBuf;

use crate::anode::{AsmGraph, AsmNodeId, VarInit};
use crate::diagnostics::DiagnosticEngine;
use crate::listing::Listing;
use crate::object::{Classes, ObjKind, Object, ObjectId, SelTag};
use crate::selector::*;
use crate::symbol::{Payload, RefSlot, SymType, SymbolId, OBJ_SELF, OBJ_SUPER, KERNEL};
use crate::symtab::{install_builtins, SymTbls};
use crate::text::TextPool;

#[derive(Debug, Clone)]
pub struct Config {
    /// Abort instead of polling when the database is locked.
    pub abort_if_locked: bool,
    /// Include line-number debug records in the hunk.
    pub include_debug_info: bool,
    /// Maximum number of global or local variables.
    pub max_vars: usize,
    /// Emit a `.sl` listing per translation unit.
    pub list_code: bool,
    /// Disable the automatic `name` property for objects.
    pub no_auto_name: bool,
    pub out_dir: PathBuf,
    /// Also emit the property-offset vocabulary.
    pub write_offsets: bool,
    /// Report selectors installed by forward reference.
    pub show_selectors: bool,
    /// Skip database locking entirely.
    pub dont_lock: bool,
    pub verbose: bool,
    /// Emit words high byte first.
    pub high_byte_first: bool,
    /// Disable the branch shrink phase.
    pub no_shrink: bool,
    /// Include-file search directories (from `SINCLUDE`).
    pub include_path: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            abort_if_locked: false,
            include_debug_info: false,
            max_vars: 750,
            list_code: false,
            no_auto_name: false,
            out_dir: PathBuf::from("."),
            write_offsets: false,
            show_selectors: false,
            dont_lock: false,
            verbose: false,
            high_byte_first: false,
            no_shrink: false,
            include_path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    None,
    Global,
    Local,
}

/// A block of variables with initial values.
#[derive(Debug)]
pub struct VarList {
    pub kind: VarKind,
    pub values: Vec<VarInit>,
}

impl VarList {
    pub fn new() -> Self {
        VarList {
            kind: VarKind::None,
            values: Vec::new(),
        }
    }

    pub fn kill(&mut self) {
        self.kind = VarKind::None;
        self.values.clear();
    }
}

impl Default for VarList {
    fn default() -> Self {
        Self::new()
    }
}

/// One `public` dispatch-table entry.
#[derive(Debug, Clone)]
pub struct Public {
    pub sym: SymbolId,
    pub entry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    For,
    While,
    Repeat,
}

/// Active-loop descriptor for `break`/`continue` lowering.
pub struct LoopFrame {
    pub kind: LoopKind,
    /// Label node at the top of the loop.
    pub start: AsmNodeId,
    /// Pending label for `continue` in a `for` loop (branches to the step).
    pub cont: RefSlot,
    /// Pending label for the end of the loop.
    pub end: RefSlot,
}

pub struct Session {
    pub config: Config,
    pub syms: SymTbls,
    pub classes: Classes,
    pub seltbl: SelectorTable,
    pub text: TextPool,
    pub asm: AsmGraph,
    pub diags: DiagnosticEngine,
    pub listing: Option<Listing>,

    pub global_vars: VarList,
    pub local_vars: VarList,
    pub publics: Vec<Public>,
    pub public_max: i32,

    /// Script number of the current unit (`-1` until `script#` is seen).
    pub script: i32,
    /// Object or class whose body is being compiled.
    pub cur_obj: Option<ObjectId>,
    /// Stack of active loops in the current code body.
    pub loops: Vec<LoopFrame>,
    /// Last line number emitted as a debug record.
    pub last_line_num: u32,
    /// The `name` selector, looked up once per unit.
    pub name_symbol: Option<SymbolId>,
    /// Dispatch table of the current unit.
    pub disp_list: Option<crate::anode::ListId>,
    /// Word node holding the dispatch-entry count.
    pub num_disp_entries: Option<AsmNodeId>,

    /// Current source position, mirrored from the scanner for
    /// diagnostics raised outside the parser.
    pub cur_file: String,
    pub cur_line: u32,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let mut sess = Session {
            diags: DiagnosticEngine::new(config.verbose),
            config,
            syms: SymTbls::new(),
            classes: Classes::new(),
            seltbl: SelectorTable::new(),
            text: TextPool::new(),
            asm: AsmGraph::new(),
            listing: None,
            global_vars: VarList::new(),
            local_vars: VarList::new(),
            publics: Vec::new(),
            public_max: -1,
            script: -1,
            cur_obj: None,
            loops: Vec::new(),
            last_line_num: 0,
            name_symbol: None,
            disp_list: None,
            num_disp_entries: None,
            cur_file: String::new(),
            cur_line: 0,
        };
        sess.syms.keep_popped = sess.config.list_code;
        install_builtins(&mut sess.syms);
        sess.install_objects();
        sess
    }

    /// Install the root of the class system and its bookkeeping selectors,
    /// plus the `self` and `super` pseudo-objects.
    fn install_objects(&mut self) {
        let root_sym = self.syms.install_class("RootObj");
        let mut root = Object::new(ObjKind::Class, root_sym);
        root.script = KERNEL;
        root.num = -1;
        root.super_num = -1;
        let root_id = self.classes.alloc(root);
        self.syms.get_mut(root_sym).payload = Payload::Object(root_id);
        self.classes.root = Some(root_id);

        let specials: &[(&str, i32, SelTag, i32)] = &[
            ("-objID-", SEL_OBJID, SelTag::Prop, 0x1234),
            ("-size-", SEL_SIZE, SelTag::Prop, 0),
            ("-propDict-", SEL_PROPDICT, SelTag::PropDict, 0),
            ("-methDict-", SEL_METHDICT, SelTag::MethDict, 0),
            ("-classScript-", SEL_CLASS_SCRIPT, SelTag::Prop, 0),
            ("-script-", SEL_SCRIPT, SelTag::Prop, 0),
            ("-super-", SEL_SUPER, SelTag::Prop, -1),
            ("-info-", SEL_INFO, SelTag::Prop, CLASSBIT),
        ];
        for &(name, num, tag, init) in specials {
            let sym = self
                .install_selector(name, num)
                .expect("reserved selector numbers are always claimable");
            let obj = self.classes.get_mut(root_id);
            obj.add_selector(sym, num, tag).val = init;
        }
        // Seeding from the reserved numbers does not dirty the database.
        self.seltbl.added = false;

        let s = self.syms.install_global("self", SymType::Obj);
        self.syms.get_mut(s).payload = Payload::Int(OBJ_SELF);
        let s = self.syms.install_global("super", SymType::Class);
        self.syms.get_mut(s).payload = Payload::Int(OBJ_SUPER);
    }

    /// Add `name` to the selector table with a fixed number.
    pub fn install_selector(&mut self, name: &str, value: i32) -> crate::errors::PResult<SymbolId> {
        self.seltbl.claim(value)?;
        self.seltbl.added = true;
        let sym = self.syms.install_selector(name);
        self.syms.get_mut(sym).payload = Payload::Int(value);
        Ok(sym)
    }

    /// Reset the per-unit state for the next translation unit.
    pub fn start_unit(&mut self) {
        self.script = -1;
        self.diags.start_unit();
        self.publics.clear();
        self.public_max = -1;
        self.text.init();
        self.local_vars.kill();
        self.syms.reset_module();
        self.cur_obj = None;
        self.loops.clear();
        self.last_line_num = 0;
        self.name_symbol = self
            .syms
            .selectors
            .get("name");
    }

    pub fn error(&mut self, msg: &str) {
        let (f, l) = (self.cur_file.clone(), self.cur_line);
        self.diags.error(&f, l, msg);
    }

    pub fn warning(&mut self, msg: &str) {
        let (f, l) = (self.cur_file.clone(), self.cur_line);
        self.diags.warning(&f, l, msg);
    }

    pub fn info(&mut self, msg: &str) {
        let (f, l) = (self.cur_file.clone(), self.cur_line);
        self.diags.info(&f, l, msg);
    }
}

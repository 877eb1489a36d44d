/// Classes and instances.
///
/// A class owns an ordered sequence of selector entries.  Constructing an
/// object (class or instance) from a superclass shallow-copies every
/// inherited entry; locally-defined-method tags demote to inherited-method
/// in the copy.  Class numbers come from a fixed slot table and persist
/// across compiles through the `classdef` database.

use crate::anode::AsmNodeId;
use crate::errors::{FatalError, PResult};
use crate::selector::{SEL_METHDICT, SEL_PROPDICT};
use crate::symbol::SymbolId;

pub const MAX_CLASSES: usize = 512;

/// Class number used for instances (and the root class).
pub const OBJECTNUM: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u32);

/// Tag of a selector entry within an object template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelTag {
    /// Property; `val` is the initial value.
    Prop,
    /// Property whose value is an offset into the text segment.
    Text,
    /// Property whose value is an offset into the meta-text segment.
    Meta,
    /// Method defined by this object; `code` points at its code block.
    Local,
    /// Method inherited from a superclass.
    Method,
    /// Slot that receives the offset of the property dictionary.
    PropDict,
    /// Slot that receives the offset of the method dictionary.
    MethDict,
}

impl SelTag {
    pub fn is_property(self) -> bool {
        !matches!(self, SelTag::Local | SelTag::Method)
    }

    pub fn is_method(self) -> bool {
        !self.is_property()
    }
}

#[derive(Debug, Clone)]
pub struct SelectorEntry {
    /// The globally-numbered selector symbol.
    pub sym: SymbolId,
    /// Selector number (mirrors the symbol's value; kept here so entries
    /// survive token-slot copies).
    pub num: i32,
    /// Property initial value / text offset.
    pub val: i32,
    /// Byte offset of the property within the object template.
    pub ofs: i32,
    /// Code block of a locally defined method.
    pub code: Option<AsmNodeId>,
    pub tag: SelTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Class,
    Instance,
}

#[derive(Debug)]
pub struct Object {
    pub kind: ObjKind,
    pub sym: SymbolId,
    /// Class number (`OBJECTNUM` for instances).
    pub num: i32,
    /// Class number of the superclass.
    pub super_num: i32,
    /// Script in which the object is defined.
    pub script: i32,
    pub num_props: i32,
    /// Assembly node of the object template once lowered.
    pub an: Option<AsmNodeId>,
    /// Source file that defined the object.
    pub file: String,
    pub selectors: Vec<SelectorEntry>,
    /// Subclasses in definition order (classes only).
    pub subclasses: Vec<ObjectId>,
}

impl Object {
    pub fn new(kind: ObjKind, sym: SymbolId) -> Self {
        Object {
            kind,
            sym,
            num: 0,
            super_num: 0,
            script: 0,
            num_props: 0,
            an: None,
            file: String::new(),
            selectors: Vec::new(),
            subclasses: Vec::new(),
        }
    }

    /// Shallow-copy the superclass's selectors.  Locally defined methods
    /// become inherited methods in the copy.
    pub fn dup_selectors(&mut self, sup: &Object) {
        self.selectors = sup
            .selectors
            .iter()
            .cloned()
            .map(|mut sn| {
                if sn.tag == SelTag::Local {
                    sn.tag = SelTag::Method;
                    sn.code = None;
                }
                sn
            })
            .collect();
        self.num_props = sup.num_props;
    }

    pub fn find_selector(&self, num: i32) -> Option<&SelectorEntry> {
        self.selectors.iter().find(|sn| sn.num == num)
    }

    pub fn find_selector_mut(&mut self, num: i32) -> Option<&mut SelectorEntry> {
        self.selectors.iter_mut().find(|sn| sn.num == num)
    }

    /// Append a selector entry.  Properties get the next template offset.
    /// The dictionary bookkeeping selectors force their special tags no
    /// matter what tag the caller asked for.
    pub fn add_selector(&mut self, sym: SymbolId, num: i32, tag: SelTag) -> &mut SelectorEntry {
        let tag = match num {
            SEL_PROPDICT => SelTag::PropDict,
            SEL_METHDICT => SelTag::MethDict,
            _ => tag,
        };

        let mut sn = SelectorEntry {
            sym,
            num,
            val: 0,
            ofs: 0,
            code: None,
            tag,
        };
        if tag.is_property() {
            sn.ofs = 2 * self.num_props;
            self.num_props += 1;
        }
        self.selectors.push(sn);
        self.selectors.last_mut().unwrap()
    }

    /// True when `sn` is absent from this object, is a method newly
    /// declared in the caller, or is a property whose value differs.  Used
    /// for the differential `classdef` serialization, where `self` is the
    /// superclass of the object being written.
    pub fn selector_differs(&self, sn: &SelectorEntry) -> bool {
        if self.num == OBJECTNUM {
            return true;
        }
        match self.find_selector(sn.num) {
            None => true,
            Some(mine) => {
                (sn.tag.is_method() && sn.tag == SelTag::Local)
                    || (sn.tag == SelTag::Prop && sn.val != mine.val)
            }
        }
    }
}

/// Arena of all objects plus the class-number slot table.
#[derive(Default)]
pub struct Classes {
    objs: Vec<Object>,
    pub by_num: Vec<Option<ObjectId>>,
    pub max_class_num: i32,
    /// The root of the class system.
    pub root: Option<ObjectId>,
    /// A class was defined or changed; the `classdef` file must be
    /// rewritten at job end.
    pub added: bool,
}

impl Classes {
    pub fn new() -> Self {
        Classes {
            objs: Vec::new(),
            by_num: vec![None; MAX_CLASSES],
            max_class_num: -1,
            root: None,
            added: false,
        }
    }

    pub fn alloc(&mut self, obj: Object) -> ObjectId {
        let id = ObjectId(self.objs.len() as u32);
        self.objs.push(obj);
        id
    }

    pub fn get(&self, id: ObjectId) -> &Object {
        &self.objs[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ObjectId) -> &mut Object {
        &mut self.objs[id.0 as usize]
    }

    /// Register `id` in the first free class-number slot and return the
    /// number.
    pub fn claim_next_number(&mut self, id: ObjectId) -> PResult<i32> {
        for n in 0..MAX_CLASSES {
            if self.by_num[n].is_none() {
                self.by_num[n] = Some(id);
                if n as i32 > self.max_class_num {
                    self.max_class_num = n as i32;
                }
                return Ok(n as i32);
            }
        }
        Err(FatalError::OutOfClassNumbers(MAX_CLASSES).into())
    }

    /// Put `id` in a specific slot (used when reloading the database).
    pub fn set_number(&mut self, id: ObjectId, n: i32) -> bool {
        if n < 0 || n as usize >= MAX_CLASSES {
            return false;
        }
        if self.by_num[n as usize].is_some() {
            return false;
        }
        self.by_num[n as usize] = Some(id);
        if n > self.max_class_num {
            self.max_class_num = n;
        }
        true
    }

    /// Copy `src`'s selector sequence into `dst` (object construction
    /// from a superclass).
    pub fn dup_from(&mut self, dst: ObjectId, src: ObjectId) {
        let sup = self.get(src);
        let sels = sup.selectors.clone();
        let props = sup.num_props;
        let mut tmp = Object::new(ObjKind::Instance, SymbolId(0));
        tmp.selectors = sels;
        tmp.num_props = props;
        let d = self.get_mut(dst);
        d.dup_selectors(&tmp);
    }

    /// Reset `dst`'s selectors from its superclass (class redefinition).
    pub fn rederive(&mut self, dst: ObjectId, src: ObjectId) {
        {
            let d = self.get_mut(dst);
            d.selectors.clear();
            d.num_props = 0;
        }
        self.dup_from(dst, src);
    }

    pub fn find(&self, n: i32) -> Option<ObjectId> {
        if n < 0 || n as usize >= MAX_CLASSES {
            return None;
        }
        self.by_num[n as usize]
    }

    /// Class with the smallest class number greater than `n`, for walking
    /// classes in numeric order.
    pub fn next_class(&self, n: i32) -> Option<ObjectId> {
        self.by_num
            .iter()
            .skip((n + 1).max(0) as usize)
            .flatten()
            .next()
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(num: i32, val: i32, tag: SelTag) -> SelectorEntry {
        SelectorEntry {
            sym: SymbolId(0),
            num,
            val,
            ofs: 0,
            code: None,
            tag,
        }
    }

    #[test]
    fn property_offsets_step_by_two() {
        let mut o = Object::new(ObjKind::Class, SymbolId(0));
        o.add_selector(SymbolId(1), 100, SelTag::Prop);
        o.add_selector(SymbolId(2), 101, SelTag::Prop);
        o.add_selector(SymbolId(3), 102, SelTag::Local);
        o.add_selector(SymbolId(4), 103, SelTag::Prop);
        assert_eq!(o.find_selector(100).unwrap().ofs, 0);
        assert_eq!(o.find_selector(101).unwrap().ofs, 2);
        assert_eq!(o.find_selector(103).unwrap().ofs, 4);
        assert_eq!(o.num_props, 3);
    }

    #[test]
    fn dup_demotes_local_methods() {
        let mut sup = Object::new(ObjKind::Class, SymbolId(0));
        sup.num = 3;
        sup.add_selector(SymbolId(1), 10, SelTag::Prop).val = 7;
        sup.add_selector(SymbolId(2), 11, SelTag::Local);

        let mut inst = Object::new(ObjKind::Instance, SymbolId(3));
        inst.num = OBJECTNUM;
        inst.dup_selectors(&sup);

        assert_eq!(inst.num_props, sup.num_props);
        assert_eq!(inst.find_selector(10).unwrap().val, 7);
        assert_eq!(inst.find_selector(11).unwrap().tag, SelTag::Method);
    }

    #[test]
    fn differs_tracks_value_and_origin() {
        let mut sup = Object::new(ObjKind::Class, SymbolId(0));
        sup.num = 1;
        sup.add_selector(SymbolId(1), 10, SelTag::Prop).val = 5;
        sup.add_selector(SymbolId(2), 11, SelTag::Method);

        // Same value: not differing.
        assert!(!sup.selector_differs(&entry(10, 5, SelTag::Prop)));
        // Changed value: differing.
        assert!(sup.selector_differs(&entry(10, 6, SelTag::Prop)));
        // Inherited method: not differing.
        assert!(!sup.selector_differs(&entry(11, 0, SelTag::Method)));
        // Locally redefined method: differing.
        assert!(sup.selector_differs(&entry(11, 0, SelTag::Local)));
        // Unknown selector: differing.
        assert!(sup.selector_differs(&entry(99, 0, SelTag::Prop)));
    }

    #[test]
    fn class_numbers_fill_lowest_free_slot() {
        let mut cs = Classes::new();
        let a = cs.alloc(Object::new(ObjKind::Class, SymbolId(0)));
        let b = cs.alloc(Object::new(ObjKind::Class, SymbolId(1)));
        assert_eq!(cs.claim_next_number(a).unwrap(), 0);
        assert_eq!(cs.claim_next_number(b).unwrap(), 1);
        let c = cs.alloc(Object::new(ObjKind::Class, SymbolId(2)));
        assert!(cs.set_number(c, 7));
        assert_eq!(cs.max_class_num, 7);
        assert_eq!(cs.next_class(1), Some(c));
    }
}

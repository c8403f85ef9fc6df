//! Global symbol table and resolution.
//!
//! Every name maps to exactly one slot; the slot's body is replaced as
//! stronger definitions arrive. Holders keep `SlotId`s, so a replacement
//! (including Lazy → Regular when an archive member loads) is observed
//! everywhere. Precedence between bodies is a total order; ties between
//! strong definitions are duplicate-definition errors.

use std::collections::HashMap;

use crate::diag::DiagSink;
use crate::sections::{SectionArena, SectionId};

/// Index of a symbol slot. Stable for the whole link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Weak,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymType {
    NoType,
    Object,
    Func,
    Tls,
    IFunc,
    Section,
    File,
}

/// The body variants a slot can hold. Ordered here roughly by precedence;
/// `rank()` is the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Defined at an offset inside an input section.
    Regular { section: SectionId, value: u64 },
    /// Tentative definition; merged by size/alignment, allocated late.
    Common { size: u64, align: u64 },
    Absolute { value: u64 },
    /// Linker-materialized, pinned into an output section.
    Synthetic { out_sec: usize, va: u64 },
    /// From a bitcode input; a strong definition until the compiled object
    /// for the same name arrives.
    Bitcode,
    /// Exported by a shared library named on the link line.
    Shared { lib: usize, value: u64, size: u64 },
    Undefined { can_keep: bool, weak: bool },
    /// An archive member, not yet loaded, that defines this name.
    Lazy { archive: usize, member: usize },
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub binding: Binding,
    pub visibility: u8,
    pub ty: SymType,
    pub size: u64,
    pub body: Body,
    /// File that supplied the current body (or first sighted the name).
    pub file: usize,
    /// ARM: definition is Thumb code; the low VA bit is restored only for
    /// function-pointer relocations.
    pub is_thumb: bool,
}

impl Symbol {
    pub fn undefined(name: &str, weak: bool, file: usize) -> Symbol {
        Symbol {
            name: name.to_string(),
            binding: if weak { Binding::Weak } else { Binding::Global },
            visibility: 0,
            ty: SymType::NoType,
            size: 0,
            body: Body::Undefined { can_keep: false, weak },
            file,
            is_thumb: false,
        }
    }

    fn is_defined(&self) -> bool {
        matches!(
            self.body,
            Body::Regular { .. }
                | Body::Common { .. }
                | Body::Absolute { .. }
                | Body::Synthetic { .. }
                | Body::Bitcode
        )
    }
}

/// Precedence of a body (higher wins). Weak-bound definitions rank below
/// common and shared bodies; the body kind alone does not decide.
fn rank(sym: &Symbol) -> u32 {
    match sym.body {
        Body::Regular { .. } | Body::Absolute { .. } | Body::Synthetic { .. } => {
            if sym.binding == Binding::Weak {
                3
            } else {
                7
            }
        }
        Body::Common { .. } => 6,
        Body::Bitcode => {
            if sym.binding == Binding::Weak {
                3
            } else {
                5
            }
        }
        Body::Shared { .. } => 4,
        Body::Lazy { .. } => 2,
        Body::Undefined { .. } => 1,
    }
}

/// Returns 1 if `existing` should keep the slot, -1 if `incoming` takes it,
/// 0 for a conflict (duplicate strong definition).
pub fn compare(existing: &Symbol, incoming: &Symbol) -> i32 {
    let re = rank(existing);
    let ri = rank(incoming);
    if re != ri {
        return if re > ri { 1 } else { -1 };
    }
    match (&existing.body, &incoming.body) {
        // Two absolutes with the same value are an allowed duplicate.
        (Body::Absolute { value: a }, Body::Absolute { value: b }) if a == b => 1,
        _ if re == 7 || re == 5 => 0,
        // Same-rank non-strong bodies: first wins.
        _ => 1,
    }
}

pub struct SymbolTable {
    slots: Vec<Symbol>,
    map: HashMap<String, SlotId>,
    pub shared_libs: Vec<String>,
    pending_loads: Vec<(usize, usize)>,
    progress: bool,
    pub allow_multiple: bool,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            map: HashMap::new(),
            shared_libs: Vec::new(),
            pending_loads: Vec::new(),
            progress: false,
            allow_multiple: false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<SlotId> {
        self.map.get(name).copied()
    }

    pub fn get(&self, id: SlotId) -> &Symbol {
        &self.slots[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut Symbol {
        &mut self.slots[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SlotId> {
        (0..self.slots.len() as u32).map(SlotId)
    }

    /// True if the resolver consumed anything since the last call. The input
    /// driver uses this to re-arm archive groups.
    pub fn take_progress(&mut self) -> bool {
        std::mem::take(&mut self.progress)
    }

    pub fn take_pending_loads(&mut self) -> Vec<(usize, usize)> {
        std::mem::take(&mut self.pending_loads)
    }

    fn insert_new(&mut self, sym: Symbol) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        self.map.insert(sym.name.clone(), id);
        self.slots.push(sym);
        id
    }

    fn trigger_load(&mut self, archive: usize, member: usize) {
        self.pending_loads.push((archive, member));
        self.progress = true;
    }

    /// Insert or merge a named symbol. Resolution decisions follow the
    /// precedence lattice; duplicate strong definitions go to `diags`.
    pub fn add(&mut self, incoming: Symbol, arena: &SectionArena, diags: &mut DiagSink) -> SlotId {
        debug_assert!(incoming.binding != Binding::Local, "locals never enter the table");
        let id = match self.map.get(&incoming.name) {
            Some(&id) => id,
            None => {
                if let Body::Undefined { weak: false, .. } = incoming.body {
                    // Nothing to resolve against yet; still counts as demand.
                }
                return self.insert_new(incoming);
            }
        };

        let existing = &self.slots[id.0 as usize];

        // Lazy bodies resolve by side effect, not by rank.
        if let Body::Lazy { archive, member } = existing.body {
            if matches!(incoming.body, Body::Undefined { weak: false, .. } | Body::Shared { .. }) {
                self.trigger_load(archive, member);
                return id;
            }
            if matches!(incoming.body, Body::Undefined { .. } | Body::Lazy { .. }) {
                return id;
            }
            // A real definition showed up; the archive copy is ignored.
            self.slots[id.0 as usize] = incoming;
            return id;
        }
        if let Body::Lazy { archive, member } = incoming.body {
            // A lazy body offered for a strongly-undefined name loads at once.
            if let Body::Undefined { weak, .. } = existing.body {
                if !weak {
                    self.slots[id.0 as usize].body = Body::Lazy { archive, member };
                    self.trigger_load(archive, member);
                }
            }
            return id;
        }

        // Tentative definitions merge commutatively.
        if let (Body::Common { size: se, align: ae }, Body::Common { size: si, align: ai }) =
            (&existing.body, &incoming.body)
        {
            let merged = Body::Common { size: (*se).max(*si), align: (*ae).max(*ai) };
            self.slots[id.0 as usize].body = merged;
            return id;
        }

        // Undefined references merge: one strong reference keeps the name
        // strong, can-keep-undefined spreads.
        if let (
            Body::Undefined { can_keep: ce, weak: we },
            Body::Undefined { can_keep: ci, weak: wi },
        ) = (&existing.body, &incoming.body)
        {
            let weak = *we && *wi;
            let body = Body::Undefined { can_keep: *ce || *ci, weak };
            let slot = &mut self.slots[id.0 as usize];
            slot.body = body;
            if !weak {
                slot.binding = Binding::Global;
            }
            return id;
        }

        match compare(existing, &incoming) {
            1 => {}
            -1 => {
                let was_undefined = matches!(existing.body, Body::Undefined { .. });
                self.slots[id.0 as usize] = incoming;
                if was_undefined {
                    self.progress = true;
                }
            }
            _ => {
                let old_file = arena.file_name(existing.file).to_string();
                let new_file = arena.file_name(incoming.file).to_string();
                let msg =
                    format!("duplicate symbol: {} in {} and {}", incoming.name, old_file, new_file);
                if self.allow_multiple {
                    diags.warning(msg);
                } else {
                    diags.error(msg);
                }
            }
        }
        id
    }

    /// Register one archive index entry as a lazy body.
    pub fn add_lazy(
        &mut self,
        name: &str,
        archive: usize,
        member: usize,
        file: usize,
    ) -> SlotId {
        let sym = Symbol {
            name: name.to_string(),
            binding: Binding::Global,
            visibility: 0,
            ty: SymType::NoType,
            size: 0,
            body: Body::Lazy { archive, member },
            file,
            is_thumb: false,
        };
        match self.map.get(name) {
            None => self.insert_new(sym),
            Some(&id) => {
                // Only a strongly-undefined slot is interested; definitions,
                // weak undefineds, and earlier lazies all keep the slot.
                if let Body::Undefined { weak: false, .. } = self.slots[id.0 as usize].body {
                    self.slots[id.0 as usize].body = Body::Lazy { archive, member };
                    self.trigger_load(archive, member);
                }
                id
            }
        }
    }

    /// `--wrap=SYM`: references to SYM reach `__wrap_SYM`, references to
    /// `__real_SYM` reach the original definition. Implemented as body
    /// copies between the three slots, observed through slot indirection.
    pub fn apply_wrap(&mut self, name: &str) {
        let sym = self.lookup(name);
        let wrap = self.lookup(&format!("__wrap_{}", name));
        let real = self.lookup(&format!("__real_{}", name));
        let (sym, wrap) = match (sym, wrap) {
            (Some(s), Some(w)) => (s, w),
            _ => return,
        };
        let orig = self.slots[sym.0 as usize].clone();
        let wrapper = self.slots[wrap.0 as usize].clone();
        let s = &mut self.slots[sym.0 as usize];
        s.body = wrapper.body;
        s.ty = wrapper.ty;
        s.size = wrapper.size;
        s.is_thumb = wrapper.is_thumb;
        s.file = wrapper.file;
        if let Some(real) = real {
            let r = &mut self.slots[real.0 as usize];
            r.body = orig.body;
            r.ty = orig.ty;
            r.size = orig.size;
            r.is_thumb = orig.is_thumb;
            r.file = orig.file;
            r.binding = orig.binding;
        }
    }

    /// `--defsym=NAME=VALUE` where VALUE is a number or another symbol.
    pub fn apply_defsym(&mut self, name: &str, value: &str, file: usize) {
        let body = if let Some(hex) = value.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok().map(|v| Body::Absolute { value: v })
        } else if let Ok(v) = value.parse::<u64>() {
            Some(Body::Absolute { value: v })
        } else {
            self.lookup(value).map(|src| self.slots[src.0 as usize].body.clone())
        };
        let Some(body) = body else { return };
        let sym = Symbol {
            name: name.to_string(),
            binding: Binding::Global,
            visibility: 0,
            ty: SymType::NoType,
            size: 0,
            body,
            file,
            is_thumb: false,
        };
        match self.map.get(name) {
            None => {
                self.insert_new(sym);
            }
            Some(&id) => {
                self.slots[id.0 as usize] = sym;
            }
        }
    }

    /// Allocate every surviving tentative definition into a fresh zero-fill
    /// section, rewriting the body to Regular so layout and VA queries need
    /// no special case.
    pub fn allocate_commons(&mut self, arena: &mut SectionArena) {
        use crate::sections::{ContentType, Perms, Section};
        for slot in &mut self.slots {
            if let Body::Common { size, align } = slot.body {
                let file = slot.file;
                let id = arena.add(Section {
                    name: ".bss".to_string(),
                    file,
                    data: Vec::new(),
                    size,
                    content: ContentType::ZeroFill,
                    perms: Perms::Rw,
                    align: align.max(1),
                    flags: crate::elf::SHF_ALLOC | crate::elf::SHF_WRITE,
                    refs: Vec::new(),
                    live: true,
                    repr: SectionId(0),
                    out_sec: None,
                    out_offset: 0,
                    va: 0,
                });
                slot.body = Body::Regular { section: id, value: 0 };
                slot.size = size;
            }
        }
    }

    /// Report every surviving strong undefined. `is_provided` filters names
    /// the output coordinator will materialize later.
    pub fn check_undefined(
        &self,
        arena: &SectionArena,
        can_keep_all: bool,
        is_provided: &dyn Fn(&str) -> bool,
        diags: &mut DiagSink,
    ) {
        if can_keep_all {
            return;
        }
        for slot in &self.slots {
            if let Body::Undefined { can_keep: false, weak: false } = slot.body {
                if is_provided(&slot.name) {
                    continue;
                }
                diags.error(format!(
                    "undefined symbol: {} referenced from {}",
                    slot.name,
                    arena.file_name(slot.file)
                ));
            }
        }
    }

    /// Post-layout virtual address of a symbol plus addend. Returns None for
    /// bodies without a direct address (shared, lazy); those route through
    /// PLT/GOT slots owned by the output coordinator. Undefined weak
    /// resolves to VA 0.
    pub fn get_va(&self, arena: &SectionArena, id: SlotId, addend: i64) -> Option<u64> {
        let sym = &self.slots[id.0 as usize];
        match &sym.body {
            Body::Regular { section, value } => {
                Some(arena.spot_va(*section, *value).wrapping_add(addend as u64))
            }
            Body::Absolute { value } => Some(value.wrapping_add(addend as u64)),
            Body::Synthetic { va, .. } => Some(va.wrapping_add(addend as u64)),
            Body::Undefined { .. } => Some(addend as u64),
            Body::Bitcode => Some(addend as u64),
            Body::Common { .. } => None,
            Body::Shared { .. } => None,
            Body::Lazy { .. } => Some(addend as u64),
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strong(name: &str, value: u64) -> Symbol {
        Symbol {
            name: name.to_string(),
            binding: Binding::Global,
            visibility: 0,
            ty: SymType::Func,
            size: 0,
            body: Body::Regular { section: SectionId(0), value },
            file: 0,
            is_thumb: false,
        }
    }

    fn weak_def(name: &str) -> Symbol {
        let mut s = strong(name, 0);
        s.binding = Binding::Weak;
        s
    }

    fn common(name: &str, size: u64, align: u64) -> Symbol {
        let mut s = strong(name, 0);
        s.body = Body::Common { size, align };
        s
    }

    fn shared(name: &str) -> Symbol {
        let mut s = strong(name, 0);
        s.body = Body::Shared { lib: 0, value: 0x100, size: 8 };
        s
    }

    fn setup() -> (SectionArena, DiagSink) {
        let mut arena = SectionArena::new();
        arena.add_file("a.o");
        arena.add_file("b.o");
        (arena, DiagSink::new(false))
    }

    #[test]
    fn precedence_lattice() {
        // (existing, incoming, expected compare result)
        let cases: Vec<(Symbol, Symbol, i32)> = vec![
            (strong("s", 0), weak_def("s"), 1),
            (weak_def("s"), strong("s", 0), -1),
            (strong("s", 0), shared("s"), 1),
            (shared("s"), strong("s", 0), -1),
            (shared("s"), weak_def("s"), 1),
            (weak_def("s"), shared("s"), -1),
            (common("s", 4, 4), weak_def("s"), 1),
            (strong("s", 0), common("s", 4, 4), 1),
            (common("s", 4, 4), strong("s", 0), -1),
            (strong("s", 0), strong("s", 1), 0),
            (weak_def("s"), weak_def("s"), 1),
            (Symbol::undefined("s", false, 0), strong("s", 0), -1),
            (strong("s", 0), Symbol::undefined("s", false, 0), 1),
        ];
        for (i, (existing, incoming, want)) in cases.iter().enumerate() {
            assert_eq!(compare(existing, incoming), *want, "case {}", i);
        }
    }

    #[test]
    fn equal_absolutes_are_allowed_duplicates() {
        let mut a = strong("s", 0);
        a.body = Body::Absolute { value: 0x10 };
        let mut b = strong("s", 0);
        b.body = Body::Absolute { value: 0x10 };
        assert_eq!(compare(&a, &b), 1);
        b.body = Body::Absolute { value: 0x20 };
        assert_eq!(compare(&a, &b), 0);
    }

    #[test]
    fn duplicate_strong_defs_are_reported_with_both_files() {
        let (arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        tab.add(strong("f", 0), &arena, &mut diags);
        let mut dup = strong("f", 4);
        dup.file = 1;
        tab.add(dup, &arena, &mut diags);
        let err = diags.finish().unwrap_err();
        assert!(err.contains("a.o") && err.contains("b.o"), "{}", err);
    }

    #[test]
    fn common_merges_to_larger_size_and_stricter_alignment() {
        let (arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        let id = tab.add(common("c", 8, 4), &arena, &mut diags);
        tab.add(common("c", 4, 16), &arena, &mut diags);
        assert_eq!(tab.get(id).body, Body::Common { size: 8, align: 16 });
        // A strong definition silently supersedes the tentative one.
        tab.add(strong("c", 0), &arena, &mut diags);
        assert!(matches!(tab.get(id).body, Body::Regular { .. }));
        assert!(diags.finish().is_ok());
    }

    #[test]
    fn lazy_triggers_load_on_strong_undefined() {
        let (arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        tab.add(Symbol::undefined("a", false, 0), &arena, &mut diags);
        tab.add_lazy("a", 0, 120, 1);
        assert_eq!(tab.take_pending_loads(), vec![(0, 120)]);
        assert!(tab.take_progress());
    }

    #[test]
    fn lazy_not_loaded_for_weak_undefined() {
        let (arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        tab.add(Symbol::undefined("w", true, 0), &arena, &mut diags);
        tab.add_lazy("w", 0, 60, 1);
        assert!(tab.take_pending_loads().is_empty());
        // Undefined weak resolves to VA 0 (plus addend).
        let id = tab.lookup("w").unwrap();
        assert_eq!(tab.get_va(&arena, id, 0), Some(0));
    }

    #[test]
    fn undefined_then_lazy_then_reference_order_is_symmetric() {
        let (arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        tab.add_lazy("b", 2, 240, 1);
        assert!(tab.take_pending_loads().is_empty());
        tab.add(Symbol::undefined("b", false, 0), &arena, &mut diags);
        assert_eq!(tab.take_pending_loads(), vec![(2, 240)]);
    }

    #[test]
    fn strong_and_weak_undefined_merge_to_strong() {
        let (arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        let id = tab.add(Symbol::undefined("u", true, 0), &arena, &mut diags);
        tab.add(Symbol::undefined("u", false, 1), &arena, &mut diags);
        assert_eq!(tab.get(id).body, Body::Undefined { can_keep: false, weak: false });
        tab.check_undefined(&arena, false, &|_| false, &mut diags);
        assert!(diags.finish().is_err());
    }

    #[test]
    fn wrap_swaps_bodies_through_slots() {
        let (arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        let sym = tab.add(strong("malloc", 0x10), &arena, &mut diags);
        let wrap = tab.add(strong("__wrap_malloc", 0x20), &arena, &mut diags);
        let real = tab.add(Symbol::undefined("__real_malloc", false, 0), &arena, &mut diags);
        tab.apply_wrap("malloc");
        assert_eq!(tab.get(sym).body, Body::Regular { section: SectionId(0), value: 0x20 });
        assert_eq!(tab.get(real).body, Body::Regular { section: SectionId(0), value: 0x10 });
        assert_eq!(tab.get(wrap).body, Body::Regular { section: SectionId(0), value: 0x20 });
    }

    #[test]
    fn commons_allocate_into_zero_fill() {
        let (mut arena, mut diags) = setup();
        let mut tab = SymbolTable::new();
        let id = tab.add(common("buf", 64, 16), &arena, &mut diags);
        tab.allocate_commons(&mut arena);
        let Body::Regular { section, value } = tab.get(id).body else {
            panic!("common not allocated");
        };
        assert_eq!(value, 0);
        assert_eq!(arena.get(section).size, 64);
        assert_eq!(arena.get(section).align, 16);
        assert!(arena.get(section).is_zero_fill());
    }
}

//! `--gc-sections` liveness marking.
//!
//! BFS reachability from the entry symbol and the init/fini family, then
//! clear the live bit on every allocatable section the walk never reached.
//! Liveness is transitive over reference edges, so a live section keeps
//! every section its references target.

use std::collections::VecDeque;

use crate::diag::DiagSink;
use crate::resolve::{Body, SlotId, SymbolTable};
use crate::sections::{RefTarget, SectionArena, SectionId};

fn is_root_name(name: &str) -> bool {
    name == ".init"
        || name == ".fini"
        || name.starts_with(".init_array")
        || name.starts_with(".fini_array")
        || name.starts_with(".preinit_array")
        || name.starts_with(".ctors")
        || name.starts_with(".dtors")
        || name.starts_with(".note")
}

/// Clear the live bit on unreachable allocatable sections. Returns how many
/// sections were discarded.
pub fn collect_garbage(
    arena: &mut SectionArena,
    symtab: &SymbolTable,
    entry: Option<SlotId>,
    diags: &mut DiagSink,
) -> usize {
    let mut live = vec![false; arena.len()];
    let mut worklist: VecDeque<SectionId> = VecDeque::new();

    let mut mark = |id: SectionId, live: &mut Vec<bool>, wl: &mut VecDeque<SectionId>| {
        if !live[id.0 as usize] {
            live[id.0 as usize] = true;
            wl.push_back(id);
        }
    };

    if let Some(entry) = entry {
        if let Body::Regular { section, .. } = symtab.get(entry).body {
            mark(section, &mut live, &mut worklist);
        }
    }
    for id in arena.ids() {
        let sec = arena.get(id);
        if !sec.is_allocated() || is_root_name(&sec.name) {
            mark(id, &mut live, &mut worklist);
        }
    }

    while let Some(id) = worklist.pop_front() {
        // Collect targets first; the arena borrow must end before marking.
        let targets: Vec<SectionId> = arena
            .get(id)
            .refs
            .iter()
            .filter_map(|r| match r.target {
                RefTarget::Section { section, .. } => Some(section),
                RefTarget::Sym(slot) => match symtab.get(slot).body {
                    Body::Regular { section, .. } => Some(section),
                    _ => None,
                },
            })
            .collect();
        for t in targets {
            mark(t, &mut live, &mut worklist);
        }
    }

    let mut discarded = 0;
    for id in arena.ids() {
        if !live[id.0 as usize] && arena.get(id).live {
            arena.get_mut(id).live = false;
            discarded += 1;
            diags.log(&format!(
                "discarding unused section {} from {}",
                arena.get(id).name,
                arena.file_name(arena.get(id).file)
            ));
        }
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{SHF_ALLOC, SHF_EXECINSTR};
    use crate::resolve::{Binding, Symbol, SymType};
    use crate::sections::{Reference, RelocKind};

    fn code_section(arena: &mut SectionArena, name: &str) -> SectionId {
        arena.add(crate::sections::Section {
            name: name.to_string(),
            file: 0,
            data: vec![0; 8],
            size: 8,
            content: crate::sections::ContentType::Code,
            perms: crate::sections::Perms::Rx,
            align: 4,
            flags: SHF_ALLOC | SHF_EXECINSTR,
            refs: Vec::new(),
            live: true,
            repr: SectionId(0),
            out_sec: None,
            out_offset: 0,
            va: 0,
        })
    }

    #[test]
    fn unreachable_sections_lose_liveness() {
        let mut arena = SectionArena::new();
        arena.add_file("t.o");
        let a = code_section(&mut arena, ".text.a");
        let b = code_section(&mut arena, ".text.b");
        let c = code_section(&mut arena, ".text.c");
        // a -> b, c unreferenced.
        arena.get_mut(a).refs.push(Reference {
            offset: 0,
            kind: RelocKind(2),
            target: crate::sections::RefTarget::Section { section: b, value: 0 },
            addend: 0,
        });

        let mut symtab = SymbolTable::new();
        let mut diags = DiagSink::new(false);
        let entry = symtab.add(
            Symbol {
                name: "_start".into(),
                binding: Binding::Global,
                visibility: 0,
                ty: SymType::Func,
                size: 0,
                body: Body::Regular { section: a, value: 0 },
                file: 0,
                is_thumb: false,
            },
            &arena,
            &mut diags,
        );

        let discarded = collect_garbage(&mut arena, &symtab, Some(entry), &mut diags);
        assert_eq!(discarded, 1);
        assert!(arena.get(a).live);
        assert!(arena.get(b).live);
        assert!(!arena.get(c).live);
    }
}

//! The reference walk: every reference on every live section gets its bytes
//! patched by the target handler.
//!
//! The walk threads the ARM instruction-mode flag per section, routes
//! shared-library targets through their PLT/GOT slots, restores the Thumb
//! interworking bit on function-pointer relocations, and, for relocatable
//! output, computes external stores against the addend alone while
//! collecting the section-relocation records the consumer will re-apply.

use crate::diag::DiagSink;
use crate::elf::EM_MIPS;
use crate::output::dynamic::DynTables;
use crate::resolve::{Binding, Body, SymbolTable};
use crate::sections::{RefTarget, SectionArena};
use crate::target::{ApplyStyle, Demand, FixupCtx, RawReloc, RelocHandler};

/// Section-relocation records collected for `-r` output. `sym` holds the
/// slot index for external records and the target's output-section index
/// for internal ones; the writer remaps both to symbol-table indices.
pub struct FixupResult {
    pub section_relocs: Vec<(usize, RawReloc)>,
}

/// A target needs an external relocation when its definition is not a fact
/// of this link: undefined, tentative, or a global weak definition another
/// object may override.
fn needs_external(symtab: &SymbolTable, slot: crate::resolve::SlotId) -> bool {
    let sym = symtab.get(slot);
    match sym.body {
        Body::Undefined { .. } | Body::Common { .. } | Body::Lazy { .. } => true,
        Body::Regular { .. } | Body::Absolute { .. } | Body::Synthetic { .. } | Body::Bitcode => {
            sym.binding == Binding::Weak
        }
        Body::Shared { .. } => true,
    }
}

pub fn apply_fixups(
    arena: &mut SectionArena,
    symtab: &SymbolTable,
    handler: &dyn RelocHandler,
    tables: &DynTables,
    relocatable: bool,
    diags: &mut DiagSink,
) -> Result<FixupResult, String> {
    let mut result = FixupResult { section_relocs: Vec::new() };

    // MIPS addresses GP-relative data from _gp; everyone else measures
    // GOT-relative forms from the GOT base.
    let got_va = if handler.machine() == EM_MIPS {
        symtab
            .lookup("_gp")
            .and_then(|s| symtab.get_va(arena, s, 0))
            .unwrap_or(tables.got_va)
    } else {
        tables.got_va
    };

    let ids: Vec<_> = arena.ids().collect();
    for id in ids {
        {
            let sec = arena.get(id);
            if !sec.live || sec.refs.is_empty() || sec.is_zero_fill() {
                continue;
            }
        }
        let refs = arena.get(id).refs.clone();
        let mut data = std::mem::take(&mut arena.get_mut(id).data);
        let sec_va = arena.get(id).va;
        let out_sec = arena.get(id).out_sec;
        let out_offset = arena.get(id).out_offset;
        let where_is = || format!("{}:{}", arena.file_name(arena.get(id).file), arena.get(id).name);

        let mut thumb = false;
        for r in &refs {
            let mut external = false;
            let mut target_va;
            let mut emit_sym = 0u32;
            let mut emit_sect = 0u32;
            // Target position relative to its output section, for the
            // section-indexed record forms.
            let mut emit_pos = 0u64;
            match r.target {
                RefTarget::Section { section, value } => {
                    target_va = arena.spot_va(section, value);
                    let tsec = arena.repr(section);
                    emit_sect = arena.get(tsec).out_sec.map(|i| i as u32).unwrap_or(0);
                    emit_pos = arena.get(tsec).out_offset + value;
                }
                RefTarget::Sym(slot) => {
                    let sym = symtab.get(slot);
                    external = needs_external(symtab, slot);
                    emit_sym = slot.0;
                    if let Body::Regular { section, value } = sym.body {
                        let tsec = arena.repr(section);
                        emit_sect = arena.get(tsec).out_sec.map(|i| i as u32).unwrap_or(0);
                        emit_pos = arena.get(tsec).out_offset + value;
                    }
                    let shared = matches!(sym.body, Body::Shared { .. });
                    target_va = if relocatable {
                        symtab.get_va(arena, slot, 0).unwrap_or(0)
                    } else {
                        match handler.demand(r.kind) {
                            Demand::Got => tables
                                .got_va_of(slot)
                                .or_else(|| symtab.get_va(arena, slot, 0))
                                .unwrap_or(0),
                            Demand::Plt if shared => tables.plt_va_of(slot).unwrap_or(0),
                            _ if shared => tables
                                .plt_va_of(slot)
                                .or_else(|| tables.got_va_of(slot))
                                .unwrap_or(0),
                            _ => symtab.get_va(arena, slot, 0).unwrap_or(0),
                        }
                    };
                    // Function pointers to Thumb code carry the
                    // interworking bit; branches do not.
                    if sym.is_thumb && handler.is_pointer(r.kind) {
                        target_va |= 1;
                    }
                }
            }

            let style = if relocatable {
                ApplyStyle::Relocatable { external }
            } else {
                ApplyStyle::Final
            };
            let ctx = FixupCtx {
                fixup_va: sec_va + r.offset,
                target_va,
                in_atom_va: sec_va,
                got_va,
                addend: r.addend,
                style,
            };
            let off = r.offset as usize;
            if off > data.len() {
                return Err(format!("{}: fixup at {:#x} outside section", where_is(), r.offset));
            }
            handler
                .apply(r.kind, &mut data[off..], &ctx, &mut thumb)
                .map_err(|e| format!("{}+{:#x}: {}", where_is(), r.offset, e))?;

            if relocatable {
                if let Some(out) = out_sec {
                    let mut recs = Vec::new();
                    handler.emit_relocs(
                        r.kind,
                        out_offset + r.offset,
                        external,
                        emit_sym,
                        emit_sect,
                        emit_pos,
                        out_offset,
                        r.addend,
                        &mut recs,
                    );
                    for rec in recs {
                        result.section_relocs.push((out, rec));
                    }
                }
            }
        }
        arena.get_mut(id).data = data;
    }

    diags.log("applied relocations");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{ElfClass, Endian, SHF_ALLOC, SHF_EXECINSTR};
    use crate::resolve::{Symbol, SymType};
    use crate::sections::{ContentType, Perms, Reference, RelocKind, Section, SectionId};
    use crate::target::arm::{ARM_B24, MODE_ARM_CODE, POINTER32};
    use crate::target::x86_64::R_X86_64_PC32;

    fn empty_tables() -> DynTables {
        DynTables {
            class: ElfClass::Elf64,
            endian: Endian::Little,
            got_slots: Default::default(),
            plt_slots: Default::default(),
            dynsyms: Vec::new(),
            got_va: 0,
            gotplt_va: 0,
            plt_va: 0,
            plt_header: 0,
            plt_entry: 16,
            is_dynamic: false,
        }
    }

    fn code(arena: &mut SectionArena, name: &str, data: Vec<u8>, va: u64) -> SectionId {
        let size = data.len() as u64;
        let id = arena.add(Section {
            name: name.into(),
            file: 0,
            data,
            size,
            content: ContentType::Code,
            perms: Perms::Rx,
            align: 4,
            flags: SHF_ALLOC | SHF_EXECINSTR,
            refs: Vec::new(),
            live: true,
            repr: SectionId(0),
            out_sec: Some(0),
            out_offset: 0,
            va: 0,
        });
        arena.get_mut(id).va = va;
        id
    }

    #[test]
    fn pc32_fixup_through_symbol_slot() {
        let mut arena = SectionArena::new();
        arena.add_file("t.o");
        let caller = code(&mut arena, ".text.a", vec![0xe8, 0, 0, 0, 0], 0x1000);
        let callee = code(&mut arena, ".text.b", vec![0xc3], 0x2000);
        let mut symtab = SymbolTable::new();
        let mut diags = DiagSink::new(false);
        let f = symtab.add(
            Symbol {
                name: "f".into(),
                binding: Binding::Global,
                visibility: 0,
                ty: SymType::Func,
                size: 1,
                body: Body::Regular { section: callee, value: 0 },
                file: 0,
                is_thumb: false,
            },
            &arena,
            &mut diags,
        );
        arena.get_mut(caller).refs.push(Reference {
            offset: 1,
            kind: RelocKind(R_X86_64_PC32),
            target: RefTarget::Sym(f),
            addend: -4,
        });
        apply_fixups(
            &mut arena,
            &symtab,
            &crate::target::x86_64::HANDLER,
            &empty_tables(),
            false,
            &mut diags,
        )
        .unwrap();
        let data = &arena.get(caller).data;
        let disp = i32::from_le_bytes(data[1..5].try_into().unwrap());
        // call rel32: target - (fixup + 4) = 0x2000 - 0x1005.
        assert_eq!(disp as i64, 0x2000 - 0x1005);
    }

    /// The fold rewrites a call to a removed section into a call to its
    /// representative.
    #[test]
    fn folded_targets_resolve_to_the_representative() {
        let mut arena = SectionArena::new();
        arena.add_file("t.o");
        let caller = code(&mut arena, ".text.a", vec![0xe8, 0, 0, 0, 0], 0x1000);
        let survivor = code(&mut arena, ".text.s", vec![0xc3], 0x2000);
        let removed = code(&mut arena, ".text.r", vec![0xc3], 0);
        arena.get_mut(removed).repr = survivor;
        arena.get_mut(removed).live = false;
        arena.get_mut(caller).refs.push(Reference {
            offset: 1,
            kind: RelocKind(R_X86_64_PC32),
            target: RefTarget::Section { section: removed, value: 0 },
            addend: -4,
        });
        let symtab = SymbolTable::new();
        let mut diags = DiagSink::new(false);
        apply_fixups(
            &mut arena,
            &symtab,
            &crate::target::x86_64::HANDLER,
            &empty_tables(),
            false,
            &mut diags,
        )
        .unwrap();
        let data = &arena.get(caller).data;
        let disp = i32::from_le_bytes(data[1..5].try_into().unwrap());
        assert_eq!(disp as i64, 0x2000 - 0x1005);
    }

    /// ARM caller, Thumb callee: the branch displacement uses the cleared
    /// address, and the pointer form restores the bit.
    #[test]
    fn thumb_bit_discipline_end_to_end() {
        let mut arena = SectionArena::new();
        arena.add_file("t.o");
        let caller = code(&mut arena, ".text.c", 0xeb00_0000u32.to_le_bytes().to_vec(), 0x4000);
        let callee = code(&mut arena, ".text.t", vec![0x70, 0x47], 0x8000);
        let ptr = code(&mut arena, ".text.p", vec![0; 4], 0x9000);
        let mut symtab = SymbolTable::new();
        let mut diags = DiagSink::new(false);
        let f = symtab.add(
            Symbol {
                name: "tfunc".into(),
                binding: Binding::Global,
                visibility: 0,
                ty: SymType::Func,
                size: 2,
                body: Body::Regular { section: callee, value: 0 },
                file: 0,
                is_thumb: true,
            },
            &arena,
            &mut diags,
        );
        arena.get_mut(caller).refs.push(Reference {
            offset: 0,
            kind: MODE_ARM_CODE,
            target: RefTarget::Section { section: caller, value: 0 },
            addend: 0,
        });
        arena.get_mut(caller).refs.push(Reference {
            offset: 0,
            kind: ARM_B24,
            target: RefTarget::Sym(f),
            addend: 0,
        });
        arena.get_mut(ptr).refs.push(Reference {
            offset: 0,
            kind: POINTER32,
            target: RefTarget::Sym(f),
            addend: 0,
        });
        apply_fixups(
            &mut arena,
            &symtab,
            &crate::target::arm::HANDLER,
            &empty_tables(),
            false,
            &mut diags,
        )
        .unwrap();
        let call = u32::from_le_bytes(arena.get(caller).data[0..4].try_into().unwrap());
        // (0x8000 - (0x4000 + 8)) >> 2, low bit of the target cleared.
        assert_eq!(call & 0x00ff_ffff, 0xffe);
        let stored = u32::from_le_bytes(arena.get(ptr).data[0..4].try_into().unwrap());
        assert_eq!(stored, 0x8001);
    }

    #[test]
    fn relocatable_externals_store_addend_only() {
        let mut arena = SectionArena::new();
        arena.add_file("t.o");
        let caller = code(&mut arena, ".text.a", vec![0xe8, 0, 0, 0, 0], 0x1000);
        let mut symtab = SymbolTable::new();
        let mut diags = DiagSink::new(false);
        let u = symtab.add(Symbol::undefined("ext", false, 0), &arena, &mut diags);
        arena.get_mut(caller).refs.push(Reference {
            offset: 1,
            kind: RelocKind(R_X86_64_PC32),
            target: RefTarget::Sym(u),
            addend: -4,
        });
        let result = apply_fixups(
            &mut arena,
            &symtab,
            &crate::target::x86_64::HANDLER,
            &empty_tables(),
            true,
            &mut diags,
        )
        .unwrap();
        let data = &arena.get(caller).data;
        let disp = i32::from_le_bytes(data[1..5].try_into().unwrap());
        assert_eq!(disp as i64, -4 - 0x1001);
        // And the record for the consumer is external and symbol-indexed.
        assert_eq!(result.section_relocs.len(), 1);
        let (out, rec) = &result.section_relocs[0];
        assert_eq!(*out, 0);
        assert!(rec.ext);
        assert_eq!(rec.sym, u.0);
        assert_eq!(rec.offset, 1);
    }
}

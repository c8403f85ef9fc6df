//! Relocatable-object and shared-library views.
//!
//! One parser covers ELF32/ELF64 in either byte order; the class and
//! endianness stay inside this module, so everything downstream of
//! registration works in width-agnostic terms (u64 addresses, section ids,
//! symbol slots).

use std::collections::{HashMap, HashSet};

use crate::diag::DiagSink;
use crate::elf::*;
use crate::resolve::{Binding, Body, Symbol, SymbolTable, SymType};
use crate::sections::{classify, RefTarget, Reference, Section, SectionArena, SectionId};
use crate::target::{DecodedTarget, RawReloc, RelocHandler};

/// The link target established by `-m` or the first object file.
#[derive(Debug, Clone, Copy)]
pub struct TargetSpec {
    pub machine: u16,
    pub class: ElfClass,
    pub endian: Endian,
    /// e_flags of the establishing object, for attribute compatibility.
    pub e_flags: u32,
}

/// Parsed input section header plus its bytes.
#[derive(Debug)]
pub struct InSection {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub size: u64,
    pub align: u64,
    pub link: u32,
    pub info: u32,
    pub data: Vec<u8>,
}

/// Parsed input symbol.
#[derive(Debug, Clone)]
pub struct InSymbol {
    pub name: String,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

impl InSymbol {
    pub fn binding(&self) -> u8 {
        self.info >> 4
    }
    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }
    pub fn is_undefined(&self) -> bool {
        self.shndx == SHN_UNDEF
    }
    pub fn is_local(&self) -> bool {
        self.binding() == STB_LOCAL
    }
}

/// A relocatable object decoded into the typed view the core consumes.
#[derive(Debug)]
pub struct ObjectView {
    pub name: String,
    pub class: ElfClass,
    pub endian: Endian,
    pub machine: u16,
    pub e_flags: u32,
    pub sections: Vec<InSection>,
    pub symbols: Vec<InSymbol>,
    /// Relocation records indexed by the section they apply to.
    pub relocs: Vec<Vec<RawReloc>>,
}

fn ident(data: &[u8], name: &str) -> Result<(ElfClass, Endian), String> {
    if data.len() < 52 {
        return Err(format!("{}: file too small for ELF header", name));
    }
    if data[0..4] != ELF_MAGIC {
        return Err(format!("{}: not an ELF file", name));
    }
    let class = match data[4] {
        ELFCLASS32 => ElfClass::Elf32,
        ELFCLASS64 => ElfClass::Elf64,
        other => return Err(format!("{}: invalid ELF class {}", name, other)),
    };
    let endian = match data[5] {
        ELFDATA2LSB => Endian::Little,
        ELFDATA2MSB => Endian::Big,
        other => return Err(format!("{}: invalid ELF data encoding {}", name, other)),
    };
    Ok((class, endian))
}

struct Shdr {
    name_idx: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
}

fn parse_shdrs(
    data: &[u8],
    name: &str,
    class: ElfClass,
    e: Endian,
) -> Result<(Vec<Shdr>, usize), String> {
    let (shoff, shentsize, shnum, shstrndx) = match class {
        ElfClass::Elf64 => (
            e.read_u64(data, 40) as usize,
            e.read_u16(data, 58) as usize,
            e.read_u16(data, 60) as usize,
            e.read_u16(data, 62) as usize,
        ),
        ElfClass::Elf32 => (
            e.read_u32(data, 32) as usize,
            e.read_u16(data, 46) as usize,
            e.read_u16(data, 48) as usize,
            e.read_u16(data, 50) as usize,
        ),
    };
    if shoff == 0 || shnum == 0 {
        return Err(format!("{}: no section headers", name));
    }
    let mut out = Vec::with_capacity(shnum);
    for i in 0..shnum {
        let off = shoff + i * shentsize;
        if off + shentsize > data.len() {
            return Err(format!("{}: section header {} out of bounds", name, i));
        }
        let s = match class {
            ElfClass::Elf64 => Shdr {
                name_idx: e.read_u32(data, off),
                sh_type: e.read_u32(data, off + 4),
                flags: e.read_u64(data, off + 8),
                addr: e.read_u64(data, off + 16),
                offset: e.read_u64(data, off + 24),
                size: e.read_u64(data, off + 32),
                link: e.read_u32(data, off + 40),
                info: e.read_u32(data, off + 44),
                align: e.read_u64(data, off + 48),
            },
            ElfClass::Elf32 => Shdr {
                name_idx: e.read_u32(data, off),
                sh_type: e.read_u32(data, off + 4),
                flags: e.read_u32(data, off + 8) as u64,
                addr: e.read_u32(data, off + 12) as u64,
                offset: e.read_u32(data, off + 16) as u64,
                size: e.read_u32(data, off + 20) as u64,
                link: e.read_u32(data, off + 24),
                info: e.read_u32(data, off + 28),
                align: e.read_u32(data, off + 32) as u64,
            },
        };
        out.push(s);
    }
    Ok((out, shstrndx))
}

fn section_bytes<'a>(data: &'a [u8], s: &Shdr, name: &str) -> Result<&'a [u8], String> {
    if s.sh_type == SHT_NOBITS || s.size == 0 {
        return Ok(&[]);
    }
    let start = s.offset as usize;
    let end = start.checked_add(s.size as usize).unwrap_or(usize::MAX);
    if end > data.len() {
        return Err(format!("{}: section data out of bounds", name));
    }
    Ok(&data[start..end])
}

fn parse_symbols(
    sym_data: &[u8],
    strtab: &[u8],
    class: ElfClass,
    e: Endian,
) -> Vec<InSymbol> {
    let entsize = class.sym_size();
    let count = sym_data.len() / entsize;
    let mut out = Vec::with_capacity(count);
    for j in 0..count {
        let off = j * entsize;
        let sym = match class {
            ElfClass::Elf64 => InSymbol {
                name: read_cstr(strtab, e.read_u32(sym_data, off) as usize),
                info: sym_data[off + 4],
                other: sym_data[off + 5],
                shndx: e.read_u16(sym_data, off + 6),
                value: e.read_u64(sym_data, off + 8),
                size: e.read_u64(sym_data, off + 16),
            },
            ElfClass::Elf32 => InSymbol {
                name: read_cstr(strtab, e.read_u32(sym_data, off) as usize),
                value: e.read_u32(sym_data, off + 4) as u64,
                size: e.read_u32(sym_data, off + 8) as u64,
                info: sym_data[off + 12],
                other: sym_data[off + 13],
                shndx: e.read_u16(sym_data, off + 14),
            },
        };
        out.push(sym);
    }
    out
}

fn parse_reloc_records(
    rel_data: &[u8],
    class: ElfClass,
    e: Endian,
    rela: bool,
) -> Vec<RawReloc> {
    let entsize = if rela { class.rela_size() } else { class.rel_size() };
    let count = rel_data.len() / entsize;
    let mut out = Vec::with_capacity(count);
    for j in 0..count {
        let off = j * entsize;
        let (offset, sym, rtype, addend) = match class {
            ElfClass::Elf64 => {
                let info = e.read_u64(rel_data, off + 8);
                let addend = if rela { Some(e.read_i64(rel_data, off + 16)) } else { None };
                (e.read_u64(rel_data, off), (info >> 32) as u32, (info & 0xffff_ffff) as u32, addend)
            }
            ElfClass::Elf32 => {
                let info = e.read_u32(rel_data, off + 4);
                let addend = if rela { Some(e.read_i32(rel_data, off + 8) as i64) } else { None };
                (e.read_u32(rel_data, off) as u64, info >> 8, info & 0xff, addend)
            }
        };
        out.push(RawReloc {
            offset,
            rtype,
            sym,
            addend,
            pcrel: false,
            length: 2,
            scattered: false,
            ext: true,
            value: 0,
        });
    }
    out
}

impl ObjectView {
    /// Parse a relocatable object file.
    pub fn parse(data: &[u8], name: &str) -> Result<ObjectView, String> {
        let (class, endian) = ident(data, name)?;
        let e = endian;
        let e_type = e.read_u16(data, 16);
        if e_type != ET_REL {
            return Err(format!("{}: not a relocatable object (type={})", name, e_type));
        }
        let machine = e.read_u16(data, 18);
        let e_flags = match class {
            ElfClass::Elf64 => e.read_u32(data, 48),
            ElfClass::Elf32 => e.read_u32(data, 36),
        };

        let (shdrs, shstrndx) = parse_shdrs(data, name, class, e)?;
        let shstrtab = if shstrndx < shdrs.len() {
            section_bytes(data, &shdrs[shstrndx], name)?.to_vec()
        } else {
            Vec::new()
        };

        let mut sections = Vec::with_capacity(shdrs.len());
        for s in &shdrs {
            sections.push(InSection {
                name: read_cstr(&shstrtab, s.name_idx as usize),
                sh_type: s.sh_type,
                flags: s.flags,
                addr: s.addr,
                size: s.size,
                align: s.align.max(1),
                link: s.link,
                info: s.info,
                data: section_bytes(data, s, name)?.to_vec(),
            });
        }

        // Symbol table and its string table.
        let mut symbols = Vec::new();
        for i in 0..sections.len() {
            if sections[i].sh_type == SHT_SYMTAB {
                let strtab_idx = sections[i].link as usize;
                let strtab: &[u8] =
                    if strtab_idx < sections.len() { &sections[strtab_idx].data } else { &[] };
                symbols = parse_symbols(&sections[i].data, strtab, class, e);
                break;
            }
        }

        // Relocations, indexed by the section they apply to.
        let mut relocs = vec![Vec::new(); sections.len()];
        for i in 0..sections.len() {
            let rela = sections[i].sh_type == SHT_RELA;
            if !rela && sections[i].sh_type != SHT_REL {
                continue;
            }
            let target = sections[i].info as usize;
            if target < relocs.len() {
                relocs[target] = parse_reloc_records(&sections[i].data, class, e, rela);
            }
        }

        Ok(ObjectView { name: name.to_string(), class, endian, machine, e_flags, sections, symbols, relocs })
    }
}

/// Validate an object against the established link target.
pub fn validate_compat(
    view: &ObjectView,
    spec: &TargetSpec,
    handler: &dyn RelocHandler,
) -> Result<(), String> {
    if view.machine != spec.machine {
        return Err(format!(
            "{}: machine type {} is incompatible with link target {}",
            view.name, view.machine, spec.machine
        ));
    }
    if view.class != spec.class {
        return Err(format!("{}: ELF class does not match the link target", view.name));
    }
    if view.endian != spec.endian {
        return Err(format!("{}: endianness does not match the link target", view.name));
    }
    handler.validate_flags(&view.name, view.e_flags, spec.e_flags)
}

fn to_binding(b: u8) -> Binding {
    match b {
        STB_WEAK => Binding::Weak,
        STB_LOCAL => Binding::Local,
        _ => Binding::Global,
    }
}

fn to_sym_type(t: u8) -> SymType {
    match t {
        STT_OBJECT => SymType::Object,
        STT_FUNC => SymType::Func,
        STT_GNU_IFUNC => SymType::IFunc,
        STT_TLS => SymType::Tls,
        STT_SECTION => SymType::Section,
        STT_FILE => SymType::File,
        _ => SymType::NoType,
    }
}

/// Linkable (allocatable or debug/metadata we keep) section filter.
fn is_linkable(sec: &InSection) -> bool {
    if sec.flags & SHF_EXCLUDE != 0 {
        return false;
    }
    !matches!(
        sec.sh_type,
        SHT_NULL | SHT_SYMTAB | SHT_STRTAB | SHT_RELA | SHT_REL | SHT_GROUP
    ) && !sec.name.is_empty()
}

/// Feed one parsed object into the arena and symbol table. Returns the ids
/// of the sections created, in input order.
pub fn register_object(
    view: &ObjectView,
    arena: &mut SectionArena,
    symtab: &mut SymbolTable,
    handler: &dyn RelocHandler,
    comdat_seen: &mut HashSet<String>,
    diags: &mut DiagSink,
) -> Result<Vec<SectionId>, String> {
    let file = arena.add_file(&view.name);

    // COMDAT group dedup: a group whose signature was already seen drops all
    // of its member sections.
    let mut skipped: HashSet<usize> = HashSet::new();
    for sec in view.sections.iter() {
        if sec.sh_type != SHT_GROUP || sec.data.len() < 4 {
            continue;
        }
        let e = view.endian;
        let grp_flags = e.read_u32(&sec.data, 0);
        if grp_flags & 1 == 0 {
            continue;
        }
        let signature = view
            .symbols
            .get(sec.info as usize)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let fresh = comdat_seen.insert(signature);
        if !fresh {
            for k in (4..sec.data.len()).step_by(4) {
                skipped.insert(e.read_u32(&sec.data, k) as usize);
            }
        }
    }

    // Sections first, so symbols and references can point at them.
    let mut sec_ids: HashMap<usize, SectionId> = HashMap::new();
    let mut created = Vec::new();
    for (idx, sec) in view.sections.iter().enumerate() {
        if !is_linkable(sec) || skipped.contains(&idx) {
            continue;
        }
        let (content, perms) = classify(&sec.name, sec.sh_type, sec.flags);
        let id = arena.add(Section {
            name: sec.name.clone(),
            file,
            data: sec.data.clone(),
            size: sec.size,
            content,
            perms,
            align: sec.align,
            flags: sec.flags,
            refs: Vec::new(),
            live: true,
            repr: SectionId(0),
            out_sec: None,
            out_offset: 0,
            va: 0,
        });
        sec_ids.insert(idx, id);
        created.push(id);
    }

    // Symbols: locals stay per-object, globals and weaks enter the table.
    let is_arm = view.machine == EM_ARM;
    let mut slot_of: Vec<Option<crate::resolve::SlotId>> = vec![None; view.symbols.len()];
    for (idx, sym) in view.symbols.iter().enumerate() {
        if sym.is_local() || sym.name.is_empty() {
            continue;
        }
        if sym.sym_type() == STT_FILE || sym.sym_type() == STT_SECTION {
            continue;
        }
        let weak = sym.binding() == STB_WEAK;
        let mut value = sym.value;
        let mut is_thumb = false;
        if is_arm && sym.sym_type() == STT_FUNC && value & 1 != 0 {
            value &= !1;
            is_thumb = true;
        }
        let body = match sym.shndx {
            SHN_UNDEF => Body::Undefined { can_keep: false, weak },
            SHN_ABS => Body::Absolute { value },
            SHN_COMMON => Body::Common { size: sym.size, align: sym.value.max(1) },
            shndx => match sec_ids.get(&(shndx as usize)) {
                Some(&id) => Body::Regular { section: id, value },
                // Defined in a section we dropped (COMDAT loser or
                // non-linkable): treat as undefined so another copy wins.
                None => Body::Undefined { can_keep: false, weak: true },
            },
        };
        let slot = symtab.add(
            Symbol {
                name: sym.name.clone(),
                binding: to_binding(sym.binding()),
                visibility: sym.other & 0x3,
                ty: to_sym_type(sym.sym_type()),
                size: sym.size,
                body,
                file,
                is_thumb,
            },
            arena,
            diags,
        );
        slot_of[idx] = Some(slot);
    }

    // References: decode each section's relocation records.
    for (idx, raws) in view.relocs.iter().enumerate() {
        if raws.is_empty() {
            continue;
        }
        let Some(&sec_id) = sec_ids.get(&idx) else { continue };
        let bytes = &view.sections[idx].data;
        let sec_size = view.sections[idx].size;
        let mut refs: Vec<Reference> = Vec::with_capacity(raws.len());
        let mut i = 0;
        while i < raws.len() {
            let d = handler.decode_one(raws, i, bytes).map_err(|e| format!("{}: {} in {}", view.name, e, view.sections[idx].name))?;
            i += d.consumed;
            let footprint = handler.footprint(d.kind);
            if d.offset + footprint > sec_size {
                return Err(format!(
                    "{}: relocation at {:#x} runs past the end of {}",
                    view.name, d.offset, view.sections[idx].name
                ));
            }
            let (target, addend) = match d.target {
                DecodedTarget::Symbol(sym_idx) => {
                    let sym = view.symbols.get(sym_idx as usize).ok_or_else(|| {
                        format!("{}: invalid symbol index {} in relocation", view.name, sym_idx)
                    })?;
                    match slot_of.get(sym_idx as usize).copied().flatten() {
                        Some(slot) => (RefTarget::Sym(slot), d.addend),
                        None => {
                            // Local or section symbol: the edge points into a
                            // section directly.
                            let shndx = sym.shndx as usize;
                            // Edges into dropped sections (COMDAT losers,
                            // debug refs) are not fixups we apply.
                            let Some(&tid) = sec_ids.get(&shndx) else { continue };
                            let mut value = sym.value;
                            if is_arm && sym.sym_type() == STT_FUNC {
                                value &= !1;
                            }
                            (RefTarget::Section { section: tid, value }, d.addend)
                        }
                    }
                }
                DecodedTarget::Address(a) => {
                    // Scattered records name a spot in the file image; find
                    // the section that spans it.
                    let mut found = None;
                    for (j, s) in view.sections.iter().enumerate() {
                        if !sec_ids.contains_key(&j) {
                            continue;
                        }
                        if a >= s.addr && a < s.addr + s.size.max(1) {
                            found = Some((sec_ids[&j], a - s.addr));
                            break;
                        }
                    }
                    match found {
                        Some((tid, value)) => (RefTarget::Section { section: tid, value }, d.addend),
                        None => {
                            return Err(format!(
                                "{}: scattered relocation target {:#x} is outside every section",
                                view.name, a
                            ))
                        }
                    }
                }
            };
            refs.push(Reference { offset: d.offset, kind: d.kind, target, addend });
        }

        arena.get_mut(sec_id).refs = refs;
    }

    // ARM instruction-mode pseudo-references, from mapping symbols when
    // present and from function symbols' interworking bits otherwise.
    if is_arm {
        use crate::target::arm::{MODE_ARM_CODE, MODE_THUMB_CODE};
        let mut mode_refs: HashMap<usize, Vec<(u64, bool)>> = HashMap::new();
        for sym in &view.symbols {
            let shndx = sym.shndx as usize;
            if !sec_ids.contains_key(&shndx) {
                continue;
            }
            let base = sym.name.split('.').next().unwrap_or("");
            if sym.is_local() && (base == "$t" || base == "$a") {
                mode_refs.entry(shndx).or_default().push((sym.value, base == "$t"));
            } else if sym.sym_type() == STT_FUNC {
                mode_refs.entry(shndx).or_default().push((sym.value & !1, sym.value & 1 != 0));
            }
        }
        for (shndx, mut modes) in mode_refs {
            let id = sec_ids[&shndx];
            modes.sort_by_key(|&(off, _)| off);
            modes.dedup_by_key(|&mut (off, _)| off);
            let sec = arena.get_mut(id);
            for (off, thumb) in modes {
                sec.refs.push(Reference {
                    offset: off,
                    kind: if thumb { MODE_THUMB_CODE } else { MODE_ARM_CODE },
                    target: RefTarget::Section { section: id, value: off },
                    addend: 0,
                });
            }
        }
    }

    // Mode toggles sort ahead of fixups at the same offset.
    for &id in &created {
        let sec = arena.get_mut(id);
        sec.refs.sort_by_key(|r| (r.offset, handler.footprint(r.kind)));
    }

    Ok(created)
}

/// One exported symbol of a shared library.
#[derive(Debug)]
pub struct SharedView {
    pub name: String,
    pub soname: String,
    pub machine: u16,
    pub symbols: Vec<InSymbol>,
}

impl SharedView {
    /// Parse the dynamic symbols of a shared library named on the link line.
    pub fn parse(data: &[u8], name: &str) -> Result<SharedView, String> {
        let (class, endian) = ident(data, name)?;
        let e = endian;
        let e_type = e.read_u16(data, 16);
        if e_type != ET_DYN {
            return Err(format!("{}: not a shared library (type={})", name, e_type));
        }
        let machine = e.read_u16(data, 18);
        let (shdrs, _) = parse_shdrs(data, name, class, e)?;

        let mut sections = Vec::with_capacity(shdrs.len());
        for s in &shdrs {
            sections.push((s.sh_type, section_bytes(data, s, name)?.to_vec(), s.link));
        }

        // Exported symbols from .dynsym.
        let mut symbols = Vec::new();
        for (sh_type, sec_data, link) in &sections {
            if *sh_type != SHT_DYNSYM {
                continue;
            }
            let strtab: &[u8] =
                if (*link as usize) < sections.len() { &sections[*link as usize].1 } else { &[] };
            symbols = parse_symbols(sec_data, strtab, class, e)
                .into_iter()
                .filter(|s| !s.is_undefined() && !s.name.is_empty() && !s.is_local())
                .collect();
            break;
        }

        // SONAME from .dynamic, defaulting to the file name.
        let mut soname = name.rsplit('/').next().unwrap_or(name).to_string();
        for (sh_type, sec_data, link) in &sections {
            if *sh_type != SHT_DYNAMIC {
                continue;
            }
            let strtab: &[u8] =
                if (*link as usize) < sections.len() { &sections[*link as usize].1 } else { &[] };
            let entsize = match class {
                ElfClass::Elf64 => 16,
                ElfClass::Elf32 => 8,
            };
            let mut pos = 0;
            while pos + entsize <= sec_data.len() {
                let (tag, val) = match class {
                    ElfClass::Elf64 => (e.read_i64(sec_data, pos), e.read_u64(sec_data, pos + 8)),
                    ElfClass::Elf32 => {
                        (e.read_i32(sec_data, pos) as i64, e.read_u32(sec_data, pos + 4) as u64)
                    }
                };
                if tag == DT_NULL {
                    break;
                }
                if tag == DT_SONAME {
                    soname = read_cstr(strtab, val as usize);
                }
                pos += entsize;
            }
            break;
        }

        Ok(SharedView { name: name.to_string(), soname, machine, symbols })
    }
}

/// Register a shared library's exports. Returns false if its SONAME was
/// already seen (the library is skipped entirely).
pub fn register_shared(
    view: &SharedView,
    arena: &mut SectionArena,
    symtab: &mut SymbolTable,
    diags: &mut DiagSink,
) -> bool {
    if symtab.shared_libs.contains(&view.soname) {
        return false;
    }
    symtab.shared_libs.push(view.soname.clone());
    let lib = symtab.shared_libs.len() - 1;
    let file = arena.add_file(&view.name);
    for sym in &view.symbols {
        symtab.add(
            Symbol {
                name: sym.name.clone(),
                binding: to_binding(sym.binding()),
                visibility: sym.other & 0x3,
                ty: to_sym_type(sym.sym_type()),
                size: sym.size,
                body: Body::Shared { lib, value: sym.value, size: sym.size },
                file,
                is_thumb: false,
            },
            arena,
            diags,
        );
    }
    true
}

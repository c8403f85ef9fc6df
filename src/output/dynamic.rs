//! GOT/PLT slot bookkeeping and dynamic-section emission.
//!
//! The demand scan walks every reference on every live section and assigns
//! GOT and PLT slots; `plan` sizes the synthetic tables before addresses
//! exist, `finalize` fills their bytes once they do. Static links with no
//! shared inputs get at most a GOT.

use std::collections::HashMap;

use crate::elf::*;
use crate::output::layout::{Layout, OutputSection};
use crate::resolve::{Body, SlotId, SymbolTable};
use crate::sections::{Perms, SectionArena};
use crate::target::{Demand, RelocHandler};

/// Options that shape the dynamic tables.
pub struct DynOptions {
    pub shared_output: bool,
    pub dynamic_linker: Option<String>,
    pub soname: Option<String>,
    pub rpaths: Vec<String>,
    pub use_runpath: bool,
    pub init_sym: String,
    pub fini_sym: String,
}

pub struct DynTables {
    pub class: ElfClass,
    pub endian: Endian,
    pub got_slots: HashMap<SlotId, u32>,
    pub plt_slots: HashMap<SlotId, u32>,
    /// Slots exported or imported through .dynsym, in emission order.
    pub dynsyms: Vec<SlotId>,
    pub got_va: u64,
    pub gotplt_va: u64,
    pub plt_va: u64,
    pub plt_header: u64,
    pub plt_entry: u64,
    pub is_dynamic: bool,
}

impl DynTables {
    fn ptr(&self) -> u64 {
        match self.class {
            ElfClass::Elf64 => 8,
            ElfClass::Elf32 => 4,
        }
    }

    /// VA of a symbol's GOT slot.
    pub fn got_va_of(&self, slot: SlotId) -> Option<u64> {
        self.got_slots.get(&slot).map(|&i| self.got_va + (i as u64) * self.ptr())
    }

    /// VA of a symbol's PLT stub.
    pub fn plt_va_of(&self, slot: SlotId) -> Option<u64> {
        self.plt_slots.get(&slot).map(|&i| self.plt_va + self.plt_header + i as u64 * self.plt_entry)
    }

    /// VA of a symbol's .got.plt cell.
    pub fn got_plt_va_of(&self, slot: SlotId) -> Option<u64> {
        self.plt_slots.get(&slot).map(|&i| self.gotplt_va + (3 + i as u64) * self.ptr())
    }

    /// Range-extension thunks share the PLT address space.
    pub fn thunk_va_of(&self, slot: SlotId) -> Option<u64> {
        self.plt_va_of(slot)
    }
}

fn jmp_slot_type(machine: u16) -> u32 {
    match machine {
        EM_X86_64 | EM_386 => 7,
        EM_ARM => 22,
        EM_AARCH64 => 1026,
        EM_PPC64 => 21,
        EM_HEXAGON => 34,
        _ => 0,
    }
}

fn glob_dat_type(machine: u16) -> u32 {
    match machine {
        EM_X86_64 | EM_386 => 6,
        EM_ARM => 21,
        EM_AARCH64 => 1025,
        EM_PPC64 => 20,
        EM_HEXAGON => 33,
        _ => 0,
    }
}

/// Scan reference demands, allocate slots, and append the synthetic table
/// sections to the layout with their final sizes.
pub fn plan(
    layout: &mut Layout,
    arena: &SectionArena,
    symtab: &SymbolTable,
    handler: &dyn RelocHandler,
    class: ElfClass,
    endian: Endian,
    opts: &DynOptions,
) -> DynTables {
    let mut tables = DynTables {
        class,
        endian,
        got_slots: HashMap::new(),
        plt_slots: HashMap::new(),
        dynsyms: Vec::new(),
        got_va: 0,
        gotplt_va: 0,
        plt_va: 0,
        plt_header: handler.plt_template().header.len() as u64,
        plt_entry: handler.plt_template().entry.len() as u64,
        is_dynamic: opts.shared_output || !symtab.shared_libs.is_empty(),
    };
    if tables.plt_entry == 0 {
        tables.plt_entry = 16;
    }

    // Demand scan over live sections.
    let mut wants_dynsym: Vec<SlotId> = Vec::new();
    for id in arena.ids() {
        let sec = arena.get(id);
        if !sec.live {
            continue;
        }
        for r in &sec.refs {
            let crate::sections::RefTarget::Sym(slot) = r.target else { continue };
            let shared = matches!(symtab.get(slot).body, Body::Shared { .. });
            match handler.demand(r.kind) {
                Demand::Got => {
                    let next = tables.got_slots.len() as u32 + 3;
                    tables.got_slots.entry(slot).or_insert(next);
                    if shared {
                        wants_dynsym.push(slot);
                    }
                }
                Demand::Plt if shared => {
                    let next = tables.plt_slots.len() as u32;
                    tables.plt_slots.entry(slot).or_insert(next);
                    wants_dynsym.push(slot);
                }
                _ => {
                    if shared {
                        let next = tables.got_slots.len() as u32 + 3;
                        tables.got_slots.entry(slot).or_insert(next);
                        wants_dynsym.push(slot);
                    }
                }
            }
        }
    }

    // Shared output exports every defined global.
    if opts.shared_output {
        for slot in symtab.ids() {
            let sym = symtab.get(slot);
            if sym.visibility == 0
                && matches!(sym.body, Body::Regular { .. } | Body::Absolute { .. })
            {
                wants_dynsym.push(slot);
            }
        }
    }
    wants_dynsym.sort();
    wants_dynsym.dedup();
    tables.dynsyms = wants_dynsym;

    let ptr = tables.ptr();
    if !tables.got_slots.is_empty() || tables.is_dynamic {
        let mut got = OutputSection::synthetic(".got", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, Perms::Rw, ptr);
        got.size = (3 + tables.got_slots.len() as u64) * ptr;
        got.file_size = got.size;
        layout.sections.push(got);
    }
    if !tables.plt_slots.is_empty() {
        let mut plt = OutputSection::synthetic(".plt", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, Perms::Rx, 16);
        plt.size = tables.plt_header + tables.plt_slots.len() as u64 * tables.plt_entry;
        plt.file_size = plt.size;
        layout.sections.push(plt);
        let mut gotplt =
            OutputSection::synthetic(".got.plt", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, Perms::Rw, ptr);
        gotplt.size = (3 + tables.plt_slots.len() as u64) * ptr;
        gotplt.file_size = gotplt.size;
        layout.sections.push(gotplt);
    }

    if tables.is_dynamic {
        let nsyms = tables.dynsyms.len() + 1;
        let sym_size = class.sym_size() as u64;
        let rela = class.rela_size() as u64;

        if let Some(interp) = &opts.dynamic_linker {
            if !opts.shared_output {
                let mut s =
                    OutputSection::synthetic(".interp", SHT_PROGBITS, SHF_ALLOC, Perms::R, 1);
                s.data = interp.as_bytes().to_vec();
                s.data.push(0);
                s.size = s.data.len() as u64;
                s.file_size = s.size;
                layout.sections.push(s);
            }
        }

        let nbucket = (nsyms as u64).max(1);
        let mut hash = OutputSection::synthetic(".hash", SHT_HASH, SHF_ALLOC, Perms::R, 4);
        hash.size = 4 * (2 + nbucket + nsyms as u64);
        hash.file_size = hash.size;
        layout.sections.push(hash);

        let mut dynsym = OutputSection::synthetic(".dynsym", SHT_DYNSYM, SHF_ALLOC, Perms::R, ptr);
        dynsym.size = nsyms as u64 * sym_size;
        dynsym.file_size = dynsym.size;
        layout.sections.push(dynsym);

        // Sized exactly in finalize; reserve worst case now.
        let mut strsz = 1u64;
        for &s in &tables.dynsyms {
            strsz += symtab.get(s).name.len() as u64 + 1;
        }
        for lib in &symtab.shared_libs {
            strsz += lib.len() as u64 + 1;
        }
        if let Some(soname) = &opts.soname {
            strsz += soname.len() as u64 + 1;
        }
        for r in &opts.rpaths {
            strsz += r.len() as u64 + 2;
        }
        let mut dynstr = OutputSection::synthetic(".dynstr", SHT_STRTAB, SHF_ALLOC, Perms::R, 1);
        dynstr.size = strsz;
        dynstr.file_size = strsz;
        layout.sections.push(dynstr);

        if !tables.got_slots.is_empty() {
            let mut rd = OutputSection::synthetic(".rela.dyn", SHT_RELA, SHF_ALLOC, Perms::R, ptr);
            rd.size = tables.got_slots.len() as u64 * rela;
            rd.file_size = rd.size;
            layout.sections.push(rd);
        }
        if !tables.plt_slots.is_empty() {
            let mut rp = OutputSection::synthetic(".rela.plt", SHT_RELA, SHF_ALLOC, Perms::R, ptr);
            rp.size = tables.plt_slots.len() as u64 * rela;
            rp.file_size = rp.size;
            layout.sections.push(rp);
        }

        let tag_count = 16
            + symtab.shared_libs.len() as u64
            + opts.soname.is_some() as u64
            + !opts.rpaths.is_empty() as u64;
        let mut dynamic =
            OutputSection::synthetic(".dynamic", SHT_DYNAMIC, SHF_ALLOC | SHF_WRITE, Perms::Rw, ptr);
        dynamic.size = tag_count * 2 * ptr;
        dynamic.file_size = dynamic.size;
        layout.sections.push(dynamic);
    }

    tables
}

fn push_word(e: Endian, class: ElfClass, out: &mut Vec<u8>, v: u64) {
    match class {
        ElfClass::Elf64 => e.push_u64(out, v),
        ElfClass::Elf32 => e.push_u32(out, v as u32),
    }
}

fn push_dyn(e: Endian, class: ElfClass, out: &mut Vec<u8>, tag: i64, val: u64) {
    push_word(e, class, out, tag as u64);
    push_word(e, class, out, val);
}

fn push_sym(
    e: Endian,
    class: ElfClass,
    out: &mut Vec<u8>,
    name: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
) {
    match class {
        ElfClass::Elf64 => {
            e.push_u32(out, name);
            out.push(info);
            out.push(0);
            e.push_u16(out, shndx);
            e.push_u64(out, value);
            e.push_u64(out, size);
        }
        ElfClass::Elf32 => {
            e.push_u32(out, name);
            e.push_u32(out, value as u32);
            e.push_u32(out, size as u32);
            out.push(info);
            out.push(0);
            e.push_u16(out, shndx);
        }
    }
}

/// Fill every synthetic table now that addresses exist.
pub fn finalize(
    layout: &mut Layout,
    arena: &SectionArena,
    symtab: &SymbolTable,
    tables: &mut DynTables,
    handler: &dyn RelocHandler,
    opts: &DynOptions,
) {
    let e = tables.endian;
    let class = tables.class;
    let ptr = tables.ptr();
    let machine = handler.machine();

    tables.got_va = layout.find(".got").map(|i| layout.sections[i].va).unwrap_or(0);
    tables.plt_va = layout.find(".plt").map(|i| layout.sections[i].va).unwrap_or(0);
    tables.gotplt_va = layout.find(".got.plt").map(|i| layout.sections[i].va).unwrap_or(0);
    let dynamic_va = layout.find(".dynamic").map(|i| layout.sections[i].va).unwrap_or(0);

    // Dynsym emission order and indices (0 is the null entry).
    let dyn_index: HashMap<SlotId, u32> = tables
        .dynsyms
        .iter()
        .enumerate()
        .map(|(i, &s)| (s, i as u32 + 1))
        .collect();

    // .dynstr
    let mut dynstr = StringTable::new();
    for &slot in &tables.dynsyms {
        dynstr.add(&symtab.get(slot).name);
    }
    for lib in &symtab.shared_libs {
        dynstr.add(lib);
    }
    if let Some(soname) = &opts.soname {
        dynstr.add(soname);
    }
    let rpath_joined = opts.rpaths.join(":");
    if !rpath_joined.is_empty() {
        dynstr.add(&rpath_joined);
    }

    // .dynsym
    let mut dynsym_bytes = vec![0u8; class.sym_size()];
    for &slot in &tables.dynsyms {
        let sym = symtab.get(slot);
        let (shndx, value) = match &sym.body {
            Body::Regular { .. } | Body::Absolute { .. } | Body::Synthetic { .. } => {
                (1u16, symtab.get_va(arena, slot, 0).unwrap_or(0))
            }
            _ => (SHN_UNDEF, 0),
        };
        let bind = match sym.binding {
            crate::resolve::Binding::Weak => STB_WEAK,
            _ => STB_GLOBAL,
        };
        let ty = match sym.ty {
            crate::resolve::SymType::Func => STT_FUNC,
            crate::resolve::SymType::Object => STT_OBJECT,
            crate::resolve::SymType::Tls => STT_TLS,
            crate::resolve::SymType::IFunc => STT_GNU_IFUNC,
            _ => STT_NOTYPE,
        };
        push_sym(
            e,
            class,
            &mut dynsym_bytes,
            dynstr.get_offset(&sym.name) as u32,
            (bind << 4) | ty,
            shndx,
            value,
            sym.size,
        );
    }

    // .hash: one bucket per symbol keeps chains trivial and lookup exact.
    let nsyms = tables.dynsyms.len() + 1;
    let nbucket = nsyms.max(1);
    let mut buckets = vec![0u32; nbucket];
    let mut chains = vec![0u32; nsyms];
    for (i, &slot) in tables.dynsyms.iter().enumerate() {
        let idx = i as u32 + 1;
        let b = (sysv_hash(symtab.get(slot).name.as_bytes()) as usize) % nbucket;
        chains[idx as usize] = buckets[b];
        buckets[b] = idx;
    }
    let mut hash_bytes = Vec::new();
    e.push_u32(&mut hash_bytes, nbucket as u32);
    e.push_u32(&mut hash_bytes, nsyms as u32);
    for b in buckets {
        e.push_u32(&mut hash_bytes, b);
    }
    for c in chains {
        e.push_u32(&mut hash_bytes, c);
    }

    // .got: reserved triple then one cell per slot; locally-resolvable
    // entries hold the target address, imports stay zero for the loader.
    let mut got_bytes = Vec::new();
    push_word(e, class, &mut got_bytes, dynamic_va);
    push_word(e, class, &mut got_bytes, 0);
    push_word(e, class, &mut got_bytes, 0);
    let mut got_order: Vec<(u32, SlotId)> =
        tables.got_slots.iter().map(|(&s, &i)| (i, s)).collect();
    got_order.sort();
    for (_, slot) in &got_order {
        let va = symtab.get_va(arena, *slot, 0).unwrap_or(0);
        push_word(e, class, &mut got_bytes, va);
    }

    // .got.plt: _DYNAMIC, two loader cells, then one cell per stub
    // pointing back at the PLT header for lazy binding.
    let mut gotplt_bytes = Vec::new();
    push_word(e, class, &mut gotplt_bytes, dynamic_va);
    push_word(e, class, &mut gotplt_bytes, 0);
    push_word(e, class, &mut gotplt_bytes, 0);
    for _ in 0..tables.plt_slots.len() {
        push_word(e, class, &mut gotplt_bytes, tables.plt_va);
    }

    // .plt from the target template.
    let template = handler.plt_template();
    let mut plt_bytes = template.header.to_vec();
    for _ in 0..tables.plt_slots.len() {
        plt_bytes.extend_from_slice(template.entry);
    }

    // Relocation tables for the loader.
    let mut rela_dyn = Vec::new();
    for (i, slot) in &got_order {
        let offset = tables.got_va + *i as u64 * ptr;
        let sym = dyn_index.get(slot).copied().unwrap_or(0);
        push_rela(e, class, &mut rela_dyn, offset, glob_dat_type(machine), sym);
    }
    let mut rela_plt = Vec::new();
    let mut plt_order: Vec<(u32, SlotId)> =
        tables.plt_slots.iter().map(|(&s, &i)| (i, s)).collect();
    plt_order.sort();
    for (i, slot) in &plt_order {
        let offset = tables.gotplt_va + (3 + *i as u64) * ptr;
        let sym = dyn_index.get(slot).copied().unwrap_or(0);
        push_rela(e, class, &mut rela_plt, offset, jmp_slot_type(machine), sym);
    }

    // .dynamic
    let mut dynamic = Vec::new();
    for lib in &symtab.shared_libs {
        push_dyn(e, class, &mut dynamic, DT_NEEDED, dynstr.get_offset(lib) as u64);
    }
    if let Some(soname) = &opts.soname {
        push_dyn(e, class, &mut dynamic, DT_SONAME, dynstr.get_offset(soname) as u64);
    }
    if !rpath_joined.is_empty() {
        let tag = if opts.use_runpath { DT_RUNPATH } else { DT_RPATH };
        push_dyn(e, class, &mut dynamic, tag, dynstr.get_offset(&rpath_joined) as u64);
    }
    let find_va = |name: &str| layout.find(name).map(|i| layout.sections[i].va).unwrap_or(0);
    push_dyn(e, class, &mut dynamic, DT_HASH, find_va(".hash"));
    push_dyn(e, class, &mut dynamic, DT_STRTAB, find_va(".dynstr"));
    push_dyn(e, class, &mut dynamic, DT_SYMTAB, find_va(".dynsym"));
    push_dyn(e, class, &mut dynamic, DT_STRSZ, dynstr.as_bytes().len() as u64);
    push_dyn(e, class, &mut dynamic, DT_SYMENT, class.sym_size() as u64);
    if tables.gotplt_va != 0 {
        push_dyn(e, class, &mut dynamic, DT_PLTGOT, tables.gotplt_va);
    }
    if !rela_plt.is_empty() {
        push_dyn(e, class, &mut dynamic, DT_PLTRELSZ, rela_plt.len() as u64);
        push_dyn(e, class, &mut dynamic, DT_PLTREL, DT_RELA as u64);
        push_dyn(e, class, &mut dynamic, DT_JMPREL, find_va(".rela.plt"));
    }
    if !rela_dyn.is_empty() {
        push_dyn(e, class, &mut dynamic, DT_RELA, find_va(".rela.dyn"));
        push_dyn(e, class, &mut dynamic, DT_RELASZ, rela_dyn.len() as u64);
        push_dyn(e, class, &mut dynamic, DT_RELAENT, class.rela_size() as u64);
    }
    if let Some(slot) = symtab.lookup(&opts.init_sym) {
        if let Some(va) = symtab.get_va(arena, slot, 0) {
            push_dyn(e, class, &mut dynamic, DT_INIT, va);
        }
    }
    if let Some(slot) = symtab.lookup(&opts.fini_sym) {
        if let Some(va) = symtab.get_va(arena, slot, 0) {
            push_dyn(e, class, &mut dynamic, DT_FINI, va);
        }
    }
    push_dyn(e, class, &mut dynamic, DT_NULL, 0);

    // Install the bytes. The plan reserved upper bounds, so pad up to the
    // assigned size (trailing zeros are inert in every one of these
    // tables).
    let mut install = |name: &str, bytes: Vec<u8>| {
        if let Some(i) = layout.find(name) {
            let planned = layout.sections[i].size as usize;
            let mut b = bytes;
            if b.len() < planned {
                b.resize(planned, 0);
            }
            layout.sections[i].data = b;
        }
    };
    install(".hash", hash_bytes);
    install(".dynsym", dynsym_bytes);
    install(".dynstr", dynstr.as_bytes().to_vec());
    install(".got", got_bytes);
    install(".got.plt", gotplt_bytes);
    install(".plt", plt_bytes);
    install(".rela.dyn", rela_dyn);
    install(".rela.plt", rela_plt);
    install(".dynamic", dynamic);
}

fn push_rela(e: Endian, class: ElfClass, out: &mut Vec<u8>, offset: u64, rtype: u32, sym: u32) {
    match class {
        ElfClass::Elf64 => {
            e.push_u64(out, offset);
            e.push_u64(out, ((sym as u64) << 32) | rtype as u64);
            e.push_u64(out, 0);
        }
        ElfClass::Elf32 => {
            e.push_u32(out, offset as u32);
            e.push_u32(out, (sym << 8) | (rtype & 0xff));
            e.push_u32(out, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagSink;
    use crate::resolve::{Binding, Symbol, SymType};
    use crate::sections::{RefTarget, Reference, RelocKind, Section, SectionId};
    use crate::target::x86_64::{HANDLER, R_X86_64_GOTPCREL, R_X86_64_PLT32};

    fn shared_sym(name: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            binding: Binding::Global,
            visibility: 0,
            ty: SymType::Func,
            size: 0,
            body: Body::Shared { lib: 0, value: 0x100, size: 0 },
            file: 0,
            is_thumb: false,
        }
    }

    #[test]
    fn plt_and_got_slots_from_demand_scan() {
        let mut arena = SectionArena::new();
        arena.add_file("t.o");
        let mut symtab = SymbolTable::new();
        symtab.shared_libs.push("libc.so.6".into());
        let mut diags = DiagSink::new(false);
        let puts = symtab.add(shared_sym("puts"), &arena, &mut diags);
        let environ = symtab.add(shared_sym("environ"), &arena, &mut diags);

        let sec = arena.add(Section {
            name: ".text".into(),
            file: 0,
            data: vec![0; 16],
            size: 16,
            content: crate::sections::ContentType::Code,
            perms: Perms::Rx,
            align: 4,
            flags: SHF_ALLOC | SHF_EXECINSTR,
            refs: vec![
                Reference { offset: 1, kind: RelocKind(R_X86_64_PLT32), target: RefTarget::Sym(puts), addend: -4 },
                Reference { offset: 8, kind: RelocKind(R_X86_64_GOTPCREL), target: RefTarget::Sym(environ), addend: -4 },
            ],
            live: true,
            repr: SectionId(0),
            out_sec: None,
            out_offset: 0,
            va: 0,
        });
        let _ = sec;

        let mut layout = Layout { sections: Vec::new(), base: 0, end_va: 0 };
        let opts = DynOptions {
            shared_output: false,
            dynamic_linker: Some("/lib64/ld-linux-x86-64.so.2".into()),
            soname: None,
            rpaths: Vec::new(),
            use_runpath: false,
            init_sym: "_init".into(),
            fini_sym: "_fini".into(),
        };
        let mut tables =
            plan(&mut layout, &arena, &symtab, &HANDLER, ElfClass::Elf64, Endian::Little, &opts);
        assert!(tables.is_dynamic);
        assert_eq!(tables.plt_slots.len(), 1);
        assert_eq!(tables.got_slots.len(), 1);
        assert!(layout.find(".plt").is_some());
        assert!(layout.find(".dynamic").is_some());
        assert!(layout.find(".interp").is_some());

        crate::output::layout::sort_buckets(&mut layout, &mut arena);
        crate::output::layout::assign_addresses(&mut layout, &mut arena, 0x40_0000, 0x200, true);
        finalize(&mut layout, &arena, &symtab, &mut tables, &HANDLER, &opts);

        let plt_va = tables.plt_va_of(puts).unwrap();
        assert_eq!(plt_va, tables.plt_va + 16);
        let got_va = tables.got_va_of(environ).unwrap();
        assert_eq!(got_va, tables.got_va + 3 * 8);

        // The dynamic section ends with DT_NULL and names the library.
        let dyn_idx = layout.find(".dynamic").unwrap();
        let dynamic = &layout.sections[dyn_idx].data;
        let first_tag = Endian::Little.read_u64(dynamic, 0);
        assert_eq!(first_tag, DT_NEEDED as u64);
    }
}

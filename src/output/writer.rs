//! Output-image emission: final executables/shared objects, relocatable
//! objects, and raw `--oformat binary` images.

use crate::elf::*;
use crate::output::layout::{Layout, PAGE_SIZE};
use crate::resolve::{Binding, Body, SymbolTable, SymType};
use crate::sections::{Perms, SectionArena};
use crate::target::RawReloc;

pub struct WriteSpec {
    pub class: ElfClass,
    pub endian: Endian,
    pub machine: u16,
    pub e_flags: u32,
}

/// Program headers the image needs: LOADs plus INTERP/DYNAMIC as present.
pub fn count_phdrs(layout: &Layout) -> u64 {
    let mut n = 1;
    if layout.sections.iter().any(|s| s.perms == Perms::Rw) {
        n += 1;
    }
    if layout.find(".interp").is_some() {
        n += 1;
    }
    if layout.find(".dynamic").is_some() {
        n += 1;
    }
    n
}

/// Room to reserve at the image base for the ELF and program headers.
pub fn headers_size(spec: &WriteSpec, phnum: u64) -> u64 {
    spec.class.ehdr_size() as u64 + phnum * spec.class.phdr_size() as u64
}

fn push_ehdr(
    buf: &mut Vec<u8>,
    spec: &WriteSpec,
    e_type: u16,
    entry: u64,
    phoff: u64,
    phnum: u16,
    shoff: u64,
    shnum: u16,
    shstrndx: u16,
) {
    let e = spec.endian;
    let class_byte = match spec.class {
        ElfClass::Elf64 => ELFCLASS64,
        ElfClass::Elf32 => ELFCLASS32,
    };
    let data_byte = match spec.endian {
        Endian::Little => ELFDATA2LSB,
        Endian::Big => ELFDATA2MSB,
    };
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', class_byte, data_byte, EV_CURRENT, 0]);
    buf.extend_from_slice(&[0u8; 8]);
    e.push_u16(buf, e_type);
    e.push_u16(buf, spec.machine);
    e.push_u32(buf, 1);
    match spec.class {
        ElfClass::Elf64 => {
            e.push_u64(buf, entry);
            e.push_u64(buf, phoff);
            e.push_u64(buf, shoff);
        }
        ElfClass::Elf32 => {
            e.push_u32(buf, entry as u32);
            e.push_u32(buf, phoff as u32);
            e.push_u32(buf, shoff as u32);
        }
    }
    e.push_u32(buf, spec.e_flags);
    e.push_u16(buf, spec.class.ehdr_size() as u16);
    e.push_u16(buf, if phnum == 0 { 0 } else { spec.class.phdr_size() as u16 });
    e.push_u16(buf, phnum);
    e.push_u16(buf, spec.class.shdr_size() as u16);
    e.push_u16(buf, shnum);
    e.push_u16(buf, shstrndx);
}

#[allow(clippy::too_many_arguments)]
fn push_phdr(
    buf: &mut Vec<u8>,
    spec: &WriteSpec,
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
) {
    let e = spec.endian;
    match spec.class {
        ElfClass::Elf64 => {
            e.push_u32(buf, p_type);
            e.push_u32(buf, flags);
            e.push_u64(buf, offset);
            e.push_u64(buf, vaddr);
            e.push_u64(buf, vaddr);
            e.push_u64(buf, filesz);
            e.push_u64(buf, memsz);
            e.push_u64(buf, align);
        }
        ElfClass::Elf32 => {
            e.push_u32(buf, p_type);
            e.push_u32(buf, offset as u32);
            e.push_u32(buf, vaddr as u32);
            e.push_u32(buf, vaddr as u32);
            e.push_u32(buf, filesz as u32);
            e.push_u32(buf, memsz as u32);
            e.push_u32(buf, flags);
            e.push_u32(buf, align as u32);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn push_shdr(
    buf: &mut Vec<u8>,
    spec: &WriteSpec,
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) {
    let e = spec.endian;
    match spec.class {
        ElfClass::Elf64 => {
            e.push_u32(buf, name);
            e.push_u32(buf, sh_type);
            e.push_u64(buf, flags);
            e.push_u64(buf, addr);
            e.push_u64(buf, offset);
            e.push_u64(buf, size);
            e.push_u32(buf, link);
            e.push_u32(buf, info);
            e.push_u64(buf, align);
            e.push_u64(buf, entsize);
        }
        ElfClass::Elf32 => {
            e.push_u32(buf, name);
            e.push_u32(buf, sh_type);
            e.push_u32(buf, flags as u32);
            e.push_u32(buf, addr as u32);
            e.push_u32(buf, offset as u32);
            e.push_u32(buf, size as u32);
            e.push_u32(buf, link);
            e.push_u32(buf, info);
            e.push_u32(buf, align as u32);
            e.push_u32(buf, entsize as u32);
        }
    }
}

fn perm_flags(perms: Perms) -> u32 {
    match perms {
        Perms::R => PF_R,
        Perms::Rw => PF_R | PF_W,
        Perms::Rx => PF_R | PF_X,
    }
}

/// Write a final executable or shared library image.
pub fn write_image(layout: &Layout, spec: &WriteSpec, entry: u64, shared: bool) -> Vec<u8> {
    let phnum = count_phdrs(layout);
    let hdr = headers_size(spec, phnum);

    // Segment extents: one LOAD for the read-only/executable front half
    // (headers included), one for the writable tail.
    let mut ro_end_off = hdr;
    let mut rw_start: Option<(u64, u64)> = None;
    let mut rw_file_end = 0u64;
    let mut rw_mem_end = 0u64;
    for s in &layout.sections {
        if s.perms == Perms::Rw {
            if rw_start.is_none() {
                rw_start = Some((s.file_offset, s.va));
            }
            rw_file_end = rw_file_end.max(s.file_offset + s.file_size);
            rw_mem_end = rw_mem_end.max(s.va + s.size);
        } else {
            ro_end_off = ro_end_off.max(s.file_offset + s.file_size);
        }
    }
    let rw = rw_start
        .map(|(off, va)| (off, va, rw_file_end.saturating_sub(off), rw_mem_end.saturating_sub(va)));

    let total_file: u64 = layout
        .sections
        .iter()
        .map(|s| s.file_offset + s.file_size)
        .max()
        .unwrap_or(hdr)
        .max(hdr);

    let mut buf = Vec::with_capacity(total_file as usize + 512);
    let shstr_and_headers = build_shdrs(layout, spec, total_file);
    push_ehdr(
        &mut buf,
        spec,
        if shared { ET_DYN } else { ET_EXEC },
        entry,
        spec.class.ehdr_size() as u64,
        phnum as u16,
        shstr_and_headers.shoff,
        shstr_and_headers.shnum,
        shstr_and_headers.shstrndx,
    );

    push_phdr(&mut buf, spec, PT_LOAD, PF_R | PF_X, 0, layout.base, ro_end_off, ro_end_off, PAGE_SIZE);
    if let Some((off, va, filesz, memsz)) = rw {
        push_phdr(&mut buf, spec, PT_LOAD, PF_R | PF_W, off, va, filesz, memsz, PAGE_SIZE);
    }
    if let Some(i) = layout.find(".interp") {
        let s = &layout.sections[i];
        push_phdr(&mut buf, spec, PT_INTERP, PF_R, s.file_offset, s.va, s.file_size, s.size, 1);
    }
    if let Some(i) = layout.find(".dynamic") {
        let s = &layout.sections[i];
        push_phdr(&mut buf, spec, PT_DYNAMIC, PF_R | PF_W, s.file_offset, s.va, s.file_size, s.size, 8);
    }

    // Section bodies at their assigned offsets.
    buf.resize(total_file as usize, 0);
    for s in &layout.sections {
        if s.is_zero_fill() || s.file_size == 0 {
            continue;
        }
        let start = s.file_offset as usize;
        let end = (start + s.data.len()).min(buf.len());
        buf[start..end].copy_from_slice(&s.data[..end - start]);
    }

    // Section header table at the end, for tooling.
    while buf.len() < shstr_and_headers.strtab_off as usize {
        buf.push(0);
    }
    buf.extend_from_slice(&shstr_and_headers.strtab);
    while buf.len() < shstr_and_headers.shoff as usize {
        buf.push(0);
    }
    buf.extend_from_slice(&shstr_and_headers.table);
    buf
}

struct ShdrBlock {
    strtab: Vec<u8>,
    strtab_off: u64,
    table: Vec<u8>,
    shoff: u64,
    shnum: u16,
    shstrndx: u16,
}

fn build_shdrs(layout: &Layout, spec: &WriteSpec, body_end: u64) -> ShdrBlock {
    let mut shstr = StringTable::new();
    for s in &layout.sections {
        shstr.add(&s.name);
    }
    shstr.add(".shstrtab");
    let strtab = shstr.as_bytes().to_vec();
    let strtab_off = (body_end + 7) & !7;
    let shoff = (strtab_off + strtab.len() as u64 + 7) & !7;

    let shnum = layout.sections.len() as u16 + 2;
    let shstrndx = shnum - 1;
    let mut table = Vec::new();
    push_shdr(&mut table, spec, 0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0, 0);
    for s in &layout.sections {
        let size = if s.is_zero_fill() { s.size } else { s.file_size.max(s.data.len() as u64) };
        push_shdr(
            &mut table,
            spec,
            shstr.get_offset(&s.name) as u32,
            s.sh_type,
            s.flags & (SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR | SHF_TLS),
            s.va,
            s.file_offset,
            size,
            0,
            0,
            s.align,
            0,
        );
    }
    push_shdr(
        &mut table,
        spec,
        shstr.get_offset(".shstrtab") as u32,
        SHT_STRTAB,
        0,
        0,
        strtab_off,
        strtab.len() as u64,
        0,
        0,
        1,
        0,
    );
    ShdrBlock { strtab, strtab_off, table, shoff, shnum, shstrndx }
}

/// `--oformat binary`: the raw image bytes, headers and tables omitted,
/// gaps zero-filled, padded to an 8-byte boundary.
pub fn write_binary(layout: &Layout) -> Vec<u8> {
    let mut start = u64::MAX;
    let mut end = 0u64;
    for s in &layout.sections {
        if s.is_zero_fill() || s.size == 0 {
            continue;
        }
        start = start.min(s.va);
        end = end.max(s.va + s.file_size.max(s.data.len() as u64));
    }
    if start == u64::MAX {
        return Vec::new();
    }
    let mut out = vec![0u8; (end - start) as usize];
    for s in &layout.sections {
        if s.is_zero_fill() || s.data.is_empty() {
            continue;
        }
        let off = (s.va - start) as usize;
        out[off..off + s.data.len()].copy_from_slice(&s.data);
    }
    while out.len() % 8 != 0 {
        out.push(0);
    }
    out
}

/// Write an ET_REL object: merged sections, a symbol table, and the
/// section-relocation records collected during the relocatable fixup walk.
pub fn write_relocatable(
    layout: &Layout,
    arena: &SectionArena,
    symtab: &SymbolTable,
    section_relocs: &[(usize, RawReloc)],
    spec: &WriteSpec,
) -> Vec<u8> {
    let e = spec.endian;
    let nsecs = layout.sections.len();

    // Symbol table: null, one section symbol per output section, then every
    // surviving named symbol. Slot index → table index for reloc remapping.
    let mut strtab = StringTable::new();
    let mut sym_bytes = vec![0u8; spec.class.sym_size()];
    let mut push_sym = |bytes: &mut Vec<u8>, name: u32, info: u8, shndx: u16, value: u64, size: u64| {
        match spec.class {
            ElfClass::Elf64 => {
                e.push_u32(bytes, name);
                bytes.push(info);
                bytes.push(0);
                e.push_u16(bytes, shndx);
                e.push_u64(bytes, value);
                e.push_u64(bytes, size);
            }
            ElfClass::Elf32 => {
                e.push_u32(bytes, name);
                e.push_u32(bytes, value as u32);
                e.push_u32(bytes, size as u32);
                bytes.push(info);
                bytes.push(0);
                e.push_u16(bytes, shndx);
            }
        }
    };
    for i in 0..nsecs {
        push_sym(&mut sym_bytes, 0, STT_SECTION, (i + 1) as u16, 0, 0);
    }
    let first_global = 1 + nsecs as u32;
    let mut slot_to_index = vec![0u32; symtab.len()];
    let mut next = first_global;
    for slot in symtab.ids() {
        let sym = symtab.get(slot);
        let (shndx, value) = match sym.body {
            Body::Regular { section, value } => {
                let r = arena.repr(section);
                let sec = arena.get(r);
                match sec.out_sec {
                    Some(i) => ((i + 1) as u16, sec.out_offset + value),
                    None => continue,
                }
            }
            Body::Absolute { value } => (SHN_ABS, value),
            // Tentative definitions stay tentative in relocatable output;
            // st_value carries the alignment.
            Body::Common { align, .. } => (SHN_COMMON, align),
            Body::Undefined { .. } | Body::Lazy { .. } => (SHN_UNDEF, 0),
            Body::Synthetic { .. } | Body::Bitcode | Body::Shared { .. } => continue,
        };
        let bind = match sym.binding {
            Binding::Weak => STB_WEAK,
            _ => STB_GLOBAL,
        };
        let ty = match sym.ty {
            SymType::Func => STT_FUNC,
            SymType::Object => STT_OBJECT,
            SymType::Tls => STT_TLS,
            SymType::IFunc => STT_GNU_IFUNC,
            _ => STT_NOTYPE,
        };
        let name_off = strtab.add(&sym.name) as u32;
        let size = if let Body::Common { size, .. } = sym.body { size } else { sym.size };
        push_sym(&mut sym_bytes, name_off, (bind << 4) | ty, shndx, value, size);
        slot_to_index[slot.0 as usize] = next;
        next += 1;
    }

    // Relocation section bytes per output section.
    let mut reloc_bytes: Vec<Vec<u8>> = vec![Vec::new(); nsecs];
    let mut reloc_is_rela = vec![true; nsecs];
    for &(out, rec) in section_relocs {
        let sym = if rec.ext {
            slot_to_index.get(rec.sym as usize).copied().unwrap_or(0)
        } else if rec.rtype == crate::target::arm::REL_PAIR || rec.scattered {
            rec.sym
        } else {
            rec.sym + 1
        };
        let bytes = &mut reloc_bytes[out];
        match rec.addend {
            Some(a) => {
                match spec.class {
                    ElfClass::Elf64 => {
                        e.push_u64(bytes, rec.offset);
                        e.push_u64(bytes, ((sym as u64) << 32) | rec.rtype as u64);
                        e.push_u64(bytes, a as u64);
                    }
                    ElfClass::Elf32 => {
                        e.push_u32(bytes, rec.offset as u32);
                        e.push_u32(bytes, (sym << 8) | (rec.rtype & 0xff));
                        e.push_u32(bytes, a as u32);
                    }
                }
            }
            None => {
                // Implicit-addend record; scattered forms keep their target
                // address in the info word's place.
                reloc_is_rela[out] = false;
                let word = if rec.scattered { rec.value as u32 } else { (sym << 8) | (rec.rtype & 0xff) };
                match spec.class {
                    ElfClass::Elf64 => {
                        e.push_u64(bytes, rec.offset);
                        e.push_u64(
                            bytes,
                            ((word as u64) << 32) | ((rec.length as u64) << 8) | rec.rtype as u64,
                        );
                    }
                    ElfClass::Elf32 => {
                        e.push_u32(bytes, rec.offset as u32);
                        e.push_u32(bytes, word << 8 | (rec.rtype & 0xff));
                    }
                }
            }
        }
    }

    // Assemble: null, buckets, reloc sections, symtab, strtab, shstrtab.
    let mut shstr = StringTable::new();
    for s in &layout.sections {
        shstr.add(&s.name);
    }
    let reloc_names: Vec<String> = layout
        .sections
        .iter()
        .enumerate()
        .map(|(i, s)| {
            if reloc_is_rela[i] {
                format!(".rela{}", s.name)
            } else {
                format!(".rel{}", s.name)
            }
        })
        .collect();
    for (i, n) in reloc_names.iter().enumerate() {
        if !reloc_bytes[i].is_empty() {
            shstr.add(n);
        }
    }
    shstr.add(".symtab");
    shstr.add(".strtab");
    shstr.add(".shstrtab");

    struct Out {
        name: u32,
        sh_type: u32,
        flags: u64,
        data: Vec<u8>,
        link: u32,
        info: u32,
        align: u64,
        entsize: u64,
        nobits_size: u64,
    }
    let mut outs: Vec<Out> = Vec::new();
    outs.push(Out { name: 0, sh_type: SHT_NULL, flags: 0, data: Vec::new(), link: 0, info: 0, align: 0, entsize: 0, nobits_size: 0 });
    for s in &layout.sections {
        outs.push(Out {
            name: shstr.get_offset(&s.name) as u32,
            sh_type: s.sh_type,
            flags: s.flags & (SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR | SHF_TLS),
            data: if s.is_zero_fill() { Vec::new() } else { s.data.clone() },
            link: 0,
            info: 0,
            align: s.align,
            entsize: 0,
            nobits_size: if s.is_zero_fill() { s.size } else { 0 },
        });
    }
    let nreloc_secs = reloc_bytes.iter().filter(|b| !b.is_empty()).count();
    let symtab_idx = (outs.len() + nreloc_secs) as u32;
    for (i, bytes) in reloc_bytes.iter().enumerate() {
        if bytes.is_empty() {
            continue;
        }
        outs.push(Out {
            name: shstr.get_offset(&reloc_names[i]) as u32,
            sh_type: if reloc_is_rela[i] { SHT_RELA } else { SHT_REL },
            flags: 0,
            data: bytes.clone(),
            link: symtab_idx,
            info: (i + 1) as u32,
            align: 8,
            entsize: if reloc_is_rela[i] {
                spec.class.rela_size() as u64
            } else {
                spec.class.rel_size() as u64
            },
            nobits_size: 0,
        });
    }
    let strtab_idx = symtab_idx + 1;
    outs.push(Out {
        name: shstr.get_offset(".symtab") as u32,
        sh_type: SHT_SYMTAB,
        flags: 0,
        data: sym_bytes,
        link: strtab_idx,
        info: first_global,
        align: 8,
        entsize: spec.class.sym_size() as u64,
        nobits_size: 0,
    });
    outs.push(Out {
        name: shstr.get_offset(".strtab") as u32,
        sh_type: SHT_STRTAB,
        flags: 0,
        data: strtab.as_bytes().to_vec(),
        link: 0,
        info: 0,
        align: 1,
        entsize: 0,
        nobits_size: 0,
    });
    let shstrndx = outs.len() as u16;
    outs.push(Out {
        name: shstr.get_offset(".shstrtab") as u32,
        sh_type: SHT_STRTAB,
        flags: 0,
        data: shstr.as_bytes().to_vec(),
        link: 0,
        info: 0,
        align: 1,
        entsize: 0,
        nobits_size: 0,
    });

    let mut offsets = Vec::with_capacity(outs.len());
    let mut pos = spec.class.ehdr_size();
    for o in &outs {
        pos = (pos + 7) & !7;
        offsets.push(pos);
        pos += o.data.len();
    }
    let shoff = ((pos + 7) & !7) as u64;

    let mut buf = Vec::new();
    push_ehdr(&mut buf, spec, ET_REL, 0, 0, 0, shoff, outs.len() as u16, shstrndx);
    for (o, &off) in outs.iter().zip(&offsets) {
        while buf.len() < off {
            buf.push(0);
        }
        buf.extend_from_slice(&o.data);
    }
    while buf.len() < shoff as usize {
        buf.push(0);
    }
    for (i, o) in outs.iter().enumerate() {
        let size = if o.nobits_size != 0 { o.nobits_size } else { o.data.len() as u64 };
        push_shdr(
            &mut buf,
            spec,
            o.name,
            o.sh_type,
            o.flags,
            0,
            offsets[i] as u64,
            size,
            o.link,
            o.info,
            o.align.max(1),
            o.entsize,
        );
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::layout::OutputSection;
    use crate::sections::Perms;

    fn spec() -> WriteSpec {
        WriteSpec {
            class: ElfClass::Elf64,
            endian: Endian::Little,
            machine: EM_X86_64,
            e_flags: 0,
        }
    }

    fn section(name: &str, va: u64, data: Vec<u8>) -> OutputSection {
        let mut s = OutputSection::synthetic(name, SHT_PROGBITS, SHF_ALLOC, Perms::R, 1);
        s.va = va;
        s.size = data.len() as u64;
        s.file_size = s.size;
        s.data = data;
        s
    }

    /// A nop section followed by two one-byte sections comes out as exactly
    /// the raw image bytes, zero-padded to a word.
    #[test]
    fn binary_output_bytes() {
        let layout = Layout {
            sections: vec![
                section(".text", 0, vec![0x90]),
                section(".mysec.1", 1, vec![0x11]),
                section(".mysec.2", 2, vec![0x22]),
            ],
            base: 0,
            end_va: 3,
        };
        let out = write_binary(&layout);
        assert_eq!(out, vec![0x90, 0x11, 0x22, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn image_has_elf_magic_and_entry() {
        let mut text = section(".text", 0x40_0200, vec![0x90; 16]);
        text.file_offset = 0x200;
        let layout = Layout { sections: vec![text], base: 0x40_0000, end_va: 0x40_0210 };
        let out = write_image(&layout, &spec(), 0x40_0200, false);
        assert_eq!(&out[0..4], &ELF_MAGIC);
        assert_eq!(Endian::Little.read_u16(&out, 16), ET_EXEC);
        assert_eq!(Endian::Little.read_u64(&out, 24), 0x40_0200);
        // Body landed at its file offset.
        assert_eq!(out[0x200], 0x90);
    }
}

//! Input consumption: object/shared views, archives, and the input graph.

pub mod archive;
pub mod graph;
pub mod object;

#[cfg(test)]
pub mod testelf {
    //! Builders for synthetic ELF64 objects and archives used across the
    //! test suites. Little-endian x86-64 unless a machine override is given.

    use crate::elf::*;

    pub struct RelSpec {
        pub offset: u64,
        pub rtype: u32,
        pub sym: &'static str,
        pub addend: i64,
    }

    pub struct SecSpec {
        pub name: &'static str,
        pub flags: u64,
        pub data: Vec<u8>,
        pub relocs: Vec<RelSpec>,
    }

    pub struct SymSpec {
        pub name: &'static str,
        pub binding: u8,
        /// Index into the section list, or None for undefined.
        pub section: Option<usize>,
        pub value: u64,
        pub size: u64,
    }

    pub fn sec(name: &'static str, flags: u64, data: Vec<u8>) -> SecSpec {
        SecSpec { name, flags, data, relocs: Vec::new() }
    }

    pub fn global(name: &'static str, section: usize, value: u64) -> SymSpec {
        SymSpec { name, binding: STB_GLOBAL, section: Some(section), value, size: 0 }
    }

    pub fn undef(name: &'static str) -> SymSpec {
        SymSpec { name, binding: STB_GLOBAL, section: None, value: 0, size: 0 }
    }

    /// Assemble a minimal ELF64 relocatable object.
    pub fn build_object(machine: u16, secs: &[SecSpec], syms: &[SymSpec]) -> Vec<u8> {
        let e = Endian::Little;

        let mut shstr = StringTable::new();
        let mut strtab = StringTable::new();
        for s in secs {
            shstr.add(s.name);
        }
        let rela_names: Vec<String> =
            secs.iter().map(|s| format!(".rela{}", s.name)).collect();
        for (s, rn) in secs.iter().zip(&rela_names) {
            if !s.relocs.is_empty() {
                shstr.add(rn);
            }
        }
        shstr.add(".symtab");
        shstr.add(".strtab");
        shstr.add(".shstrtab");

        // Symbol table: null entry then the declared symbols, all non-local.
        let mut symtab_bytes = vec![0u8; 24];
        let sym_index = |name: &str| -> u32 {
            syms.iter().position(|s| s.name == name).map(|i| i as u32 + 1).unwrap_or(0)
        };
        for s in syms {
            let name_off = strtab.add(s.name) as u32;
            let mut ent = Vec::with_capacity(24);
            e.push_u32(&mut ent, name_off);
            ent.push((s.binding << 4) | STT_NOTYPE);
            ent.push(0);
            let shndx = match s.section {
                Some(i) => (i + 1) as u16,
                None => SHN_UNDEF,
            };
            e.push_u16(&mut ent, shndx);
            e.push_u64(&mut ent, s.value);
            e.push_u64(&mut ent, s.size);
            symtab_bytes.extend_from_slice(&ent);
        }

        // Section bodies in file order: user sections, rela sections,
        // symtab, strtab, shstrtab.
        struct OutSec {
            name_off: u32,
            sh_type: u32,
            flags: u64,
            data: Vec<u8>,
            link: u32,
            info: u32,
            entsize: u64,
        }
        let mut out: Vec<OutSec> = Vec::new();
        out.push(OutSec {
            name_off: 0,
            sh_type: SHT_NULL,
            flags: 0,
            data: Vec::new(),
            link: 0,
            info: 0,
            entsize: 0,
        });
        for s in secs {
            out.push(OutSec {
                name_off: shstr.get_offset(s.name) as u32,
                sh_type: SHT_PROGBITS,
                flags: s.flags,
                data: s.data.clone(),
                link: 0,
                info: 0,
                entsize: 0,
            });
        }
        let symtab_idx = out.len() + secs.iter().filter(|s| !s.relocs.is_empty()).count();
        for (i, s) in secs.iter().enumerate() {
            if s.relocs.is_empty() {
                continue;
            }
            let mut bytes = Vec::new();
            for r in &s.relocs {
                e.push_u64(&mut bytes, r.offset);
                e.push_u64(&mut bytes, ((sym_index(r.sym) as u64) << 32) | r.rtype as u64);
                e.push_u64(&mut bytes, r.addend as u64);
            }
            out.push(OutSec {
                name_off: shstr.get_offset(&rela_names[i]) as u32,
                sh_type: SHT_RELA,
                flags: 0,
                data: bytes,
                link: symtab_idx as u32,
                info: (i + 1) as u32,
                entsize: 24,
            });
        }
        let strtab_idx = symtab_idx + 1;
        out.push(OutSec {
            name_off: shstr.get_offset(".symtab") as u32,
            sh_type: SHT_SYMTAB,
            flags: 0,
            data: symtab_bytes,
            link: strtab_idx as u32,
            info: 1, // one local (the null entry)
            entsize: 24,
        });
        out.push(OutSec {
            name_off: shstr.get_offset(".strtab") as u32,
            sh_type: SHT_STRTAB,
            flags: 0,
            data: strtab.as_bytes().to_vec(),
            link: 0,
            info: 0,
            entsize: 0,
        });
        let shstrndx = out.len();
        out.push(OutSec {
            name_off: shstr.get_offset(".shstrtab") as u32,
            sh_type: SHT_STRTAB,
            flags: 0,
            data: shstr.as_bytes().to_vec(),
            link: 0,
            info: 0,
            entsize: 0,
        });

        // Lay out: ehdr, section bodies, then the header table.
        let mut offsets = Vec::with_capacity(out.len());
        let mut pos = 64usize;
        for s in &out {
            pos = (pos + 7) & !7;
            offsets.push(pos);
            pos += s.data.len();
        }
        let shoff = (pos + 7) & !7;

        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', ELFCLASS64, ELFDATA2LSB, EV_CURRENT, 0]);
        buf.extend_from_slice(&[0u8; 8]);
        e.push_u16(&mut buf, ET_REL);
        e.push_u16(&mut buf, machine);
        e.push_u32(&mut buf, 1);
        e.push_u64(&mut buf, 0); // entry
        e.push_u64(&mut buf, 0); // phoff
        e.push_u64(&mut buf, shoff as u64);
        e.push_u32(&mut buf, 0); // flags
        e.push_u16(&mut buf, 64);
        e.push_u16(&mut buf, 0);
        e.push_u16(&mut buf, 0);
        e.push_u16(&mut buf, 64);
        e.push_u16(&mut buf, out.len() as u16);
        e.push_u16(&mut buf, shstrndx as u16);

        for (s, &off) in out.iter().zip(&offsets) {
            while buf.len() < off {
                buf.push(0);
            }
            buf.extend_from_slice(&s.data);
        }
        while buf.len() < shoff {
            buf.push(0);
        }
        for (i, s) in out.iter().enumerate() {
            e.push_u32(&mut buf, s.name_off);
            e.push_u32(&mut buf, s.sh_type);
            e.push_u64(&mut buf, s.flags);
            e.push_u64(&mut buf, 0); // addr
            e.push_u64(&mut buf, offsets[i] as u64);
            e.push_u64(&mut buf, s.data.len() as u64);
            e.push_u32(&mut buf, s.link);
            e.push_u32(&mut buf, s.info);
            e.push_u64(&mut buf, 1); // align
            e.push_u64(&mut buf, s.entsize);
        }
        buf
    }

    /// Wrap members into a `!<arch>` archive (no symbol index; the reader's
    /// member-scan fallback builds one).
    pub fn build_archive(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut out = b"!<arch>\n".to_vec();
        for (name, data) in members {
            let mut hdr = vec![b' '; 60];
            let n = format!("{}/", name);
            hdr[..n.len()].copy_from_slice(n.as_bytes());
            let size = format!("{}", data.len());
            hdr[48..48 + size.len()].copy_from_slice(size.as_bytes());
            hdr[58] = b'`';
            hdr[59] = b'\n';
            out.extend_from_slice(&hdr);
            out.extend_from_slice(data);
            if out.len() % 2 != 0 {
                out.push(b'\n');
            }
        }
        out
    }
}

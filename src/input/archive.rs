//! Static archives as lazy-symbol suppliers.
//!
//! An archive exposes its index as Lazy bodies; the resolver demands a
//! member when a strong undefined meets one, and the input driver parses
//! the member like any other object. Members load at most once.

use std::collections::HashSet;

use crate::elf::{parse_archive_index, parse_archive_members, ArchiveMember, ELF_MAGIC};
use crate::input::object::ObjectView;
use crate::resolve::SymbolTable;

pub struct Archive {
    pub path: String,
    pub data: Vec<u8>,
    pub members: Vec<ArchiveMember>,
    /// symbol name → member data offset.
    pub index: Vec<(String, usize)>,
    loaded: HashSet<usize>,
}

impl Archive {
    pub fn from_bytes(data: Vec<u8>, path: &str) -> Result<Archive, String> {
        let members = parse_archive_members(&data)
            .map_err(|e| format!("{}: {}", path, e))?;
        // The armap points at member headers; member_data offsets skip the
        // 60-byte header.
        let mut index: Vec<(String, usize)> = parse_archive_index(&data)
            .into_iter()
            .map(|(name, hdr_off)| (name, hdr_off + 60))
            .filter(|&(_, off)| members.iter().any(|&(_, m_off, _)| m_off == off))
            .collect();
        if index.is_empty() {
            // No symbol table; build one by scanning the members.
            for &(ref name, off, size) in &members {
                let member = &data[off..off + size];
                if member.len() < 4 || member[0..4] != ELF_MAGIC {
                    continue;
                }
                let full = format!("{}({})", path, name);
                let Ok(view) = ObjectView::parse(member, &full) else { continue };
                for sym in &view.symbols {
                    if sym.is_local() || sym.is_undefined() || sym.name.is_empty() {
                        continue;
                    }
                    index.push((sym.name.clone(), off));
                }
            }
        }
        Ok(Archive { path: path.to_string(), data, members, index, loaded: HashSet::new() })
    }

    /// Offer every index entry to the resolver as a Lazy body. `archive` is
    /// this archive's position in the driver's archive list.
    pub fn register_lazies(&self, archive: usize, file: usize, symtab: &mut SymbolTable) {
        for (name, member) in &self.index {
            symtab.add_lazy(name, archive, *member, file);
        }
    }

    /// True the first time a member is requested.
    pub fn mark_loaded(&mut self, member: usize) -> bool {
        self.loaded.insert(member)
    }

    pub fn member_bytes(&self, member: usize) -> Option<(String, &[u8])> {
        let &(ref name, off, size) = self.members.iter().find(|&&(_, off, _)| off == member)?;
        Some((format!("{}({})", self.path, name), &self.data[off..off + size]))
    }
}

//! Linker-materialized symbols.
//!
//! After addresses are assigned, well-known names that survived resolution
//! as undefined get Synthetic bodies pointing into the output image:
//! `_etext`/`_edata`/`_end`, the init/fini array bounds, the GOT anchor,
//! `_DYNAMIC`, the MIPS global pointer, and the `__start_`/`__stop_`
//! section bounds.

use crate::elf::EM_MIPS;
use crate::resolve::{Body, SymbolTable};
use crate::output::layout::Layout;
use crate::sections::Perms;

/// Names the linker provides during layout; undefined references to these
/// are not errors.
pub const LINKER_DEFINED_SYMBOLS: &[&str] = &[
    "_GLOBAL_OFFSET_TABLE_",
    "_DYNAMIC",
    "__bss_start",
    "_edata",
    "edata",
    "_end",
    "end",
    "_etext",
    "etext",
    "__ehdr_start",
    "__executable_start",
    "__init_array_start",
    "__init_array_end",
    "__fini_array_start",
    "__fini_array_end",
    "__preinit_array_start",
    "__preinit_array_end",
    "__rel_iplt_start",
    "__rel_iplt_end",
    "__rela_iplt_start",
    "__rela_iplt_end",
    "_gp",
    "__dso_handle",
];

fn is_c_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether an undefined reference to `name` will be satisfied by
/// materialization.
pub fn is_linker_defined(name: &str) -> bool {
    if LINKER_DEFINED_SYMBOLS.contains(&name) {
        return true;
    }
    if let Some(sec) = name.strip_prefix("__start_").or_else(|| name.strip_prefix("__stop_")) {
        return is_c_ident(sec);
    }
    false
}

/// Give every still-undefined well-known name its Synthetic body. Only
/// referenced names get bodies; nothing is invented for names nobody asked
/// for.
pub fn materialize(layout: &Layout, symtab: &mut SymbolTable, machine: u16) {
    let section_end = |name: &str| -> Option<(usize, u64)> {
        layout.find(name).map(|i| (i, layout.sections[i].va + layout.sections[i].size))
    };
    let section_start = |name: &str| -> Option<(usize, u64)> {
        layout.find(name).map(|i| (i, layout.sections[i].va))
    };

    // End of the last executable, last file-backed, and last allocated
    // section respectively.
    let mut etext = layout.base;
    let mut edata = layout.base;
    let mut end = layout.base;
    let mut etext_sec = 0;
    let mut edata_sec = 0;
    let mut end_sec = 0;
    for (i, s) in layout.sections.iter().enumerate() {
        let top = s.va + s.size;
        if s.perms == Perms::Rx && top > etext {
            etext = top;
            etext_sec = i;
        }
        if !s.is_zero_fill() && top > edata {
            edata = top;
            edata_sec = i;
        }
        if top > end {
            end = top;
            end_sec = i;
        }
    }

    let mut provide = |name: &str, val: Option<(usize, u64)>| {
        let Some((out_sec, va)) = val else { return };
        let Some(slot) = symtab.lookup(name) else { return };
        if matches!(symtab.get(slot).body, Body::Undefined { .. }) {
            symtab.get_mut(slot).body = Body::Synthetic { out_sec, va };
        }
    };

    provide("_etext", Some((etext_sec, etext)));
    provide("etext", Some((etext_sec, etext)));
    provide("_edata", Some((edata_sec, edata)));
    provide("edata", Some((edata_sec, edata)));
    provide("_end", Some((end_sec, end)));
    provide("end", Some((end_sec, end)));
    provide("__bss_start", section_start(".bss").or(Some((end_sec, edata))));
    provide("__ehdr_start", Some((0, layout.base)));
    provide("__executable_start", Some((0, layout.base)));
    provide("_GLOBAL_OFFSET_TABLE_", section_start(".got").or(section_start(".got.plt")));
    provide("_DYNAMIC", section_start(".dynamic"));
    provide("__dso_handle", Some((0, layout.base)));
    provide("__init_array_start", section_start(".init_array"));
    provide("__init_array_end", section_end(".init_array"));
    provide("__fini_array_start", section_start(".fini_array"));
    provide("__fini_array_end", section_end(".fini_array"));
    provide("__preinit_array_start", section_start(".preinit_array"));
    provide("__preinit_array_end", section_end(".preinit_array"));
    // No static IFUNCs means an empty run; both bounds collapse to one VA.
    let iplt = section_start(".rela.iplt").or(section_end(".got")).or(Some((0, layout.base)));
    provide("__rel_iplt_start", iplt);
    provide("__rel_iplt_end", iplt);
    provide("__rela_iplt_start", iplt);
    provide("__rela_iplt_end", iplt);

    if machine == EM_MIPS {
        // Conventional GP: 0x7ff0 past the small-data base.
        let gp = section_start(".sdata")
            .or(section_start(".got"))
            .map(|(i, va)| (i, va + 0x7ff0));
        provide("_gp", gp);
    }

    // __start_<section> / __stop_<section> for identifier-named sections.
    for (i, s) in layout.sections.iter().enumerate() {
        if !is_c_ident(&s.name) {
            continue;
        }
        provide(&format!("__start_{}", s.name), Some((i, s.va)));
        provide(&format!("__stop_{}", s.name), Some((i, s.va + s.size)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagSink;
    use crate::resolve::Symbol;
    use crate::sections::SectionArena;
    use crate::output::layout::OutputSection;

    #[test]
    fn linker_defined_names() {
        assert!(is_linker_defined("_etext"));
        assert!(is_linker_defined("__init_array_start"));
        assert!(is_linker_defined("__start_myset"));
        assert!(is_linker_defined("__stop_myset"));
        assert!(!is_linker_defined("__start_.bad"));
        assert!(!is_linker_defined("printf"));
    }

    #[test]
    fn referenced_bounds_get_bodies() {
        let arena = {
            let mut a = SectionArena::new();
            a.add_file("t.o");
            a
        };
        let mut symtab = SymbolTable::new();
        let mut diags = DiagSink::new(false);
        let etext = symtab.add(Symbol::undefined("_etext", false, 0), &arena, &mut diags);
        let start = symtab.add(Symbol::undefined("__start_myset", false, 0), &arena, &mut diags);

        let mut text = OutputSection::synthetic(".text", crate::elf::SHT_PROGBITS, 0, Perms::Rx, 4);
        text.va = 0x40_1000;
        text.size = 0x20;
        let mut myset = OutputSection::synthetic("myset", crate::elf::SHT_PROGBITS, 0, Perms::R, 4);
        myset.va = 0x40_2000;
        myset.size = 0x10;
        let layout = Layout { sections: vec![text, myset], base: 0x40_0000, end_va: 0x40_2010 };

        materialize(&layout, &mut symtab, crate::elf::EM_X86_64);
        assert_eq!(symtab.get_va(&arena, etext, 0), Some(0x40_1020));
        assert_eq!(symtab.get_va(&arena, start, 0), Some(0x40_2000));
        // Unreferenced names stay unmaterialized.
        assert!(symtab.lookup("_edata").is_none());
    }
}

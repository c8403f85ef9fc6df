//! Input graph traversal.
//!
//! The command line becomes an ordered sequence of file and group nodes.
//! Files are offered to the resolver once; a group re-offers its members
//! from the start for as long as the resolver reports progress, which is
//! what lets archives inside a `--start-group` resolve mutual references.

use std::collections::HashSet;
use std::path::Path;

use crate::diag::DiagSink;
use crate::elf::{looks_like_linker_script, parse_linker_script, ELF_MAGIC};
use crate::input::archive::Archive;
use crate::input::object::{
    register_object, register_shared, validate_compat, ObjectView, SharedView, TargetSpec,
};
use crate::resolve::SymbolTable;
use crate::sections::SectionArena;
use crate::target::{handler_for, RelocHandler};

#[derive(Debug, Clone)]
pub struct FileSpec {
    pub path: String,
    pub whole_archive: bool,
}

#[derive(Debug, Clone)]
pub enum InputNode {
    File(FileSpec),
    Group(Vec<FileSpec>),
}

/// Everything the input phase accumulates: the section arena, the symbol
/// table, registered archives, and the established link target.
pub struct Inputs {
    pub arena: SectionArena,
    pub symtab: SymbolTable,
    pub archives: Vec<Archive>,
    pub comdat: HashSet<String>,
    pub spec: Option<TargetSpec>,
    saw_object: bool,
    loaded_paths: HashSet<String>,
}

impl Inputs {
    pub fn new(spec: Option<TargetSpec>) -> Inputs {
        Inputs {
            arena: SectionArena::new(),
            symtab: SymbolTable::new(),
            archives: Vec::new(),
            comdat: HashSet::new(),
            spec,
            saw_object: false,
            loaded_paths: HashSet::new(),
        }
    }

    pub fn handler(&self) -> Result<&'static dyn RelocHandler, String> {
        let spec = self.spec.as_ref().ok_or("no input files establish a target")?;
        handler_for(spec.machine, spec.endian)
            .ok_or_else(|| format!("unsupported target machine {}", spec.machine))
    }

    fn adopt_or_validate(&mut self, view: &ObjectView) -> Result<(), String> {
        match &mut self.spec {
            None => {
                self.spec = Some(TargetSpec {
                    machine: view.machine,
                    class: view.class,
                    endian: view.endian,
                    e_flags: view.e_flags,
                });
                self.saw_object = true;
                Ok(())
            }
            Some(spec) => {
                if !self.saw_object {
                    // An emulation fixed the machine but the first object
                    // still establishes the attribute word.
                    if view.machine != spec.machine {
                        return Err(format!(
                            "{}: machine type {} is incompatible with link target {}",
                            view.name, view.machine, spec.machine
                        ));
                    }
                    spec.e_flags = view.e_flags;
                    spec.class = view.class;
                    spec.endian = view.endian;
                    self.saw_object = true;
                    Ok(())
                } else {
                    let spec = *spec;
                    let handler = self.handler()?;
                    validate_compat(view, &spec, handler)
                }
            }
        }
    }

    /// Offer a relocatable object.
    pub fn offer_object_bytes(
        &mut self,
        data: &[u8],
        name: &str,
        diags: &mut DiagSink,
    ) -> Result<(), String> {
        let view = ObjectView::parse(data, name)?;
        self.adopt_or_validate(&view)?;
        let handler = self.handler()?;
        diags.log(&format!("loading {}", name));
        register_object(&view, &mut self.arena, &mut self.symtab, handler, &mut self.comdat, diags)?;
        self.drain_pending(diags)
    }

    /// Offer a shared library.
    pub fn offer_shared_bytes(
        &mut self,
        data: &[u8],
        name: &str,
        diags: &mut DiagSink,
    ) -> Result<(), String> {
        let view = SharedView::parse(data, name)?;
        if let Some(spec) = &self.spec {
            if view.machine != spec.machine {
                return Err(format!(
                    "{}: machine type {} is incompatible with link target {}",
                    name, view.machine, spec.machine
                ));
            }
        }
        if register_shared(&view, &mut self.arena, &mut self.symtab, diags) {
            diags.log(&format!("loading shared {} (soname {})", name, view.soname));
        }
        self.drain_pending(diags)
    }

    /// Offer an archive: register (or re-register) its index as lazy
    /// bodies, or force-load every member under `--whole-archive`.
    pub fn offer_archive_bytes(
        &mut self,
        data: Vec<u8>,
        path: &str,
        whole: bool,
        diags: &mut DiagSink,
    ) -> Result<(), String> {
        let idx = match self.archives.iter().position(|a| a.path == path) {
            Some(i) => i,
            None => {
                let ar = Archive::from_bytes(data, path)?;
                self.archives.push(ar);
                self.archives.len() - 1
            }
        };
        if whole {
            let members: Vec<usize> =
                self.archives[idx].members.iter().map(|&(_, off, _)| off).collect();
            for off in members {
                self.load_member(idx, off, diags)?;
            }
            return Ok(());
        }
        let file = self.arena.add_file(path);
        let ar = &self.archives[idx];
        let entries: Vec<(String, usize)> = ar.index.clone();
        for (name, member) in entries {
            self.symtab.add_lazy(&name, idx, member, file);
        }
        self.drain_pending(diags)
    }

    fn load_member(
        &mut self,
        archive: usize,
        member: usize,
        diags: &mut DiagSink,
    ) -> Result<(), String> {
        if !self.archives[archive].mark_loaded(member) {
            return Ok(());
        }
        let (name, bytes) = match self.archives[archive].member_bytes(member) {
            Some((n, b)) => (n, b.to_vec()),
            None => return Err(format!("{}: bad archive member offset {}", self.archives[archive].path, member)),
        };
        diags.log(&format!("loading archive member {}", name));
        let view = ObjectView::parse(&bytes, &name)?;
        self.adopt_or_validate(&view)?;
        let handler = self.handler()?;
        register_object(&view, &mut self.arena, &mut self.symtab, handler, &mut self.comdat, diags)?;
        Ok(())
    }

    /// Parse archive members the resolver demanded, repeating as loads
    /// inject further undefineds.
    pub fn drain_pending(&mut self, diags: &mut DiagSink) -> Result<(), String> {
        loop {
            let pending = self.symtab.take_pending_loads();
            if pending.is_empty() {
                return Ok(());
            }
            for (archive, member) in pending {
                self.load_member(archive, member, diags)?;
            }
        }
    }

    /// Offer one path: dispatch on file contents (object, shared library,
    /// archive, or a text linker script standing in for a library).
    pub fn offer_path(&mut self, spec: &FileSpec, diags: &mut DiagSink) -> Result<(), String> {
        let path = &spec.path;
        let data = std::fs::read(path).map_err(|e| format!("cannot open {}: {}", path, e))?;
        if data.len() >= 8 && &data[0..8] == b"!<arch>\n" {
            return self.offer_archive_bytes(data, path, spec.whole_archive, diags);
        }
        if data.len() >= 18 && data[0..4] == ELF_MAGIC {
            let e_type = if data[5] == 2 {
                u16::from_be_bytes([data[16], data[17]])
            } else {
                u16::from_le_bytes([data[16], data[17]])
            };
            // Objects and shared libraries load once even when a group
            // re-offers them; archives re-offer their index instead.
            if !self.loaded_paths.insert(path.clone()) {
                return Ok(());
            }
            return match e_type {
                t if t == crate::elf::ET_REL => self.offer_object_bytes(&data, path, diags),
                t if t == crate::elf::ET_DYN => self.offer_shared_bytes(&data, path, diags),
                t => Err(format!("{}: unsupported ELF type {}", path, t)),
            };
        }
        if looks_like_linker_script(&data) {
            let text = String::from_utf8_lossy(&data);
            if let Some(files) = parse_linker_script(&text) {
                let dir = Path::new(path).parent().map(|p| p.to_path_buf());
                let members: Vec<FileSpec> = files
                    .into_iter()
                    .map(|f| {
                        let resolved = if Path::new(&f).exists() {
                            f
                        } else if let Some(d) = &dir {
                            d.join(&f).to_string_lossy().to_string()
                        } else {
                            f
                        };
                        FileSpec { path: resolved, whole_archive: spec.whole_archive }
                    })
                    .collect();
                return self.run_group(&members, diags);
            }
        }
        Err(format!("{}: file format not recognized", path))
    }

    /// One full pass over a group's members, then repeat while the resolver
    /// made progress during the pass.
    pub fn run_group(&mut self, members: &[FileSpec], diags: &mut DiagSink) -> Result<(), String> {
        loop {
            let mut progress = false;
            for m in members {
                self.offer_path(m, diags)?;
                if self.symtab.take_progress() {
                    progress = true;
                }
            }
            if !progress {
                return Ok(());
            }
        }
    }

    /// Walk the whole input graph.
    pub fn run(&mut self, nodes: &[InputNode], diags: &mut DiagSink) -> Result<(), String> {
        for node in nodes {
            match node {
                InputNode::File(f) => {
                    self.offer_path(f, diags)?;
                    self.symtab.take_progress();
                }
                InputNode::Group(members) => self.run_group(members, diags)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{SHF_ALLOC, SHF_EXECINSTR, STB_GLOBAL};
    use crate::input::testelf::*;
    use crate::resolve::Body;
    use crate::target::x86_64::R_X86_64_PC32;

    fn obj_with_call(defines: &'static str, calls: &'static str) -> Vec<u8> {
        let mut text = sec(".text", SHF_ALLOC | SHF_EXECINSTR, vec![0x90; 16]);
        text.relocs.push(RelSpec { offset: 4, rtype: R_X86_64_PC32, sym: calls, addend: -4 });
        build_object(
            crate::elf::EM_X86_64,
            &[text],
            &[global(defines, 0, 0), undef(calls)],
        )
    }

    #[test]
    fn archive_cycle_loads_both_members() {
        // F1 references a; the archive holds Oa (defines a, references b)
        // and Ob (defines b). Both members must load.
        let f1 = obj_with_call("main", "a");
        let oa = obj_with_call("a", "b");
        let ob = build_object(
            crate::elf::EM_X86_64,
            &[sec(".text", SHF_ALLOC | SHF_EXECINSTR, vec![0x90; 8])],
            &[global("b", 0, 0)],
        );
        let ar = build_archive(&[("oa.o", oa), ("ob.o", ob)]);

        let mut inputs = Inputs::new(None);
        let mut diags = crate::diag::DiagSink::new(false);
        inputs.offer_object_bytes(&f1, "f1.o", &mut diags).unwrap();
        inputs.offer_archive_bytes(ar, "liba.a", false, &mut diags).unwrap();

        for name in ["a", "b"] {
            let slot = inputs.symtab.lookup(name).unwrap();
            assert!(
                matches!(inputs.symtab.get(slot).body, Body::Regular { .. }),
                "{} should be defined after group resolution",
                name
            );
        }
        inputs.symtab.check_undefined(&inputs.arena, false, &|_| false, &mut diags);
        assert!(diags.finish().is_ok());
    }

    #[test]
    fn unreferenced_members_stay_lazy() {
        let f1 = obj_with_call("main", "b");
        let oa = obj_with_call("a", "x_unused_dep");
        let ob = build_object(
            crate::elf::EM_X86_64,
            &[sec(".text", SHF_ALLOC | SHF_EXECINSTR, vec![0x90; 8])],
            &[global("b", 0, 0)],
        );
        let ar = build_archive(&[("oa.o", oa), ("ob.o", ob)]);

        let mut inputs = Inputs::new(None);
        let mut diags = crate::diag::DiagSink::new(false);
        inputs.offer_object_bytes(&f1, "f1.o", &mut diags).unwrap();
        inputs.offer_archive_bytes(ar, "liba.a", false, &mut diags).unwrap();

        let b = inputs.symtab.lookup("b").unwrap();
        assert!(matches!(inputs.symtab.get(b).body, Body::Regular { .. }));
        // a was never demanded, so its member never loaded and its dep
        // never became undefined.
        let a = inputs.symtab.lookup("a").unwrap();
        assert!(matches!(inputs.symtab.get(a).body, Body::Lazy { .. }));
        assert!(inputs.symtab.lookup("x_unused_dep").is_none());
    }

    #[test]
    fn whole_archive_loads_everything() {
        let oa = build_object(
            crate::elf::EM_X86_64,
            &[sec(".text", SHF_ALLOC | SHF_EXECINSTR, vec![0x90; 8])],
            &[global("a", 0, 0)],
        );
        let ar = build_archive(&[("oa.o", oa)]);
        let mut inputs = Inputs::new(None);
        let mut diags = crate::diag::DiagSink::new(false);
        inputs.offer_archive_bytes(ar, "liba.a", true, &mut diags).unwrap();
        let a = inputs.symtab.lookup("a").unwrap();
        assert!(matches!(inputs.symtab.get(a).body, Body::Regular { .. }));
    }

    #[test]
    fn weak_binding_survives_registration() {
        let obj = build_object(
            crate::elf::EM_X86_64,
            &[sec(".text", SHF_ALLOC | SHF_EXECINSTR, vec![0x90; 8])],
            &[SymSpec { name: "w", binding: crate::elf::STB_WEAK, section: None, value: 0, size: 0 },
              SymSpec { name: "g", binding: STB_GLOBAL, section: Some(0), value: 4, size: 0 }],
        );
        let mut inputs = Inputs::new(None);
        let mut diags = crate::diag::DiagSink::new(false);
        inputs.offer_object_bytes(&obj, "t.o", &mut diags).unwrap();
        let w = inputs.symtab.lookup("w").unwrap();
        assert_eq!(inputs.symtab.get(w).body, Body::Undefined { can_keep: false, weak: true });
    }
}

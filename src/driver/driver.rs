//! Link orchestration.
//!
//! `Driver::run()` sequences the phases:
//! 1. Walk the input graph, feeding the resolver until groups converge.
//! 2. Apply `--wrap`/`--defsym`, then report resolution errors in one batch.
//! 3. Allocate tentative definitions, mark liveness, fold identical code.
//! 4. Bucket sections, plan dynamic tables, assign addresses, materialize
//!    linker symbols, fill the tables.
//! 5. Walk every reference and apply fixups.
//! 6. Write the image (executable, shared object, relocatable, or raw).

use std::fs;

use crate::diag::DiagSink;
use crate::driver::cli::{emulation_spec, Config};
use crate::gc::collect_garbage;
use crate::icf::run_icf;
use crate::input::graph::Inputs;
use crate::output::dynamic::{self, DynOptions};
use crate::output::fixup::apply_fixups;
use crate::output::layout::{assign_addresses, build_buckets, compose, sort_buckets};
use crate::output::synth;
use crate::output::writer::{self, WriteSpec};
use crate::resolve::Body;

const BASE_ADDR: u64 = 0x40_0000;

pub struct Driver {
    pub config: Config,
}

impl Driver {
    pub fn new(config: Config) -> Driver {
        Driver { config }
    }

    pub fn run(&self) -> Result<(), String> {
        let config = &self.config;
        let mut diags = DiagSink::new(config.verbose);

        // Phase 1: inputs. An emulation pins the target up front; otherwise
        // the first object establishes it.
        let spec0 = config.emulation.as_deref().and_then(emulation_spec);
        let mut inputs = Inputs::new(spec0);
        inputs.symtab.allow_multiple = config.allow_multiple_definition;
        inputs.run(&config.nodes, &mut diags)?;
        if inputs.spec.is_none() {
            return Err("no input files".to_string());
        }
        let handler = inputs.handler()?;
        let spec = inputs.spec.unwrap();
        let mut arena = inputs.arena;
        let mut symtab = inputs.symtab;

        // Phase 2: symbol rewrites, then the batched resolution report.
        for w in &config.wraps {
            symtab.apply_wrap(w);
        }
        for (name, value) in &config.defsyms {
            symtab.apply_defsym(name, value, 0);
        }
        let keep_undefined = config.no_inhibit_exec || config.relocatable || config.shared;
        symtab.check_undefined(&arena, keep_undefined, &synth::is_linker_defined, &mut diags);
        diags.finish()?;

        // Phase 3: tentative allocation, liveness, folding. None of these
        // apply to relocatable output.
        let entry_slot = config
            .entry
            .as_deref()
            .or(Some("_start"))
            .and_then(|name| symtab.lookup(name));
        if !config.relocatable {
            symtab.allocate_commons(&mut arena);
            if config.gc_sections {
                let n = collect_garbage(&mut arena, &symtab, entry_slot, &mut diags);
                diags.log(&format!("garbage collection removed {} sections", n));
            }
            if config.icf {
                let n = run_icf(&mut arena, &symtab, config.threads, &mut diags);
                diags.log(&format!("folded {} sections", n));
            }
        }

        // Phase 4: layout.
        let mut layout = build_buckets(&mut arena, handler);
        let dyn_opts = DynOptions {
            shared_output: config.shared,
            dynamic_linker: config.dynamic_linker.clone(),
            soname: config.soname.clone(),
            rpaths: config.rpaths.clone(),
            use_runpath: config.use_runpath,
            init_sym: config.init_sym.clone(),
            fini_sym: config.fini_sym.clone(),
        };
        let mut tables = if config.relocatable {
            dynamic::DynTables {
                class: spec.class,
                endian: spec.endian,
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
        } else {
            dynamic::plan(&mut layout, &arena, &symtab, handler, spec.class, spec.endian, &dyn_opts)
        };
        sort_buckets(&mut layout, &mut arena);

        let wspec =
            WriteSpec { class: spec.class, endian: spec.endian, machine: spec.machine, e_flags: spec.e_flags };
        let raw_layout = config.relocatable || config.oformat_binary;
        let headers = if raw_layout {
            0
        } else {
            writer::headers_size(&wspec, writer::count_phdrs(&layout))
        };
        let base = if config.shared || raw_layout { 0 } else { BASE_ADDR };
        let page_align = !(config.nmagic || config.omagic || raw_layout);
        assign_addresses(&mut layout, &mut arena, base, headers, page_align);

        synth::materialize(&layout, &mut symtab, spec.machine);
        if !config.relocatable {
            dynamic::finalize(&mut layout, &arena, &symtab, &mut tables, handler, &dyn_opts);
        }

        // Phase 5: fixups, then compose the carrier sections.
        let fixes =
            apply_fixups(&mut arena, &symtab, handler, &tables, config.relocatable, &mut diags)?;
        compose(&mut layout, &arena);

        // Phase 6: emit. `-e`, then `_start`, then the start of .text with
        // a warning.
        let entry_va = match entry_slot.and_then(|s| symtab.get_va(&arena, s, 0)) {
            Some(va) => va,
            None if config.relocatable || config.shared => 0,
            None => {
                let text = layout.find(".text").map(|i| layout.sections[i].va).unwrap_or(base);
                eprintln!(
                    "rld: warning: entry symbol {} not found; defaulting to start of .text",
                    config.entry.as_deref().unwrap_or("_start")
                );
                text
            }
        };

        let bytes = if config.oformat_binary {
            writer::write_binary(&layout)
        } else if config.relocatable {
            writer::write_relocatable(&layout, &arena, &symtab, &fixes.section_relocs, &wspec)
        } else {
            writer::write_image(&layout, &wspec, entry_va, config.shared)
        };
        fs::write(&config.output, &bytes)
            .map_err(|e| format!("cannot write {}: {}", config.output, e))?;
        #[cfg(unix)]
        if !config.relocatable {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&config.output, fs::Permissions::from_mode(0o755));
        }
        diags.log(&format!("wrote {} ({} bytes)", config.output, bytes.len()));

        // Lazy bodies that survive to this point were never demanded; note
        // them under --verbose for archive debugging.
        for slot in symtab.ids() {
            if let Body::Lazy { .. } = symtab.get(slot).body {
                diags.log(&format!("unused archive symbol {}", symtab.get(slot).name));
            }
        }
        Ok(())
    }
}

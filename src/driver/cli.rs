//! Command-line parsing for the ld-compatible surface.
//!
//! Design: a simple `while` loop with a flat `match` on each argument. No
//! external parser library. Unlike a compiler driver, unknown flags are
//! errors; silently ignoring a linker flag changes link semantics.

use std::path::Path;

use crate::elf::{ElfClass, Endian, EM_386, EM_AARCH64, EM_ARM, EM_HEXAGON, EM_MIPS, EM_PPC64, EM_X86_64};
use crate::input::graph::{FileSpec, InputNode};
use crate::input::object::TargetSpec;

pub struct Config {
    pub output: String,
    pub shared: bool,
    pub relocatable: bool,
    pub entry: Option<String>,
    pub emulation: Option<String>,
    pub dynamic_linker: Option<String>,
    pub soname: Option<String>,
    pub init_sym: String,
    pub fini_sym: String,
    pub lib_paths: Vec<String>,
    pub rpaths: Vec<String>,
    pub rpath_links: Vec<String>,
    pub use_runpath: bool,
    pub oformat_binary: bool,
    pub nmagic: bool,
    pub omagic: bool,
    pub icf: bool,
    pub gc_sections: bool,
    pub static_libs: bool,
    pub wraps: Vec<String>,
    pub defsyms: Vec<(String, String)>,
    pub z_options: Vec<String>,
    pub no_inhibit_exec: bool,
    pub allow_multiple_definition: bool,
    pub verbose: bool,
    pub threads: usize,
    pub nodes: Vec<InputNode>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output: "a.out".to_string(),
            shared: false,
            relocatable: false,
            entry: None,
            emulation: None,
            dynamic_linker: None,
            soname: None,
            init_sym: "_init".to_string(),
            fini_sym: "_fini".to_string(),
            lib_paths: Vec::new(),
            rpaths: Vec::new(),
            rpath_links: Vec::new(),
            use_runpath: false,
            oformat_binary: false,
            nmagic: false,
            omagic: false,
            icf: false,
            gc_sections: false,
            static_libs: false,
            wraps: Vec::new(),
            defsyms: Vec::new(),
            z_options: Vec::new(),
            no_inhibit_exec: false,
            allow_multiple_definition: false,
            verbose: false,
            threads: 1,
            nodes: Vec::new(),
        }
    }
}

/// Map an `-m` emulation name to the link target it fixes.
pub fn emulation_spec(name: &str) -> Option<TargetSpec> {
    let (machine, class, endian) = match name {
        "elf_x86_64" | "elf_x86_64_fbsd" => (EM_X86_64, ElfClass::Elf64, Endian::Little),
        "elf_i386" | "elf_i386_fbsd" => (EM_386, ElfClass::Elf32, Endian::Little),
        "elf32btsmip" => (EM_MIPS, ElfClass::Elf32, Endian::Big),
        "elf32ltsmip" => (EM_MIPS, ElfClass::Elf32, Endian::Little),
        "aarch64linux" | "aarch64elf" => (EM_AARCH64, ElfClass::Elf64, Endian::Little),
        "armelf" | "armelf_linux_eabi" => (EM_ARM, ElfClass::Elf32, Endian::Little),
        "elf64ppc" => (EM_PPC64, ElfClass::Elf64, Endian::Big),
        "hexagonelf" => (EM_HEXAGON, ElfClass::Elf32, Endian::Little),
        _ => return None,
    };
    Some(TargetSpec { machine, class, endian, e_flags: 0 })
}

/// Search `-L` directories for `-lNAME`, preferring shared unless `-static`.
fn resolve_lib(name: &str, paths: &[String], prefer_static: bool) -> Option<String> {
    if let Some(exact) = name.strip_prefix(':') {
        for dir in paths {
            let p = format!("{}/{}", dir, exact);
            if Path::new(&p).exists() {
                return Some(p);
            }
        }
        return None;
    }
    let order: [&str; 2] = if prefer_static { ["a", "so"] } else { ["so", "a"] };
    for ext in order {
        for dir in paths {
            let p = format!("{}/lib{}.{}", dir, name, ext);
            if Path::new(&p).exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Parse the whole command line into a `Config`.
pub fn parse_args(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut group: Option<Vec<FileSpec>> = None;
    let mut whole_archive = false;
    let mut i = 0;

    // Push a file into the open group or as its own node.
    fn add_file(config: &mut Config, group: &mut Option<Vec<FileSpec>>, spec: FileSpec) {
        match group {
            Some(g) => g.push(spec),
            None => config.nodes.push(InputNode::File(spec)),
        }
    }

    let next = |i: &mut usize, what: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i).cloned().ok_or_else(|| format!("missing argument to {}", what))
    };

    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-o" => config.output = next(&mut i, "-o")?,
            "-shared" | "--shared" | "-Bshareable" => config.shared = true,
            "-r" | "--relocatable" => config.relocatable = true,
            "-e" | "--entry" => config.entry = Some(next(&mut i, "-e")?),
            "-m" => {
                let emu = next(&mut i, "-m")?;
                if emulation_spec(&emu).is_none() {
                    return Err(format!("unknown emulation: {}", emu));
                }
                config.emulation = Some(emu);
            }
            "--script" | "-T" => {
                // Placement directives belong to the layout collaborator;
                // the GROUP/INPUT file lists still feed the input graph.
                let path = next(&mut i, "--script")?;
                add_file(&mut config, &mut group, FileSpec { path, whole_archive });
            }
            "-L" => config.lib_paths.push(next(&mut i, "-L")?),
            "-l" => {
                let name = next(&mut i, "-l")?;
                let path = resolve_lib(&name, &config.lib_paths, config.static_libs)
                    .ok_or_else(|| format!("cannot find -l{}", name))?;
                add_file(&mut config, &mut group, FileSpec { path, whole_archive });
            }
            "--start-group" | "-(" => {
                if group.is_some() {
                    return Err("nested --start-group".to_string());
                }
                group = Some(Vec::new());
            }
            "--end-group" | "-)" => match group.take() {
                Some(g) => config.nodes.push(InputNode::Group(g)),
                None => return Err("--end-group without --start-group".to_string()),
            },
            "--whole-archive" => whole_archive = true,
            "--no-whole-archive" => whole_archive = false,
            "-z" => config.z_options.push(next(&mut i, "-z")?),
            "--oformat" => {
                let fmt = next(&mut i, "--oformat")?;
                if fmt == "binary" {
                    config.oformat_binary = true;
                } else {
                    return Err(format!("unsupported --oformat {}", fmt));
                }
            }
            "--dynamic-linker" | "-dynamic-linker" => {
                config.dynamic_linker = Some(next(&mut i, "--dynamic-linker")?)
            }
            "-init" | "--init" => config.init_sym = next(&mut i, "-init")?,
            "-fini" | "--fini" => config.fini_sym = next(&mut i, "-fini")?,
            "--nmagic" | "-n" => config.nmagic = true,
            "--omagic" | "-N" => config.omagic = true,
            "--icf" | "--icf=all" => config.icf = true,
            "--icf=none" => config.icf = false,
            "-rpath" | "--rpath" => config.rpaths.push(next(&mut i, "-rpath")?),
            "-rpath-link" | "--rpath-link" => config.rpath_links.push(next(&mut i, "-rpath-link")?),
            "--enable-new-dtags" => config.use_runpath = true,
            "--disable-new-dtags" => config.use_runpath = false,
            "-soname" | "--soname" | "-h" => config.soname = Some(next(&mut i, "-soname")?),
            "-static" | "-Bstatic" | "--static" => config.static_libs = true,
            "-Bdynamic" => config.static_libs = false,
            "--gc-sections" => config.gc_sections = true,
            "--no-gc-sections" => config.gc_sections = false,
            "--no-inhibit-exec" | "--noinhibit-exec" => config.no_inhibit_exec = true,
            "--allow-multiple-definition" => config.allow_multiple_definition = true,
            "--verbose" => config.verbose = true,
            "--threads" => {
                config.threads = next(&mut i, "--threads")?
                    .parse()
                    .map_err(|_| "invalid --threads value".to_string())?
            }
            _ => {
                if let Some(rest) = arg.strip_prefix("--wrap=") {
                    config.wraps.push(rest.to_string());
                } else if let Some(rest) = arg.strip_prefix("--defsym=") {
                    let (name, value) = rest
                        .split_once('=')
                        .ok_or_else(|| format!("bad --defsym syntax: {}", rest))?;
                    config.defsyms.push((name.to_string(), value.to_string()));
                } else if let Some(rest) = arg.strip_prefix("--oformat=") {
                    if rest == "binary" {
                        config.oformat_binary = true;
                    } else {
                        return Err(format!("unsupported --oformat {}", rest));
                    }
                } else if let Some(rest) = arg.strip_prefix("--threads=") {
                    config.threads =
                        rest.parse().map_err(|_| "invalid --threads value".to_string())?;
                } else if let Some(rest) = arg.strip_prefix("--soname=") {
                    config.soname = Some(rest.to_string());
                } else if let Some(rest) = arg.strip_prefix("-L").filter(|r| !r.is_empty()) {
                    config.lib_paths.push(rest.to_string());
                } else if let Some(rest) = arg.strip_prefix("-l").filter(|r| !r.is_empty()) {
                    let path = resolve_lib(rest, &config.lib_paths, config.static_libs)
                        .ok_or_else(|| format!("cannot find -l{}", rest))?;
                    add_file(&mut config, &mut group, FileSpec { path, whole_archive });
                } else if let Some(rest) = arg.strip_prefix("-z").filter(|r| !r.is_empty()) {
                    config.z_options.push(rest.to_string());
                } else if arg.starts_with('-') && arg.len() > 1 {
                    return Err(format!("unknown option: {}", arg));
                } else {
                    add_file(
                        &mut config,
                        &mut group,
                        FileSpec { path: arg.to_string(), whole_archive },
                    );
                }
            }
        }
        i += 1;
    }
    if group.is_some() {
        return Err("--start-group without --end-group".to_string());
    }
    if config.threads == 0 {
        config.threads = 1;
    }
    Ok(config)
}

//! Per-architecture relocation handling.
//!
//! Each target supplies one `RelocHandler`: a capability record covering
//! relocation decoding (raw records + instruction bytes → typed references
//! with reconstructed addends), bit-exact application for final and
//! relocatable output, classification predicates, section-relocation
//! emission for `-r`, and the PLT templates the output coordinator
//! instantiates. There is no inheritance between readers and writers; the
//! registry hands out one handler per (machine, endianness).

use crate::elf::{Endian, EM_386, EM_AARCH64, EM_ARM, EM_HEXAGON, EM_MIPS, EM_PPC64, EM_X86_64};
use crate::sections::{ContentType, RelocKind};

pub mod aarch64;
pub mod arm;
pub mod hexagon;
pub mod i386;
pub mod mips;
pub mod ppc64;
pub mod x86_64;

/// One relocation record as it appears on disk (and, for `-r` output, as it
/// is written back out). ELF REL records carry `addend: None`; the decoder
/// reconstructs the addend from the instruction bytes. The scattered and
/// pair fields model the Mach-O record forms the ARM engine must round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReloc {
    pub offset: u64,
    pub rtype: u32,
    /// Symbol index for external records, section index for internal ones.
    pub sym: u32,
    pub addend: Option<i64>,
    pub pcrel: bool,
    /// log2 of the fixup width in bytes.
    pub length: u8,
    /// Scattered form: `value` holds the target address instead of `sym`.
    pub scattered: bool,
    /// External form: `sym` indexes the symbol table rather than a section.
    pub ext: bool,
    pub value: u64,
}

impl RawReloc {
    pub fn simple(offset: u64, rtype: u32, sym: u32, addend: Option<i64>) -> RawReloc {
        RawReloc {
            offset,
            rtype,
            sym,
            addend,
            pcrel: false,
            length: 2,
            scattered: false,
            ext: true,
            value: 0,
        }
    }
}

/// What a decoded relocation points at before symbol-index mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedTarget {
    /// Index into the object's symbol table.
    Symbol(u32),
    /// An address inside the file's section image (scattered forms).
    Address(u64),
}

/// Result of decoding one (or one pair of) raw relocation records.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub offset: u64,
    pub kind: RelocKind,
    pub addend: i64,
    pub target: DecodedTarget,
    /// Raw records consumed: 1, or 2 for paired forms.
    pub consumed: usize,
}

/// Which output path a fixup is computed for. Relocatable output stores
/// displacements against the addend alone when the target needs an external
/// relocation, because the eventual consumer re-applies the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStyle {
    Final,
    Relocatable { external: bool },
}

/// Addresses for one fixup application.
#[derive(Debug, Clone, Copy)]
pub struct FixupCtx {
    pub fixup_va: u64,
    pub target_va: u64,
    /// VA of the section containing the fixup (function-relative forms).
    pub in_atom_va: u64,
    /// GOT base for GOT-relative kinds; doubles as the MIPS global pointer.
    pub got_va: u64,
    pub addend: i64,
    pub style: ApplyStyle,
}

/// Linker-generated table demand of a relocation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    None,
    Got,
    Plt,
}

/// PLT instruction templates for a target.
#[derive(Debug, Clone, Copy)]
pub struct PltTemplate {
    pub header: &'static [u8],
    pub entry: &'static [u8],
    pub align: u64,
}

pub trait RelocHandler: Sync {
    fn machine(&self) -> u16;
    fn endian(&self) -> Endian {
        Endian::Little
    }
    fn name(&self) -> &'static str;

    /// Branch-and-link relocation kinds (stub/veneer candidates).
    fn is_call_site(&self, kind: RelocKind) -> bool;
    /// Absolute-pointer kinds (get the Thumb bit restored on ARM).
    fn is_pointer(&self, kind: RelocKind) -> bool;
    /// Raw record types that arrive as two-record pairs.
    fn is_paired(&self, rtype: u32) -> bool;
    /// Bytes the fixup touches; `offset + footprint <= section size`.
    fn footprint(&self, kind: RelocKind) -> u64;

    /// Decode the record(s) at `raws[i]` against the section bytes.
    fn decode_one(&self, raws: &[RawReloc], i: usize, bytes: &[u8]) -> Result<Decoded, String>;

    /// Write the fixed-up bytes for one reference. `thumb` is the ARM
    /// instruction-mode flag threaded across one section's references;
    /// other targets ignore it.
    fn apply(
        &self,
        kind: RelocKind,
        loc: &mut [u8],
        ctx: &FixupCtx,
        thumb: &mut bool,
    ) -> Result<(), String>;

    /// GOT/PLT demand of a kind, used for dynamic-table bookkeeping.
    fn demand(&self, _kind: RelocKind) -> Demand {
        Demand::None
    }

    /// Pairwise object-attribute compatibility (MIPS float ABI). `first` is
    /// the e_flags of the object that established the link target.
    fn validate_flags(&self, _file: &str, _flags: u32, _first: u32) -> Result<(), String> {
        Ok(())
    }

    /// Per-target output-section override (Hexagon small data).
    fn output_section_for(&self, _name: &str, _content: ContentType) -> Option<&'static str> {
        None
    }

    fn plt_template(&self) -> PltTemplate {
        PltTemplate { header: &[], entry: &[], align: 16 }
    }

    /// Emit the section-relocation record(s) for one reference in `-r`
    /// output. External records are symbol-indexed with the reference
    /// addend; internal ones are section-indexed (scattered when the target
    /// demands it) and fold the target's section-relative position
    /// (`target_addr`) into the addend. `from_addr` is the referring
    /// section's own position, consumed by paired forms.
    #[allow(clippy::too_many_arguments)]
    fn emit_relocs(
        &self,
        kind: RelocKind,
        sect_off: u64,
        external: bool,
        sym_idx: u32,
        target_sect: u32,
        target_addr: u64,
        from_addr: u64,
        addend: i64,
        out: &mut Vec<RawReloc>,
    ) {
        let _ = from_addr;
        let (sym, addend) = if external {
            (sym_idx, addend)
        } else {
            (target_sect, target_addr as i64 + addend)
        };
        out.push(RawReloc {
            offset: sect_off,
            rtype: kind.0,
            sym,
            addend: Some(addend),
            pcrel: false,
            length: 2,
            scattered: false,
            ext: external,
            value: 0,
        });
    }
}

/// Look up the handler for a machine value and byte order.
pub fn handler_for(machine: u16, endian: Endian) -> Option<&'static dyn RelocHandler> {
    match (machine, endian) {
        (EM_ARM, Endian::Little) => Some(&arm::HANDLER),
        (EM_X86_64, Endian::Little) => Some(&x86_64::HANDLER),
        (EM_386, Endian::Little) => Some(&i386::HANDLER),
        (EM_AARCH64, Endian::Little) => Some(&aarch64::HANDLER),
        (EM_MIPS, Endian::Big) => Some(&mips::HANDLER_BE),
        (EM_MIPS, Endian::Little) => Some(&mips::HANDLER_LE),
        (EM_PPC64, Endian::Big) => Some(&ppc64::HANDLER),
        (EM_HEXAGON, Endian::Little) => Some(&hexagon::HANDLER),
        _ => None,
    }
}

/// Shared helper: signed range check for branch displacements.
pub fn check_branch_range(disp: i64, bits: u32, what: &str) -> Result<(), String> {
    let limit = 1i64 << (bits - 1);
    if disp >= limit || disp < -limit {
        return Err(format!(
            "relocation out of range: {} displacement {:#x} exceeds {} bits",
            what, disp, bits
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_the_supported_machines() {
        assert!(handler_for(EM_ARM, Endian::Little).is_some());
        assert!(handler_for(EM_X86_64, Endian::Little).is_some());
        assert!(handler_for(EM_HEXAGON, Endian::Little).is_some());
        assert!(handler_for(EM_MIPS, Endian::Big).is_some());
        assert!(handler_for(EM_PPC64, Endian::Big).is_some());
        assert!(handler_for(EM_X86_64, Endian::Big).is_none());
    }

    #[test]
    fn branch_range_limits() {
        assert!(check_branch_range(0x01ff_fffc, 26, "b24").is_ok());
        assert!(check_branch_range(0x0200_0000, 26, "b24").is_err());
        assert!(check_branch_range(-0x0200_0000, 26, "b24").is_ok());
        assert!(check_branch_range(-0x0200_0004, 26, "b24").is_err());
    }
}

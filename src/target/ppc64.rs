//! PPC64 (big-endian) relocation handling.

use crate::elf::{Endian, EM_PPC64};
use crate::sections::RelocKind;
use crate::target::{
    check_branch_range, ApplyStyle, Decoded, DecodedTarget, Demand, FixupCtx, RawReloc,
    RelocHandler,
};

pub const R_PPC64_ADDR32: u32 = 1;
pub const R_PPC64_REL24: u32 = 10;
pub const R_PPC64_REL32: u32 = 26;
pub const R_PPC64_ADDR64: u32 = 38;

pub struct Ppc64Handler;

pub static HANDLER: Ppc64Handler = Ppc64Handler;

impl RelocHandler for Ppc64Handler {
    fn machine(&self) -> u16 {
        EM_PPC64
    }

    fn endian(&self) -> Endian {
        Endian::Big
    }

    fn name(&self) -> &'static str {
        "ppc64"
    }

    fn is_call_site(&self, kind: RelocKind) -> bool {
        kind.0 == R_PPC64_REL24
    }

    fn is_pointer(&self, kind: RelocKind) -> bool {
        kind.0 == R_PPC64_ADDR64
    }

    fn is_paired(&self, _rtype: u32) -> bool {
        false
    }

    fn footprint(&self, kind: RelocKind) -> u64 {
        if kind.0 == R_PPC64_ADDR64 {
            8
        } else {
            4
        }
    }

    fn decode_one(&self, raws: &[RawReloc], i: usize, _bytes: &[u8]) -> Result<Decoded, String> {
        let r = raws[i];
        if !matches!(r.rtype, R_PPC64_ADDR32 | R_PPC64_REL24 | R_PPC64_REL32 | R_PPC64_ADDR64) {
            return Err(format!("unsupported ppc64 relocation type {} at {:#x}", r.rtype, r.offset));
        }
        let addend = r
            .addend
            .ok_or_else(|| format!("ppc64 relocation at {:#x} lacks an addend", r.offset))?;
        Ok(Decoded {
            offset: r.offset,
            kind: RelocKind(r.rtype),
            addend,
            target: DecodedTarget::Symbol(r.sym),
            consumed: 1,
        })
    }

    fn apply(
        &self,
        kind: RelocKind,
        loc: &mut [u8],
        ctx: &FixupCtx,
        _thumb: &mut bool,
    ) -> Result<(), String> {
        let e = Endian::Big;
        let external = matches!(ctx.style, ApplyStyle::Relocatable { external: true });
        let s = if external { 0i64 } else { ctx.target_va as i64 };
        let v = s + ctx.addend;
        let p = ctx.fixup_va as i64;
        let width = self.footprint(kind) as usize;
        if loc.len() < width {
            return Err("fixup runs past section end".to_string());
        }
        match kind.0 {
            R_PPC64_ADDR64 => e.write_u64(loc, 0, v as u64),
            R_PPC64_ADDR32 => e.write_u32(loc, 0, v as u32),
            R_PPC64_REL32 => e.write_u32(loc, 0, (v - p) as u32),
            R_PPC64_REL24 => {
                let disp = v - p;
                check_branch_range(disp, 26, "rel24")?;
                let instr = e.read_u32(loc, 0);
                e.write_u32(loc, 0, (instr & 0xfc00_0003) | (disp as u32 & 0x03ff_fffc));
            }
            other => return Err(format!("unsupported ppc64 relocation type {}", other)),
        }
        Ok(())
    }

    fn demand(&self, kind: RelocKind) -> Demand {
        if kind.0 == R_PPC64_REL24 {
            Demand::Plt
        } else {
            Demand::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel24_preserves_opcode_and_link_bits() {
        // bl: opcode 18, LK=1.
        let mut loc = vec![0u8; 4];
        Endian::Big.write_u32(&mut loc, 0, 0x4800_0001);
        let mut t = false;
        HANDLER
            .apply(
                RelocKind(R_PPC64_REL24),
                &mut loc,
                &FixupCtx {
                    fixup_va: 0x1_0000,
                    target_va: 0x1_0400,
                    in_atom_va: 0,
                    got_va: 0,
                    addend: 0,
                    style: ApplyStyle::Final,
                },
                &mut t,
            )
            .unwrap();
        let insn = Endian::Big.read_u32(&loc, 0);
        assert_eq!(insn & 0x03ff_fffc, 0x400);
        assert_eq!(insn & 0xfc00_0003, 0x4800_0001);
    }

    #[test]
    fn addr64_is_big_endian() {
        let mut loc = vec![0u8; 8];
        let mut t = false;
        HANDLER
            .apply(
                RelocKind(R_PPC64_ADDR64),
                &mut loc,
                &FixupCtx {
                    fixup_va: 0,
                    target_va: 0x0102_0304,
                    in_atom_va: 0,
                    got_va: 0,
                    addend: 0,
                    style: ApplyStyle::Final,
                },
                &mut t,
            )
            .unwrap();
        assert_eq!(loc, [0, 0, 0, 0, 1, 2, 3, 4]);
    }
}

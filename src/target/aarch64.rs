//! AArch64 relocation handling.
//!
//! RELA input. The page-relative ADRP/ADD/LDST split is the only part with
//! any subtlety: ADRP immediates are distributed across immlo [30:29] and
//! immhi [23:5].

use crate::elf::{Endian, EM_AARCH64};
use crate::sections::RelocKind;
use crate::target::{
    check_branch_range, ApplyStyle, Decoded, DecodedTarget, Demand, FixupCtx, PltTemplate,
    RawReloc, RelocHandler,
};

pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_ABS32: u32 = 258;
pub const R_AARCH64_PREL32: u32 = 261;
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
pub const R_AARCH64_JUMP26: u32 = 282;
pub const R_AARCH64_CALL26: u32 = 283;
pub const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;

fn page(v: u64) -> u64 {
    v & !0xfff
}

pub struct Aarch64Handler;

pub static HANDLER: Aarch64Handler = Aarch64Handler;

impl RelocHandler for Aarch64Handler {
    fn machine(&self) -> u16 {
        EM_AARCH64
    }

    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn is_call_site(&self, kind: RelocKind) -> bool {
        matches!(kind.0, R_AARCH64_CALL26 | R_AARCH64_JUMP26)
    }

    fn is_pointer(&self, kind: RelocKind) -> bool {
        kind.0 == R_AARCH64_ABS64
    }

    fn is_paired(&self, _rtype: u32) -> bool {
        false
    }

    fn footprint(&self, kind: RelocKind) -> u64 {
        match kind.0 {
            R_AARCH64_ABS64 => 8,
            _ => 4,
        }
    }

    fn decode_one(&self, raws: &[RawReloc], i: usize, _bytes: &[u8]) -> Result<Decoded, String> {
        let r = raws[i];
        if !matches!(
            r.rtype,
            R_AARCH64_ABS64
                | R_AARCH64_ABS32
                | R_AARCH64_PREL32
                | R_AARCH64_ADR_PREL_PG_HI21
                | R_AARCH64_ADD_ABS_LO12_NC
                | R_AARCH64_JUMP26
                | R_AARCH64_CALL26
                | R_AARCH64_LDST64_ABS_LO12_NC
        ) {
            return Err(format!(
                "unsupported aarch64 relocation type {} at {:#x}",
                r.rtype, r.offset
            ));
        }
        let addend = r
            .addend
            .ok_or_else(|| format!("aarch64 relocation at {:#x} lacks an addend", r.offset))?;
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
        let e = Endian::Little;
        let external = matches!(ctx.style, ApplyStyle::Relocatable { external: true });
        let s = if external { 0u64 } else { ctx.target_va };
        let sa = s.wrapping_add(ctx.addend as u64);
        let p = ctx.fixup_va;
        let width = self.footprint(kind) as usize;
        if loc.len() < width {
            return Err("fixup runs past section end".to_string());
        }
        match kind.0 {
            R_AARCH64_ABS64 => e.write_u64(loc, 0, sa),
            R_AARCH64_ABS32 => e.write_u32(loc, 0, sa as u32),
            R_AARCH64_PREL32 => e.write_u32(loc, 0, sa.wrapping_sub(p) as u32),
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                let disp = sa.wrapping_sub(p) as i64;
                check_branch_range(disp, 28, "call26")?;
                let instr = e.read_u32(loc, 0);
                let imm26 = ((disp >> 2) as u32) & 0x03ff_ffff;
                e.write_u32(loc, 0, (instr & 0xfc00_0000) | imm26);
            }
            R_AARCH64_ADR_PREL_PG_HI21 => {
                let delta = page(sa) as i64 - page(p) as i64;
                check_branch_range(delta, 33, "adrp")?;
                let imm = (delta >> 12) as u32;
                let immlo = imm & 0x3;
                let immhi = (imm >> 2) & 0x7_ffff;
                let instr = e.read_u32(loc, 0);
                e.write_u32(loc, 0, (instr & 0x9f00_001f) | (immlo << 29) | (immhi << 5));
            }
            R_AARCH64_ADD_ABS_LO12_NC => {
                let imm12 = (sa & 0xfff) as u32;
                let instr = e.read_u32(loc, 0);
                e.write_u32(loc, 0, (instr & 0xffc0_03ff) | (imm12 << 10));
            }
            R_AARCH64_LDST64_ABS_LO12_NC => {
                let imm12 = ((sa & 0xfff) >> 3) as u32;
                let instr = e.read_u32(loc, 0);
                e.write_u32(loc, 0, (instr & 0xffc0_03ff) | (imm12 << 10));
            }
            other => return Err(format!("unsupported aarch64 relocation type {}", other)),
        }
        Ok(())
    }

    fn demand(&self, kind: RelocKind) -> Demand {
        if self.is_call_site(kind) {
            Demand::Plt
        } else {
            Demand::None
        }
    }

    fn plt_template(&self) -> PltTemplate {
        // adrp x16; ldr x17, [x16, #off]; add x16; br x17
        static ENTRY: [u8; 16] = [
            0x10, 0x00, 0x00, 0x90, //
            0x11, 0x02, 0x40, 0xf9, //
            0x10, 0x02, 0x00, 0x91, //
            0x20, 0x02, 0x1f, 0xd6,
        ];
        PltTemplate { header: &[], entry: &ENTRY, align: 16 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(kind: u32, loc: &mut [u8], fixup: u64, target: u64, addend: i64) -> Result<(), String> {
        let mut t = false;
        HANDLER.apply(
            RelocKind(kind),
            loc,
            &FixupCtx {
                fixup_va: fixup,
                target_va: target,
                in_atom_va: 0,
                got_va: 0,
                addend,
                style: ApplyStyle::Final,
            },
            &mut t,
        )
    }

    #[test]
    fn call26_imm_field() {
        let mut loc = 0x9400_0000u32.to_le_bytes();
        apply(R_AARCH64_CALL26, &mut loc, 0x1_0000, 0x1_4000, 0).unwrap();
        let instr = u32::from_le_bytes(loc);
        assert_eq!(instr & 0x03ff_ffff, 0x4000 >> 2);
        assert_eq!(instr & 0xfc00_0000, 0x9400_0000);
    }

    #[test]
    fn adrp_splits_immlo_immhi() {
        let mut loc = 0x9000_0010u32.to_le_bytes();
        // Page delta of exactly 3 pages exercises both fields.
        apply(R_AARCH64_ADR_PREL_PG_HI21, &mut loc, 0x10_0000, 0x10_3000, 0).unwrap();
        let instr = u32::from_le_bytes(loc);
        let immlo = (instr >> 29) & 0x3;
        let immhi = (instr >> 5) & 0x7_ffff;
        assert_eq!((immhi << 2) | immlo, 3);
    }

    #[test]
    fn add_lo12_takes_the_page_offset() {
        let mut loc = 0x9100_0000u32.to_le_bytes();
        apply(R_AARCH64_ADD_ABS_LO12_NC, &mut loc, 0, 0x10_3a2c, 0).unwrap();
        let instr = u32::from_le_bytes(loc);
        assert_eq!((instr >> 10) & 0xfff, 0xa2c);
    }

    #[test]
    fn call26_out_of_range() {
        let mut loc = 0x9400_0000u32.to_le_bytes();
        assert!(apply(R_AARCH64_CALL26, &mut loc, 0, 0x800_0000, 0).is_err());
        assert!(apply(R_AARCH64_CALL26, &mut loc, 0, 0x7ff_fffc, 0).is_ok());
    }
}

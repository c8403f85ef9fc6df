//! Hexagon relocation handling.
//!
//! Hexagon immediates are scattered across non-contiguous instruction bits;
//! `scatter_bits` distributes a value into a per-kind mask. Small-data
//! sections are routed to `.sdata` so GP-relative accesses stay in range.

use crate::elf::{Endian, EM_HEXAGON};
use crate::sections::{ContentType, RelocKind};
use crate::target::{
    ApplyStyle, Decoded, DecodedTarget, Demand, FixupCtx, RawReloc, RelocHandler,
};

pub const R_HEX_B22_PCREL: u32 = 1;
pub const R_HEX_B15_PCREL: u32 = 2;
pub const R_HEX_LO16: u32 = 4;
pub const R_HEX_HI16: u32 = 5;
pub const R_HEX_32: u32 = 6;
pub const R_HEX_GPREL16_0: u32 = 9;
pub const R_HEX_GPREL16_1: u32 = 10;
pub const R_HEX_GPREL16_2: u32 = 11;
pub const R_HEX_GPREL16_3: u32 = 12;

pub const MASK_B22: u32 = 0x01ff_3ffe;
pub const MASK_B15: u32 = 0x00df_20fe;
pub const MASK_16: u32 = 0x00c0_3fff;

/// Distribute the low bits of `value` into the set bit positions of `mask`,
/// low to high.
pub fn scatter_bits(value: u32, mask: u32) -> u32 {
    let mut out = 0u32;
    let mut v = value;
    for bit in 0..32 {
        if mask & (1 << bit) != 0 {
            out |= (v & 1) << bit;
            v >>= 1;
        }
    }
    out
}

/// Inverse of `scatter_bits`: collect the masked bits of `insn` into a
/// contiguous value.
pub fn gather_bits(insn: u32, mask: u32) -> u32 {
    let mut out = 0u32;
    let mut pos = 0;
    for bit in 0..32 {
        if mask & (1 << bit) != 0 {
            out |= ((insn >> bit) & 1) << pos;
            pos += 1;
        }
    }
    out
}

fn mask_for(rtype: u32) -> u32 {
    match rtype {
        R_HEX_B22_PCREL => MASK_B22,
        R_HEX_B15_PCREL => MASK_B15,
        _ => MASK_16,
    }
}

pub struct HexagonHandler;

pub static HANDLER: HexagonHandler = HexagonHandler;

impl RelocHandler for HexagonHandler {
    fn machine(&self) -> u16 {
        EM_HEXAGON
    }

    fn name(&self) -> &'static str {
        "hexagon"
    }

    fn is_call_site(&self, kind: RelocKind) -> bool {
        matches!(kind.0, R_HEX_B22_PCREL | R_HEX_B15_PCREL)
    }

    fn is_pointer(&self, kind: RelocKind) -> bool {
        kind.0 == R_HEX_32
    }

    fn is_paired(&self, _rtype: u32) -> bool {
        false
    }

    fn footprint(&self, _kind: RelocKind) -> u64 {
        4
    }

    fn decode_one(&self, raws: &[RawReloc], i: usize, _bytes: &[u8]) -> Result<Decoded, String> {
        let r = raws[i];
        if !matches!(
            r.rtype,
            R_HEX_B22_PCREL
                | R_HEX_B15_PCREL
                | R_HEX_LO16
                | R_HEX_HI16
                | R_HEX_32
                | R_HEX_GPREL16_0
                | R_HEX_GPREL16_1
                | R_HEX_GPREL16_2
                | R_HEX_GPREL16_3
        ) {
            return Err(format!(
                "unsupported hexagon relocation type {} at {:#x}",
                r.rtype, r.offset
            ));
        }
        let addend = r
            .addend
            .ok_or_else(|| format!("hexagon relocation at {:#x} lacks an addend", r.offset))?;
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
        if loc.len() < 4 {
            return Err("fixup runs past section end".to_string());
        }
        let e = Endian::Little;
        let external = matches!(ctx.style, ApplyStyle::Relocatable { external: true });
        let s = if external { 0i64 } else { ctx.target_va as i64 };
        let v = s + ctx.addend;
        let p = ctx.fixup_va as i64;
        let insn = e.read_u32(loc, 0);
        let patched = match kind.0 {
            R_HEX_32 => v as u32,
            R_HEX_B22_PCREL | R_HEX_B15_PCREL => {
                let disp = (v - p) >> 2;
                let bits = if kind.0 == R_HEX_B22_PCREL { 22 } else { 15 };
                let range = 1i64 << (bits - 1);
                if disp >= range || disp < -range {
                    return Err(format!(
                        "relocation out of range: hexagon branch displacement {:#x} exceeds {} bits",
                        disp, bits
                    ));
                }
                let mask = mask_for(kind.0);
                (insn & !mask) | scatter_bits(disp as u32, mask)
            }
            R_HEX_LO16 => (insn & !MASK_16) | scatter_bits(v as u32 & 0xffff, MASK_16),
            R_HEX_HI16 => (insn & !MASK_16) | scatter_bits((v as u32 >> 16) & 0xffff, MASK_16),
            R_HEX_GPREL16_0 | R_HEX_GPREL16_1 | R_HEX_GPREL16_2 | R_HEX_GPREL16_3 => {
                let shift = kind.0 - R_HEX_GPREL16_0;
                let rel = (v - ctx.got_va as i64) >> shift;
                (insn & !MASK_16) | scatter_bits(rel as u32 & 0xffff, MASK_16)
            }
            other => return Err(format!("unsupported hexagon relocation type {}", other)),
        };
        e.write_u32(loc, 0, patched);
        Ok(())
    }

    fn demand(&self, _kind: RelocKind) -> Demand {
        Demand::None
    }

    /// Small data lands in `.sdata` regardless of the input section name so
    /// the GP-relative addressing budget holds.
    fn output_section_for(&self, name: &str, content: ContentType) -> Option<&'static str> {
        if content == ContentType::DataFast || name.starts_with(".scommon") {
            Some(".sdata")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_gather_round_trip() {
        for &v in &[0u32, 1, 0x1fff, 0x003f_ffff, 0xa5a5] {
            let scattered = scatter_bits(v, MASK_B22);
            assert_eq!(scattered & !MASK_B22, 0);
            assert_eq!(gather_bits(scattered, MASK_B22), v & ((1 << MASK_B22.count_ones()) - 1));
        }
    }

    #[test]
    fn b22_displacement_round_trip() {
        let mut loc = [0u8; 4];
        let mut t = false;
        HANDLER
            .apply(
                RelocKind(R_HEX_B22_PCREL),
                &mut loc,
                &FixupCtx {
                    fixup_va: 0x1000,
                    target_va: 0x2000,
                    in_atom_va: 0,
                    got_va: 0,
                    addend: 0,
                    style: ApplyStyle::Final,
                },
                &mut t,
            )
            .unwrap();
        let insn = u32::from_le_bytes(loc);
        assert_eq!(gather_bits(insn, MASK_B22), 0x1000 >> 2);
    }

    #[test]
    fn hi_lo_split() {
        let mut lo = [0u8; 4];
        let mut hi = [0u8; 4];
        let mut t = false;
        let ctx = FixupCtx {
            fixup_va: 0,
            target_va: 0x1234_5678,
            in_atom_va: 0,
            got_va: 0,
            addend: 0,
            style: ApplyStyle::Final,
        };
        HANDLER.apply(RelocKind(R_HEX_LO16), &mut lo, &ctx, &mut t).unwrap();
        HANDLER.apply(RelocKind(R_HEX_HI16), &mut hi, &ctx, &mut t).unwrap();
        assert_eq!(gather_bits(u32::from_le_bytes(lo), MASK_16), 0x5678);
        assert_eq!(gather_bits(u32::from_le_bytes(hi), MASK_16), 0x1234);
    }

    #[test]
    fn gprel_is_shifted_and_gp_relative() {
        let mut loc = [0u8; 4];
        let mut t = false;
        HANDLER
            .apply(
                RelocKind(R_HEX_GPREL16_2),
                &mut loc,
                &FixupCtx {
                    fixup_va: 0,
                    target_va: 0x8040,
                    in_atom_va: 0,
                    got_va: 0x8000,
                    addend: 0,
                    style: ApplyStyle::Final,
                },
                &mut t,
            )
            .unwrap();
        assert_eq!(gather_bits(u32::from_le_bytes(loc), MASK_16), 0x40 >> 2);
    }

    #[test]
    fn small_data_routes_to_sdata() {
        assert_eq!(
            HANDLER.output_section_for(".sdata.x", ContentType::DataFast),
            Some(".sdata")
        );
        assert_eq!(HANDLER.output_section_for(".data", ContentType::Data), None);
    }

    #[test]
    fn b22_out_of_range() {
        let mut loc = [0u8; 4];
        let mut t = false;
        let ctx = FixupCtx {
            fixup_va: 0,
            target_va: 0x80_0000,
            in_atom_va: 0,
            got_va: 0,
            addend: 0,
            style: ApplyStyle::Final,
        };
        assert!(HANDLER.apply(RelocKind(R_HEX_B22_PCREL), &mut loc, &ctx, &mut t).is_err());
    }
}

//! x86-64 relocation handling.
//!
//! Input records are RELA, so decoding is a table lookup plus a footprint
//! check; all the interest is in the apply table and the signed-range
//! checks on the 32-bit forms.

use crate::elf::{Endian, EM_X86_64};
use crate::sections::RelocKind;
use crate::target::{
    ApplyStyle, Decoded, DecodedTarget, Demand, FixupCtx, PltTemplate, RawReloc, RelocHandler,
};

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_GOT32: u32 = 3;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_GOTPCREL: u32 = 9;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;
pub const R_X86_64_16: u32 = 12;
pub const R_X86_64_PC16: u32 = 13;
pub const R_X86_64_8: u32 = 14;
pub const R_X86_64_PC8: u32 = 15;
pub const R_X86_64_PC64: u32 = 24;
pub const R_X86_64_GOTPCRELX: u32 = 41;
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;

pub struct X86_64Handler;

pub static HANDLER: X86_64Handler = X86_64Handler;

fn is_known(rtype: u32) -> bool {
    matches!(
        rtype,
        R_X86_64_NONE
            | R_X86_64_64
            | R_X86_64_PC32
            | R_X86_64_GOT32
            | R_X86_64_PLT32
            | R_X86_64_GOTPCREL
            | R_X86_64_32
            | R_X86_64_32S
            | R_X86_64_16
            | R_X86_64_PC16
            | R_X86_64_8
            | R_X86_64_PC8
            | R_X86_64_PC64
            | R_X86_64_GOTPCRELX
            | R_X86_64_REX_GOTPCRELX
    )
}

impl RelocHandler for X86_64Handler {
    fn machine(&self) -> u16 {
        EM_X86_64
    }

    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn is_call_site(&self, kind: RelocKind) -> bool {
        kind.0 == R_X86_64_PLT32
    }

    fn is_pointer(&self, kind: RelocKind) -> bool {
        kind.0 == R_X86_64_64
    }

    fn is_paired(&self, _rtype: u32) -> bool {
        false
    }

    fn footprint(&self, kind: RelocKind) -> u64 {
        match kind.0 {
            R_X86_64_NONE => 0,
            R_X86_64_64 | R_X86_64_PC64 => 8,
            R_X86_64_16 | R_X86_64_PC16 => 2,
            R_X86_64_8 | R_X86_64_PC8 => 1,
            _ => 4,
        }
    }

    fn decode_one(&self, raws: &[RawReloc], i: usize, _bytes: &[u8]) -> Result<Decoded, String> {
        let r = raws[i];
        if !is_known(r.rtype) {
            return Err(format!("unsupported x86_64 relocation type {} at {:#x}", r.rtype, r.offset));
        }
        let addend = r
            .addend
            .ok_or_else(|| format!("x86_64 relocation at {:#x} lacks an addend", r.offset))?;
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
        // External relocatable stores are computed against the addend alone;
        // the eventual consumer re-applies the record with the real target.
        let s = if external { 0i64 } else { ctx.target_va as i64 };
        let a = ctx.addend;
        let p = ctx.fixup_va as i64;
        let width = self.footprint(kind) as usize;
        if loc.len() < width {
            return Err("fixup runs past section end".to_string());
        }
        match kind.0 {
            R_X86_64_NONE => {}
            R_X86_64_64 => e.write_u64(loc, 0, (s + a) as u64),
            R_X86_64_PC64 => e.write_u64(loc, 0, (s + a - p) as u64),
            R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX
            | R_X86_64_REX_GOTPCRELX => {
                let v = s + a - p;
                if v > i32::MAX as i64 || v < i32::MIN as i64 {
                    return Err(format!("relocation out of range: PC32 value {:#x}", v));
                }
                e.write_u32(loc, 0, v as u32);
            }
            R_X86_64_GOT32 => {
                let v = s + a - ctx.got_va as i64;
                e.write_u32(loc, 0, v as u32);
            }
            R_X86_64_32 => {
                let v = s + a;
                if v > u32::MAX as i64 || v < 0 {
                    return Err(format!("relocation out of range: R_X86_64_32 value {:#x}", v));
                }
                e.write_u32(loc, 0, v as u32);
            }
            R_X86_64_32S => {
                let v = s + a;
                if v > i32::MAX as i64 || v < i32::MIN as i64 {
                    return Err(format!("relocation out of range: R_X86_64_32S value {:#x}", v));
                }
                e.write_u32(loc, 0, v as u32);
            }
            R_X86_64_16 => e.write_u16(loc, 0, (s + a) as u16),
            R_X86_64_PC16 => e.write_u16(loc, 0, (s + a - p) as u16),
            R_X86_64_8 => loc[0] = (s + a) as u8,
            R_X86_64_PC8 => loc[0] = (s + a - p) as u8,
            other => return Err(format!("unsupported x86_64 relocation type {}", other)),
        }
        Ok(())
    }

    fn demand(&self, kind: RelocKind) -> Demand {
        match kind.0 {
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX | R_X86_64_GOT32 => {
                Demand::Got
            }
            R_X86_64_PLT32 => Demand::Plt,
            _ => Demand::None,
        }
    }

    fn plt_template(&self) -> PltTemplate {
        // Header: push GOT+8; jmp *GOT+16; entry: jmp *slot; push idx; jmp plt0
        static HEADER: [u8; 16] = [
            0xff, 0x35, 0x00, 0x00, 0x00, 0x00, //
            0xff, 0x25, 0x00, 0x00, 0x00, 0x00, //
            0x0f, 0x1f, 0x40, 0x00,
        ];
        static ENTRY: [u8; 16] = [
            0xff, 0x25, 0x00, 0x00, 0x00, 0x00, //
            0x68, 0x00, 0x00, 0x00, 0x00, //
            0xe9, 0x00, 0x00, 0x00, 0x00,
        ];
        PltTemplate { header: &HEADER, entry: &ENTRY, align: 16 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(fixup: u64, target: u64, addend: i64) -> FixupCtx {
        FixupCtx {
            fixup_va: fixup,
            target_va: target,
            in_atom_va: 0,
            got_va: 0,
            addend,
            style: ApplyStyle::Final,
        }
    }

    #[test]
    fn pointer64_and_pc32() {
        let mut t = false;
        let mut loc = [0u8; 8];
        HANDLER.apply(RelocKind(R_X86_64_64), &mut loc, &ctx(0, 0x40_1234, 8), &mut t).unwrap();
        assert_eq!(u64::from_le_bytes(loc), 0x40_123c);

        let mut loc = [0u8; 4];
        HANDLER
            .apply(RelocKind(R_X86_64_PC32), &mut loc, &ctx(0x40_1000, 0x40_2000, -4), &mut t)
            .unwrap();
        assert_eq!(i32::from_le_bytes(loc), 0xffc);
    }

    #[test]
    fn pc32_round_trips_through_decode() {
        // decode(apply(K, T)) == T up to the field width.
        let raws = [RawReloc::simple(0, R_X86_64_PC32, 1, Some(-4))];
        let d = HANDLER.decode_one(&raws, 0, &[]).unwrap();
        assert_eq!(d.kind, RelocKind(R_X86_64_PC32));
        assert_eq!(d.addend, -4);
        let mut t = false;
        let mut loc = [0u8; 4];
        HANDLER.apply(d.kind, &mut loc, &ctx(0x1000, 0x9000, d.addend), &mut t).unwrap();
        let stored = i32::from_le_bytes(loc) as i64;
        assert_eq!(stored + 0x1000 - d.addend, 0x9000);
    }

    #[test]
    fn unsigned_32_overflow_is_a_layout_error() {
        let mut t = false;
        let mut loc = [0u8; 4];
        let err = HANDLER
            .apply(RelocKind(R_X86_64_32), &mut loc, &ctx(0, 0x1_0000_0000, 0), &mut t)
            .unwrap_err();
        assert!(err.contains("out of range"));
        assert!(HANDLER
            .apply(RelocKind(R_X86_64_32S), &mut loc, &ctx(0, 0x8000_0000, 0), &mut t)
            .is_err());
        assert!(HANDLER
            .apply(RelocKind(R_X86_64_32), &mut loc, &ctx(0, 0x8000_0000, 0), &mut t)
            .is_ok());
    }

    #[test]
    fn relocatable_external_ignores_target() {
        let mut t = false;
        let mut loc = [0u8; 4];
        HANDLER
            .apply(
                RelocKind(R_X86_64_PC32),
                &mut loc,
                &FixupCtx {
                    fixup_va: 0x10,
                    target_va: 0xdead_beef,
                    in_atom_va: 0,
                    got_va: 0,
                    addend: -4,
                    style: ApplyStyle::Relocatable { external: true },
                },
                &mut t,
            )
            .unwrap();
        assert_eq!(i32::from_le_bytes(loc), -4 - 0x10);
    }

    #[test]
    fn rela_without_addend_is_an_input_error() {
        let raws = [RawReloc::simple(0, R_X86_64_64, 1, None)];
        assert!(HANDLER.decode_one(&raws, 0, &[]).unwrap_err().contains("addend"));
    }
}

//! MIPS relocation handling (o32, either endianness).
//!
//! REL input with the HI16/LO16 composed addend: a HI16 record must be
//! followed by its LO16 partner, and AHL = (hi16 << 16) + (short)lo16 is the
//! addend of both. The HI16 store rounds so that the sign-extended LO16
//! reconstitutes the full value. Float-ABI compatibility between objects is
//! validated here because the bits live in e_flags.

use crate::elf::{Endian, EF_MIPS_FP64, EM_MIPS};
use crate::sections::RelocKind;
use crate::target::{
    ApplyStyle, Decoded, DecodedTarget, Demand, FixupCtx, PltTemplate, RawReloc, RelocHandler,
};

pub const R_MIPS_NONE: u32 = 0;
pub const R_MIPS_32: u32 = 2;
pub const R_MIPS_26: u32 = 4;
pub const R_MIPS_HI16: u32 = 5;
pub const R_MIPS_LO16: u32 = 6;
pub const R_MIPS_GPREL16: u32 = 7;

pub struct MipsHandler {
    endian: Endian,
}

pub static HANDLER_BE: MipsHandler = MipsHandler { endian: Endian::Big };
pub static HANDLER_LE: MipsHandler = MipsHandler { endian: Endian::Little };

impl MipsHandler {
    fn read_insn(&self, bytes: &[u8], off: u64) -> Result<u32, String> {
        let off = off as usize;
        if off + 4 > bytes.len() {
            return Err(format!("relocation at {:#x} runs past section end", off));
        }
        Ok(self.endian.read_u32(bytes, off))
    }
}

impl RelocHandler for MipsHandler {
    fn machine(&self) -> u16 {
        EM_MIPS
    }

    fn endian(&self) -> Endian {
        self.endian
    }

    fn name(&self) -> &'static str {
        "mips"
    }

    fn is_call_site(&self, kind: RelocKind) -> bool {
        kind.0 == R_MIPS_26
    }

    fn is_pointer(&self, kind: RelocKind) -> bool {
        kind.0 == R_MIPS_32
    }

    fn is_paired(&self, rtype: u32) -> bool {
        rtype == R_MIPS_HI16
    }

    fn footprint(&self, kind: RelocKind) -> u64 {
        if kind.0 == R_MIPS_NONE {
            0
        } else {
            4
        }
    }

    fn decode_one(&self, raws: &[RawReloc], i: usize, bytes: &[u8]) -> Result<Decoded, String> {
        let r = raws[i];
        match r.rtype {
            R_MIPS_NONE => Ok(Decoded {
                offset: r.offset,
                kind: RelocKind(R_MIPS_NONE),
                addend: 0,
                target: DecodedTarget::Symbol(r.sym),
                consumed: 1,
            }),
            R_MIPS_32 => {
                let addend = match r.addend {
                    Some(a) => a,
                    None => self.read_insn(bytes, r.offset)? as i32 as i64,
                };
                Ok(Decoded {
                    offset: r.offset,
                    kind: RelocKind(R_MIPS_32),
                    addend,
                    target: DecodedTarget::Symbol(r.sym),
                    consumed: 1,
                })
            }
            R_MIPS_26 => {
                let insn = self.read_insn(bytes, r.offset)?;
                let addend = match r.addend {
                    Some(a) => a,
                    None => ((insn & 0x03ff_ffff) << 2) as i64,
                };
                Ok(Decoded {
                    offset: r.offset,
                    kind: RelocKind(R_MIPS_26),
                    addend,
                    target: DecodedTarget::Symbol(r.sym),
                    consumed: 1,
                })
            }
            R_MIPS_HI16 => {
                // The composed addend needs the partner LO16's low half.
                let lo = match raws.get(i + 1) {
                    Some(p) if p.rtype == R_MIPS_LO16 => *p,
                    _ => {
                        return Err(format!(
                            "R_MIPS_HI16 at {:#x} not followed by R_MIPS_LO16",
                            r.offset
                        ))
                    }
                };
                let hi16 = (self.read_insn(bytes, r.offset)? & 0xffff) as i64;
                let lo16 = (self.read_insn(bytes, lo.offset)? & 0xffff) as u16 as i16 as i64;
                let ahl = (hi16 << 16) + lo16;
                Ok(Decoded {
                    offset: r.offset,
                    kind: RelocKind(R_MIPS_HI16),
                    addend: ahl,
                    target: DecodedTarget::Symbol(r.sym),
                    consumed: 1,
                })
            }
            R_MIPS_LO16 => {
                // With a preceding HI16 the pair shares AHL; a lone LO16
                // carries only its sign-extended half.
                let lo16 = (self.read_insn(bytes, r.offset)? & 0xffff) as u16 as i16 as i64;
                let addend = if i > 0 && raws[i - 1].rtype == R_MIPS_HI16 {
                    let hi16 = (self.read_insn(bytes, raws[i - 1].offset)? & 0xffff) as i64;
                    (hi16 << 16) + lo16
                } else {
                    lo16
                };
                Ok(Decoded {
                    offset: r.offset,
                    kind: RelocKind(R_MIPS_LO16),
                    addend,
                    target: DecodedTarget::Symbol(r.sym),
                    consumed: 1,
                })
            }
            R_MIPS_GPREL16 => {
                let addend = match r.addend {
                    Some(a) => a,
                    None => (self.read_insn(bytes, r.offset)? & 0xffff) as u16 as i16 as i64,
                };
                Ok(Decoded {
                    offset: r.offset,
                    kind: RelocKind(R_MIPS_GPREL16),
                    addend,
                    target: DecodedTarget::Symbol(r.sym),
                    consumed: 1,
                })
            }
            other => Err(format!("unsupported mips relocation type {} at {:#x}", other, r.offset)),
        }
    }

    fn apply(
        &self,
        kind: RelocKind,
        loc: &mut [u8],
        ctx: &FixupCtx,
        _thumb: &mut bool,
    ) -> Result<(), String> {
        if kind.0 == R_MIPS_NONE {
            return Ok(());
        }
        if loc.len() < 4 {
            return Err("fixup runs past section end".to_string());
        }
        let e = self.endian;
        let external = matches!(ctx.style, ApplyStyle::Relocatable { external: true });
        let s = if external { 0i64 } else { ctx.target_va as i64 };
        let ahl = ctx.addend;
        let p = ctx.fixup_va as i64;
        let insn = e.read_u32(loc, 0);
        let patched = match kind.0 {
            R_MIPS_32 => (s + ahl) as u32,
            R_MIPS_26 => {
                let v = (((ahl as u64 | (p as u64 & 0xf000_0000)) as i64) + s) >> 2;
                (insn & 0xfc00_0000) | (v as u32 & 0x03ff_ffff)
            }
            R_MIPS_HI16 => {
                // Round so the sign-extended LO16 carries back correctly.
                let v = ((ahl + s + 0x8000) >> 16) as u32 & 0xffff;
                (insn & 0xffff_0000) | v
            }
            R_MIPS_LO16 => {
                let v = (ahl + s) as u32 & 0xffff;
                (insn & 0xffff_0000) | v
            }
            R_MIPS_GPREL16 => {
                let v = (s + ahl - ctx.got_va as i64) as u32 & 0xffff;
                (insn & 0xffff_0000) | v
            }
            other => return Err(format!("unsupported mips relocation type {}", other)),
        };
        e.write_u32(loc, 0, patched);
        Ok(())
    }

    fn demand(&self, _kind: RelocKind) -> Demand {
        Demand::None
    }

    fn validate_flags(&self, file: &str, flags: u32, first: u32) -> Result<(), String> {
        let fp = |f: u32| if f & EF_MIPS_FP64 != 0 { "-mfp64" } else { "-mdouble-float" };
        if (flags ^ first) & EF_MIPS_FP64 != 0 {
            return Err(format!(
                "{}: floating point ABI {} is incompatible with target floating point ABI {}",
                file,
                fp(flags),
                fp(first)
            ));
        }
        Ok(())
    }

    fn plt_template(&self) -> PltTemplate {
        PltTemplate { header: &[], entry: &[], align: 16 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raws_hi_lo() -> [RawReloc; 2] {
        [
            RawReloc { addend: None, ..RawReloc::simple(0, R_MIPS_HI16, 1, None) },
            RawReloc { addend: None, ..RawReloc::simple(4, R_MIPS_LO16, 1, None) },
        ]
    }

    fn apply_be(kind: u32, loc: &mut [u8], target: u64, ahl: i64) {
        let mut t = false;
        HANDLER_BE
            .apply(
                RelocKind(kind),
                loc,
                &FixupCtx {
                    fixup_va: 0,
                    target_va: target,
                    in_atom_va: 0,
                    got_va: 0,
                    addend: ahl,
                    style: ApplyStyle::Final,
                },
                &mut t,
            )
            .unwrap();
    }

    #[test]
    fn hi_lo_pair_composes_ahl() {
        // lui at 0 holds hi16 = 1, addiu at 4 holds lo16 = -4 (0xfffc):
        // AHL = 0x10000 - 4 = 0xfffc.
        let mut bytes = vec![0u8; 8];
        Endian::Big.write_u32(&mut bytes, 0, 0x3c04_0001);
        Endian::Big.write_u32(&mut bytes, 4, 0x2484_fffc);
        let raws = raws_hi_lo();
        let hi = HANDLER_BE.decode_one(&raws, 0, &bytes).unwrap();
        let lo = HANDLER_BE.decode_one(&raws, 1, &bytes).unwrap();
        assert_eq!(hi.addend, 0xfffc);
        assert_eq!(lo.addend, 0xfffc);
        assert_eq!(hi.consumed, 1);
    }

    #[test]
    fn hi16_rounds_for_the_lo16_carry() {
        // S + AHL = 0x1_8000: the LO16 store is 0x8000 which sign-extends to
        // -0x8000, so HI16 must round up to 2.
        let mut hi = vec![0u8; 4];
        Endian::Big.write_u32(&mut hi, 0, 0x3c04_0000);
        apply_be(R_MIPS_HI16, &mut hi, 0x1_8000, 0);
        assert_eq!(Endian::Big.read_u32(&hi, 0) & 0xffff, 2);

        let mut lo = vec![0u8; 4];
        Endian::Big.write_u32(&mut lo, 0, 0x2484_0000);
        apply_be(R_MIPS_LO16, &mut lo, 0x1_8000, 0);
        assert_eq!(Endian::Big.read_u32(&lo, 0) & 0xffff, 0x8000);

        // (hi << 16) + (short)lo reconstitutes the value.
        let hi_v = (Endian::Big.read_u32(&hi, 0) & 0xffff) as i64;
        let lo_v = (Endian::Big.read_u32(&lo, 0) & 0xffff) as u16 as i16 as i64;
        assert_eq!((hi_v << 16) + lo_v, 0x1_8000);
    }

    #[test]
    fn unpaired_hi16_is_an_error() {
        let bytes = vec![0u8; 4];
        let raws = [RawReloc { addend: None, ..RawReloc::simple(0, R_MIPS_HI16, 1, None) }];
        assert!(HANDLER_BE.decode_one(&raws, 0, &bytes).unwrap_err().contains("LO16"));
    }

    #[test]
    fn jump26_keeps_the_region_bits() {
        let mut loc = vec![0u8; 4];
        Endian::Big.write_u32(&mut loc, 0, 0x0c00_0000);
        let mut t = false;
        HANDLER_BE
            .apply(
                RelocKind(R_MIPS_26),
                &mut loc,
                &FixupCtx {
                    fixup_va: 0x4000_1000,
                    target_va: 0x4040_0000,
                    in_atom_va: 0,
                    got_va: 0,
                    addend: 0,
                    style: ApplyStyle::Final,
                },
                &mut t,
            )
            .unwrap();
        let insn = Endian::Big.read_u32(&loc, 0);
        assert_eq!(insn & 0x03ff_ffff, 0x0040_0000 >> 2 | (0x4000_0000 >> 2) & 0x03ff_ffff);
    }

    #[test]
    fn float_abi_mismatch_is_fatal() {
        let err = HANDLER_BE.validate_flags("b.o", EF_MIPS_FP64, 0).unwrap_err();
        assert!(err.contains("floating point ABI"), "{}", err);
        assert!(err.contains("-mfp64") && err.contains("-mdouble-float"));
        assert!(HANDLER_BE.validate_flags("b.o", EF_MIPS_FP64, EF_MIPS_FP64).is_ok());
    }
}

//! i386 relocation handling.
//!
//! i386 objects use REL records, so every addend is reconstructed from the
//! four bytes in situ. GOT-relative forms take the GOT base from the fixup
//! context.

use crate::elf::{Endian, EM_386};
use crate::sections::RelocKind;
use crate::target::{
    ApplyStyle, Decoded, DecodedTarget, Demand, FixupCtx, PltTemplate, RawReloc, RelocHandler,
};

pub const R_386_NONE: u32 = 0;
pub const R_386_32: u32 = 1;
pub const R_386_PC32: u32 = 2;
pub const R_386_GOT32: u32 = 3;
pub const R_386_PLT32: u32 = 4;
pub const R_386_GOTOFF: u32 = 9;
pub const R_386_GOTPC: u32 = 10;

pub struct I386Handler;

pub static HANDLER: I386Handler = I386Handler;

impl RelocHandler for I386Handler {
    fn machine(&self) -> u16 {
        EM_386
    }

    fn name(&self) -> &'static str {
        "i386"
    }

    fn is_call_site(&self, kind: RelocKind) -> bool {
        kind.0 == R_386_PLT32
    }

    fn is_pointer(&self, kind: RelocKind) -> bool {
        kind.0 == R_386_32
    }

    fn is_paired(&self, _rtype: u32) -> bool {
        false
    }

    fn footprint(&self, kind: RelocKind) -> u64 {
        if kind.0 == R_386_NONE {
            0
        } else {
            4
        }
    }

    fn decode_one(&self, raws: &[RawReloc], i: usize, bytes: &[u8]) -> Result<Decoded, String> {
        let r = raws[i];
        if !matches!(
            r.rtype,
            R_386_NONE | R_386_32 | R_386_PC32 | R_386_GOT32 | R_386_PLT32 | R_386_GOTOFF
                | R_386_GOTPC
        ) {
            return Err(format!("unsupported i386 relocation type {} at {:#x}", r.rtype, r.offset));
        }
        let addend = match r.addend {
            Some(a) => a,
            None => {
                let off = r.offset as usize;
                if off + 4 > bytes.len() {
                    return Err(format!("relocation at {:#x} runs past section end", r.offset));
                }
                Endian::Little.read_i32(bytes, off) as i64
            }
        };
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
        if kind.0 == R_386_NONE {
            return Ok(());
        }
        if loc.len() < 4 {
            return Err("fixup runs past section end".to_string());
        }
        let external = matches!(ctx.style, ApplyStyle::Relocatable { external: true });
        let s = if external { 0i64 } else { ctx.target_va as i64 };
        let a = ctx.addend;
        let p = ctx.fixup_va as i64;
        let got = ctx.got_va as i64;
        let v = match kind.0 {
            R_386_32 => s + a,
            R_386_PC32 | R_386_PLT32 => s + a - p,
            R_386_GOT32 => s + a - got,
            R_386_GOTOFF => s + a - got,
            R_386_GOTPC => got + a - p,
            other => return Err(format!("unsupported i386 relocation type {}", other)),
        };
        Endian::Little.write_u32(loc, 0, v as u32);
        Ok(())
    }

    fn demand(&self, kind: RelocKind) -> Demand {
        match kind.0 {
            R_386_GOT32 => Demand::Got,
            R_386_PLT32 => Demand::Plt,
            _ => Demand::None,
        }
    }

    fn plt_template(&self) -> PltTemplate {
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

    #[test]
    fn implicit_addend_comes_from_the_bytes() {
        let mut bytes = vec![0u8; 8];
        bytes[4..8].copy_from_slice(&(-12i32).to_le_bytes());
        let raws = [RawReloc { addend: None, ..RawReloc::simple(4, R_386_PC32, 2, None) }];
        let d = HANDLER.decode_one(&raws, 0, &bytes).unwrap();
        assert_eq!(d.addend, -12);
        assert_eq!(d.kind, RelocKind(R_386_PC32));
    }

    #[test]
    fn gotpc_is_got_relative() {
        let mut t = false;
        let mut loc = [0u8; 4];
        let ctx = FixupCtx {
            fixup_va: 0x1000,
            target_va: 0,
            in_atom_va: 0,
            got_va: 0x3000,
            addend: 2,
            style: ApplyStyle::Final,
        };
        HANDLER.apply(RelocKind(R_386_GOTPC), &mut loc, &ctx, &mut t).unwrap();
        assert_eq!(u32::from_le_bytes(loc), 0x2002);
    }

    #[test]
    fn abs32_round_trip() {
        let mut t = false;
        let mut loc = [0u8; 4];
        let ctx = FixupCtx {
            fixup_va: 0,
            target_va: 0x0804_8000,
            in_atom_va: 0,
            got_va: 0,
            addend: 0x10,
            style: ApplyStyle::Final,
        };
        HANDLER.apply(RelocKind(R_386_32), &mut loc, &ctx, &mut t).unwrap();
        // Re-decoding the patched bytes yields target + addend as the new
        // implicit addend.
        let raws = [RawReloc { addend: None, ..RawReloc::simple(0, R_386_32, 0, None) }];
        let d = HANDLER.decode_one(&raws, 0, &loc).unwrap();
        assert_eq!(d.addend, 0x0804_8010);
    }
}

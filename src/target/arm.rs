//! ARM (A32/T32) relocation handling.
//!
//! The decoder accepts the union of the plain record types and the
//! scattered/paired forms (SECTDIFF, HALF, HALF_SECTDIFF) and reconstructs
//! addends from the instruction bits. Application is bit-exact for both the
//! final and relocatable paths; the relocatable path also reproduces the
//! scattered/external/paired record shapes on the way out.
//!
//! Instruction mode (ARM vs Thumb) is threaded through a section's reference
//! walk as a mutable flag, toggled by the mode pseudo-references the reader
//! plants at function boundaries. Thumb-kind fixups on an ARM-mode site are
//! reported, not silently encoded.

use crate::elf::{Endian, EM_ARM};
use crate::sections::{ContentType, RelocKind};
use crate::target::{
    check_branch_range, ApplyStyle, Decoded, DecodedTarget, Demand, FixupCtx, PltTemplate,
    RawReloc, RelocHandler,
};

// ── Engine relocation kinds ──────────────────────────────────────────────────

pub const MODE_THUMB_CODE: RelocKind = RelocKind(0);
pub const MODE_ARM_CODE: RelocKind = RelocKind(1);
pub const THUMB_B22: RelocKind = RelocKind(2);
pub const THUMB_MOVW: RelocKind = RelocKind(3);
pub const THUMB_MOVT: RelocKind = RelocKind(4);
pub const THUMB_MOVW_FUNC_REL: RelocKind = RelocKind(5);
pub const THUMB_MOVT_FUNC_REL: RelocKind = RelocKind(6);
pub const ARM_B24: RelocKind = RelocKind(7);
pub const ARM_MOVW: RelocKind = RelocKind(8);
pub const ARM_MOVT: RelocKind = RelocKind(9);
pub const ARM_MOVW_FUNC_REL: RelocKind = RelocKind(10);
pub const ARM_MOVT_FUNC_REL: RelocKind = RelocKind(11);
pub const POINTER32: RelocKind = RelocKind(12);
pub const DELTA32: RelocKind = RelocKind(13);

// ── Raw record types ─────────────────────────────────────────────────────────
//
// Scattered/paired space (discriminated by the scattered and pcrel flags
// where values collide with the plain types below).

pub const REL_VANILLA: u32 = 0;
pub const REL_PAIR: u32 = 1;
pub const REL_SECTDIFF: u32 = 2;
pub const REL_LOCAL_SECTDIFF: u32 = 3;
pub const REL_BR24: u32 = 5;
pub const REL_THUMB_BR22: u32 = 6;
pub const REL_HALF: u32 = 8;
pub const REL_HALF_SECTDIFF: u32 = 9;

// HALF length bits: which immediate half and which instruction set.
pub const LEN_ARM_LO: u8 = 0;
pub const LEN_ARM_HI: u8 = 1;
pub const LEN_THUMB_LO: u8 = 2;
pub const LEN_THUMB_HI: u8 = 3;

// Plain types (ELF numbering).
pub const R_ARM_ABS32: u32 = 2;
pub const R_ARM_REL32: u32 = 3;
pub const R_ARM_THM_CALL: u32 = 10;
pub const R_ARM_CALL: u32 = 28;
pub const R_ARM_JUMP24: u32 = 29;
pub const R_ARM_MOVW_ABS_NC: u32 = 43;
pub const R_ARM_MOVT_ABS: u32 = 44;
pub const R_ARM_THM_MOVW_ABS_NC: u32 = 47;
pub const R_ARM_THM_MOVT_ABS: u32 = 48;

// ── Instruction field helpers ────────────────────────────────────────────────

fn read_u32(bytes: &[u8], off: usize) -> Result<u32, String> {
    if off + 4 > bytes.len() {
        return Err(format!("relocation at {:#x} runs past section end", off));
    }
    Ok(Endian::Little.read_u32(bytes, off))
}

/// Sign-extended displacement of an A32 branch (imm24 << 2, BLX H-bit).
pub fn displacement_from_arm_branch(instruction: u32) -> i32 {
    let mut displacement = ((instruction & 0x00ff_ffff) << 2) as i32;
    if displacement & 0x0200_0000 != 0 {
        displacement |= 0xfc00_0000u32 as i32;
    }
    if instruction & 0xff00_0000 == 0xfb00_0000 {
        displacement += 2;
    }
    displacement
}

pub fn set_displacement_in_arm_branch(instruction: u32, displacement: i32) -> u32 {
    (instruction & 0xff00_0000) | (((displacement >> 2) as u32) & 0x00ff_ffff)
}

/// Split-field displacement of a T32 BL, with the inverted J bits undone.
/// The instruction is read as one little-endian word, first halfword in the
/// low bits.
pub fn displacement_from_thumb_branch(instruction: u32) -> i32 {
    let s = (instruction >> 10) & 0x1;
    let j1 = (instruction >> 29) & 0x1;
    let j2 = (instruction >> 27) & 0x1;
    let imm10 = instruction & 0x3ff;
    let imm11 = (instruction >> 16) & 0x7ff;
    let i1 = (j1 == s) as u32;
    let i2 = (j2 == s) as u32;
    let dis = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1);
    if s != 0 {
        (dis | 0xfe00_0000) as i32
    } else {
        dis as i32
    }
}

pub fn set_displacement_in_thumb_branch(instruction: u32, displacement: i32) -> u32 {
    let base = instruction & 0xf800_d000;
    let s = ((displacement >> 24) as u32) & 0x1;
    let i1 = ((displacement >> 23) as u32) & 0x1;
    let i2 = ((displacement >> 22) as u32) & 0x1;
    let imm10 = ((displacement >> 12) as u32) & 0x3ff;
    let imm11 = ((displacement >> 1) as u32) & 0x7ff;
    let j1 = (i1 == s) as u32;
    let j2 = (i2 == s) as u32;
    let next_disp = (j1 << 13) | (j2 << 11) | imm11;
    let first_disp = (s << 10) | imm10;
    base | (next_disp << 16) | first_disp
}

/// Immediate of a T32 MOVW/MOVT: i/imm4 in the first halfword, imm3/imm8 in
/// the second.
pub fn word_from_thumb_mov(instruction: u32) -> u16 {
    let i = (instruction & 0x0000_0400) >> 10;
    let imm4 = instruction & 0x0000_000f;
    let imm3 = (instruction & 0x7000_0000) >> 28;
    let imm8 = (instruction & 0x00ff_0000) >> 16;
    ((imm4 << 12) | (i << 11) | (imm3 << 8) | imm8) as u16
}

pub fn set_word_in_thumb_mov(instruction: u32, word: u16) -> u32 {
    let word = word as u32;
    let imm4 = (word & 0xf000) >> 12;
    let i = (word & 0x0800) >> 11;
    let imm3 = (word & 0x0700) >> 8;
    let imm8 = word & 0x00ff;
    (instruction & 0x8f00_fbf0) | imm4 | (i << 10) | (imm3 << 28) | (imm8 << 16)
}

/// Immediate of an A32 MOVW/MOVT: imm4 in bits [19:16], imm12 in [11:0].
pub fn word_from_arm_mov(instruction: u32) -> u16 {
    let imm4 = (instruction & 0x000f_0000) >> 16;
    let imm12 = instruction & 0x0000_0fff;
    ((imm4 << 12) | imm12) as u16
}

pub fn set_word_in_arm_mov(instruction: u32, word: u16) -> u32 {
    let word = word as u32;
    let imm4 = (word & 0xf000) >> 12;
    let imm12 = word & 0x0fff;
    (instruction & 0xfff0_f000) | (imm4 << 16) | imm12
}

/// Thumb function addresses carry the interworking bit; it must not look
/// like an addend. The caller re-ORs it only for function-pointer forms.
pub fn clear_thumb_bit(value: u32, target_is_thumb: bool) -> u32 {
    if target_is_thumb {
        value & !1
    } else {
        value
    }
}

// ── Handler ──────────────────────────────────────────────────────────────────

pub struct ArmHandler;

pub static HANDLER: ArmHandler = ArmHandler;

fn half_kind(length: u8) -> Result<RelocKind, String> {
    match length {
        LEN_ARM_LO => Ok(ARM_MOVW),
        LEN_ARM_HI => Ok(ARM_MOVT),
        LEN_THUMB_LO => Ok(THUMB_MOVW),
        LEN_THUMB_HI => Ok(THUMB_MOVT),
        other => Err(format!("invalid HALF length bits {}", other)),
    }
}

fn func_rel_kind(length: u8) -> Result<RelocKind, String> {
    match length {
        LEN_ARM_LO => Ok(ARM_MOVW_FUNC_REL),
        LEN_ARM_HI => Ok(ARM_MOVT_FUNC_REL),
        LEN_THUMB_LO => Ok(THUMB_MOVW_FUNC_REL),
        LEN_THUMB_HI => Ok(THUMB_MOVT_FUNC_REL),
        other => Err(format!("invalid HALF_SECTDIFF length bits {}", other)),
    }
}

/// Reassemble the 32-bit value split across a HALF record and its PAIR.
fn full_from_half(word: u16, other16: u16, length: u8) -> u32 {
    match length {
        LEN_ARM_LO | LEN_THUMB_LO => ((other16 as u32) << 16) | word as u32,
        _ => ((word as u32) << 16) | other16 as u32,
    }
}

impl ArmHandler {
    fn expect_pair(raws: &[RawReloc], i: usize, what: &str) -> Result<RawReloc, String> {
        match raws.get(i + 1) {
            Some(p) if p.rtype == REL_PAIR => Ok(*p),
            _ => Err(format!("{} at {:#x} not followed by its PAIR record", what, raws[i].offset)),
        }
    }
}

impl RelocHandler for ArmHandler {
    fn machine(&self) -> u16 {
        EM_ARM
    }

    fn name(&self) -> &'static str {
        "arm"
    }

    fn is_call_site(&self, kind: RelocKind) -> bool {
        kind == ARM_B24 || kind == THUMB_B22
    }

    fn is_pointer(&self, kind: RelocKind) -> bool {
        kind == POINTER32
    }

    fn is_paired(&self, rtype: u32) -> bool {
        matches!(rtype, REL_SECTDIFF | REL_LOCAL_SECTDIFF | REL_HALF_SECTDIFF | REL_HALF)
    }

    fn footprint(&self, kind: RelocKind) -> u64 {
        match kind {
            MODE_THUMB_CODE | MODE_ARM_CODE => 0,
            _ => 4,
        }
    }

    fn decode_one(&self, raws: &[RawReloc], i: usize, bytes: &[u8]) -> Result<Decoded, String> {
        let r = raws[i];
        let offset = r.offset;

        if r.rtype == REL_PAIR {
            return Err(format!("unexpected PAIR relocation at {:#x}", offset));
        }

        // Scattered forms own their type values; the plain type space only
        // collides on values the scattered flag disambiguates.
        if r.scattered {
            match r.rtype {
                REL_SECTDIFF | REL_LOCAL_SECTDIFF => {
                    let pair = Self::expect_pair(raws, i, "SECTDIFF")?;
                    let stored = read_u32(bytes, offset as usize)? as i32 as i64;
                    let to = r.value as i64;
                    let from = pair.value as i64;
                    return Ok(Decoded {
                        offset,
                        kind: DELTA32,
                        addend: stored - (to - from),
                        target: DecodedTarget::Address(r.value),
                        consumed: 2,
                    });
                }
                REL_HALF_SECTDIFF => {
                    let pair = Self::expect_pair(raws, i, "HALF_SECTDIFF")?;
                    let instr = read_u32(bytes, offset as usize)?;
                    let word = if r.length >= LEN_THUMB_LO {
                        word_from_thumb_mov(instr)
                    } else {
                        word_from_arm_mov(instr)
                    };
                    let full = full_from_half(word, pair.offset as u16, r.length);
                    let to = r.value as i64;
                    let from = pair.value as i64;
                    return Ok(Decoded {
                        offset,
                        kind: func_rel_kind(r.length)?,
                        addend: full as i64 - (to - from),
                        target: DecodedTarget::Address(r.value),
                        consumed: 2,
                    });
                }
                REL_HALF => {
                    let pair = Self::expect_pair(raws, i, "HALF")?;
                    let instr = read_u32(bytes, offset as usize)?;
                    let word = if r.length >= LEN_THUMB_LO {
                        word_from_thumb_mov(instr)
                    } else {
                        word_from_arm_mov(instr)
                    };
                    let full = full_from_half(word, pair.offset as u16, r.length) as u64;
                    let (target, addend) = if r.ext {
                        (DecodedTarget::Symbol(r.sym), full as i64)
                    } else {
                        (DecodedTarget::Address(full), 0)
                    };
                    return Ok(Decoded {
                        offset,
                        kind: half_kind(r.length)?,
                        addend,
                        target,
                        consumed: 2,
                    });
                }
                REL_VANILLA => {
                    // Scattered pointer: instruction holds target+addend.
                    let stored = read_u32(bytes, offset as usize)? as i32 as i64;
                    return Ok(Decoded {
                        offset,
                        kind: POINTER32,
                        addend: stored - r.value as i64,
                        target: DecodedTarget::Address(r.value),
                        consumed: 1,
                    });
                }
                REL_BR24 if r.pcrel => {
                    let instr = read_u32(bytes, offset as usize)?;
                    let disp = displacement_from_arm_branch(instr) as i64;
                    let branch_target = offset as i64 + 8 + disp;
                    return Ok(Decoded {
                        offset,
                        kind: ARM_B24,
                        addend: branch_target - r.value as i64,
                        target: DecodedTarget::Address(r.value),
                        consumed: 1,
                    });
                }
                REL_THUMB_BR22 if r.pcrel => {
                    let instr = read_u32(bytes, offset as usize)?;
                    let disp = displacement_from_thumb_branch(instr) as i64;
                    let branch_target = offset as i64 + 4 + disp;
                    return Ok(Decoded {
                        offset,
                        kind: THUMB_B22,
                        addend: branch_target - r.value as i64,
                        target: DecodedTarget::Address(r.value),
                        consumed: 1,
                    });
                }
                other => {
                    return Err(format!(
                        "unsupported scattered relocation type {} at {:#x}",
                        other, offset
                    ))
                }
            }
        }

        // A plain HALF is still a two-record form.
        if r.rtype == REL_HALF && raws.get(i + 1).map_or(false, |p| p.rtype == REL_PAIR) {
            let pair = Self::expect_pair(raws, i, "HALF")?;
            let instr = read_u32(bytes, offset as usize)?;
            let word = if r.length >= LEN_THUMB_LO {
                word_from_thumb_mov(instr)
            } else {
                word_from_arm_mov(instr)
            };
            let full = full_from_half(word, pair.offset as u16, r.length) as u64;
            let (target, addend) = if r.ext {
                (DecodedTarget::Symbol(r.sym), full as i64)
            } else {
                (DecodedTarget::Address(full), 0)
            };
            return Ok(Decoded { offset, kind: half_kind(r.length)?, addend, target, consumed: 2 });
        }

        // Non-scattered pcrel branch forms in the paired record space.
        if r.pcrel && (r.rtype == REL_BR24 || r.rtype == REL_THUMB_BR22) {
            let instr = read_u32(bytes, offset as usize)?;
            let (kind, pc_off, disp) = if r.rtype == REL_BR24 {
                (ARM_B24, 8, displacement_from_arm_branch(instr) as i64)
            } else {
                (THUMB_B22, 4, displacement_from_thumb_branch(instr) as i64)
            };
            if r.ext {
                // Undefined target: instruction branches to the addend.
                return Ok(Decoded {
                    offset,
                    kind,
                    addend: offset as i64 + pc_off + disp,
                    target: DecodedTarget::Symbol(r.sym),
                    consumed: 1,
                });
            }
            return Ok(Decoded {
                offset,
                kind,
                addend: 0,
                target: DecodedTarget::Address((offset as i64 + pc_off + disp) as u64),
                consumed: 1,
            });
        }

        // Plain ELF-numbered types.
        let instr = read_u32(bytes, offset as usize)?;
        let (kind, addend) = match r.rtype {
            R_ARM_ABS32 => (POINTER32, r.addend.unwrap_or(instr as i32 as i64)),
            R_ARM_REL32 => (DELTA32, r.addend.unwrap_or(instr as i32 as i64)),
            R_ARM_CALL | R_ARM_JUMP24 => {
                (ARM_B24, r.addend.unwrap_or(displacement_from_arm_branch(instr) as i64 + 8))
            }
            R_ARM_THM_CALL => {
                (THUMB_B22, r.addend.unwrap_or(displacement_from_thumb_branch(instr) as i64 + 4))
            }
            R_ARM_MOVW_ABS_NC => (ARM_MOVW, r.addend.unwrap_or(word_from_arm_mov(instr) as i64)),
            R_ARM_MOVT_ABS => (ARM_MOVT, r.addend.unwrap_or(word_from_arm_mov(instr) as i64)),
            R_ARM_THM_MOVW_ABS_NC => {
                (THUMB_MOVW, r.addend.unwrap_or(word_from_thumb_mov(instr) as i64))
            }
            R_ARM_THM_MOVT_ABS => {
                (THUMB_MOVT, r.addend.unwrap_or(word_from_thumb_mov(instr) as i64))
            }
            other => {
                return Err(format!("unsupported arm relocation type {} at {:#x}", other, offset))
            }
        };
        Ok(Decoded { offset, kind, addend, target: DecodedTarget::Symbol(r.sym), consumed: 1 })
    }

    fn apply(
        &self,
        kind: RelocKind,
        loc: &mut [u8],
        ctx: &FixupCtx,
        thumb: &mut bool,
    ) -> Result<(), String> {
        match kind {
            MODE_THUMB_CODE => {
                *thumb = true;
                return Ok(());
            }
            MODE_ARM_CODE => {
                *thumb = false;
                return Ok(());
            }
            _ => {}
        }
        if loc.len() < 4 {
            return Err("fixup runs past section end".to_string());
        }
        let external = matches!(ctx.style, ApplyStyle::Relocatable { external: true });
        let instr = Endian::Little.read_u32(loc, 0);
        let target = ctx.target_va as i64;
        let fixup = ctx.fixup_va as i64;
        let in_atom = ctx.in_atom_va as i64;

        let patched = match kind {
            THUMB_B22 => {
                if !*thumb {
                    return Err("Thumb branch fixup in ARM-mode code".to_string());
                }
                let disp = if external {
                    ctx.addend - (fixup + 4)
                } else {
                    target - (fixup + 4) + ctx.addend
                };
                check_branch_range(disp, 25, "thumb_b22")?;
                set_displacement_in_thumb_branch(instr, disp as i32)
            }
            ARM_B24 => {
                if *thumb {
                    return Err("ARM branch fixup in Thumb-mode code".to_string());
                }
                let disp = if external {
                    ctx.addend - (fixup + 8)
                } else {
                    target - (fixup + 8) + ctx.addend
                };
                check_branch_range(disp, 26, "arm_b24")?;
                set_displacement_in_arm_branch(instr, disp as i32)
            }
            THUMB_MOVW | THUMB_MOVT | ARM_MOVW | ARM_MOVT => {
                let expect_thumb = kind == THUMB_MOVW || kind == THUMB_MOVT;
                if *thumb != expect_thumb {
                    return Err("MOVW/MOVT fixup in the wrong instruction mode".to_string());
                }
                let full = if external {
                    ctx.addend as u64
                } else {
                    (target + ctx.addend) as u64
                };
                let value16 = if kind == THUMB_MOVT || kind == ARM_MOVT {
                    ((full >> 16) & 0xffff) as u16
                } else {
                    (full & 0xffff) as u16
                };
                if expect_thumb {
                    set_word_in_thumb_mov(instr, value16)
                } else {
                    set_word_in_arm_mov(instr, value16)
                }
            }
            THUMB_MOVW_FUNC_REL | THUMB_MOVT_FUNC_REL | ARM_MOVW_FUNC_REL | ARM_MOVT_FUNC_REL => {
                let expect_thumb = kind == THUMB_MOVW_FUNC_REL || kind == THUMB_MOVT_FUNC_REL;
                if *thumb != expect_thumb {
                    return Err("MOVW/MOVT fixup in the wrong instruction mode".to_string());
                }
                let full = (target - in_atom + ctx.addend) as u64;
                let value16 = if kind == THUMB_MOVT_FUNC_REL || kind == ARM_MOVT_FUNC_REL {
                    ((full >> 16) & 0xffff) as u16
                } else {
                    (full & 0xffff) as u16
                };
                if expect_thumb {
                    set_word_in_thumb_mov(instr, value16)
                } else {
                    set_word_in_arm_mov(instr, value16)
                }
            }
            POINTER32 => (target + ctx.addend) as u32,
            DELTA32 => (target - fixup + ctx.addend) as u32,
            other => return Err(format!("invalid arm reference kind {}", other.0)),
        };
        Endian::Little.write_u32(loc, 0, patched);
        Ok(())
    }

    fn demand(&self, kind: RelocKind) -> Demand {
        if self.is_call_site(kind) {
            Demand::Plt
        } else {
            Demand::None
        }
    }

    fn output_section_for(&self, _name: &str, _content: ContentType) -> Option<&'static str> {
        None
    }

    fn plt_template(&self) -> PltTemplate {
        // ldr ip, [pc, #4]; add ip, pc, ip; ldr pc, [ip]; .long got-delta
        static ENTRY: [u8; 16] = [
            0x04, 0xc0, 0x9f, 0xe5, //
            0x0c, 0xc0, 0x8f, 0xe0, //
            0x00, 0xf0, 0x9c, 0xe5, //
            0x00, 0x00, 0x00, 0x00,
        ];
        PltTemplate { header: &[], entry: &ENTRY, align: 4 }
    }

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
        let rec = |rtype: u32, sym: u32, pcrel: bool, length: u8, scattered: bool, ext: bool,
                   offset: u64,
                   value: u64| RawReloc {
            offset,
            rtype,
            sym,
            addend: None,
            pcrel,
            length,
            scattered,
            ext,
            value,
        };
        match kind {
            MODE_THUMB_CODE | MODE_ARM_CODE => {}
            ARM_B24 | THUMB_B22 => {
                let rtype = if kind == ARM_B24 { REL_BR24 } else { REL_THUMB_BR22 };
                if external {
                    out.push(rec(rtype, sym_idx, true, 2, false, true, sect_off, 0));
                } else if addend != 0 {
                    out.push(rec(rtype, 0, true, 2, true, false, sect_off, target_addr));
                } else {
                    out.push(rec(rtype, target_sect, true, 2, false, false, sect_off, 0));
                }
            }
            ARM_MOVW | ARM_MOVT | THUMB_MOVW | THUMB_MOVT => {
                let length = match kind {
                    ARM_MOVW => LEN_ARM_LO,
                    ARM_MOVT => LEN_ARM_HI,
                    THUMB_MOVW => LEN_THUMB_LO,
                    _ => LEN_THUMB_HI,
                };
                let lo = kind == ARM_MOVW || kind == THUMB_MOVW;
                let full =
                    if external { addend as u64 } else { (target_addr as i64 + addend) as u64 };
                // The PAIR record carries the other half of the immediate in
                // its offset field.
                let other16 = if lo { (full >> 16) & 0xffff } else { full & 0xffff };
                if external {
                    out.push(rec(REL_HALF, sym_idx, false, length, false, true, sect_off, 0));
                } else if addend != 0 {
                    out.push(rec(REL_HALF, 0, false, length, true, false, sect_off, target_addr));
                } else {
                    out.push(rec(REL_HALF, target_sect, false, length, false, false, sect_off, 0));
                }
                out.push(rec(REL_PAIR, 0, false, length, false, false, other16, 0));
            }
            POINTER32 => {
                if external {
                    out.push(rec(REL_VANILLA, sym_idx, false, 2, false, true, sect_off, 0));
                } else if addend != 0 {
                    out.push(rec(REL_VANILLA, 0, false, 2, true, false, sect_off, target_addr));
                } else {
                    out.push(rec(REL_VANILLA, target_sect, false, 2, false, false, sect_off, 0));
                }
            }
            DELTA32 => {
                // A difference is always a scattered SECTDIFF plus a
                // scattered PAIR carrying the referring atom's own address.
                let to = (target_addr as i64 + addend) as u64;
                out.push(rec(REL_SECTDIFF, 0, false, 2, true, false, sect_off, to));
                out.push(rec(REL_PAIR, 0, false, 2, true, false, 0, from_addr));
            }
            _ => {}
        }
    }
}

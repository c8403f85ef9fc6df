//! Identical code folding.
//!
//! Optimistic partition refinement over the eligible sections. Sections
//! start in classes keyed by a content hash, are split once by constant
//! properties (flags, size, bytes, relocation records sans targets), then
//! repeatedly by relocation targets compared through their *current* class
//! until nothing splits. Classes only refine, so the fixed point exists;
//! mutually-recursive pairs survive because their references land in the
//! same tentative class on every round.
//!
//! Each section carries two class cells. A refinement generation reads cell
//! `cnt % 2` and writes cell `(cnt + 1) % 2`, so parallel workers splitting
//! one range never perturb the ids another worker is reading, and a zero in
//! the current cell (not yet classified this round) compares unequal. The
//! pending-range list is behind a mutex; class ids are positional, so the
//! final partition does not depend on the thread count.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::diag::DiagSink;
use crate::resolve::{Body, SymbolTable};
use crate::sections::{RefTarget, SectionArena, SectionId};

const TOP_BIT: u64 = 1 << 63;

/// Seed hash over the properties that never change during refinement.
/// Relocation targets are deliberately not included.
fn seed_hash(flags: u64, size: u64, nrelocs: u64) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for v in [flags, size, nrelocs] {
        h ^= v;
        h = h.wrapping_mul(0x1000_0000_01b3);
        h ^= h >> 29;
    }
    h
}

fn is_eligible(arena: &SectionArena, id: SectionId) -> bool {
    let sec = arena.get(id);
    sec.live
        && sec.is_allocated()
        && !sec.is_writable()
        && sec.name != ".init"
        && sec.name != ".fini"
}

/// Everything except relocation targets.
fn equals_constant(arena: &SectionArena, a: SectionId, b: SectionId) -> bool {
    let sa = arena.get(a);
    let sb = arena.get(b);
    if sa.flags != sb.flags || sa.size != sb.size || sa.refs.len() != sb.refs.len() {
        return false;
    }
    if sa.data != sb.data {
        return false;
    }
    sa.refs
        .iter()
        .zip(&sb.refs)
        .all(|(ra, rb)| ra.offset == rb.offset && ra.kind == rb.kind && ra.addend == rb.addend)
}

struct VarCtx<'a> {
    arena: &'a SectionArena,
    symtab: &'a SymbolTable,
    class: &'a [[AtomicU64; 2]],
    cnt: usize,
}

impl VarCtx<'_> {
    fn current(&self, id: SectionId) -> u64 {
        self.class[id.0 as usize][self.cnt % 2].load(Ordering::Relaxed)
    }

    /// Relocation targets, compared through the current class partition.
    fn equals_variable(&self, a: SectionId, b: SectionId) -> bool {
        let ra = &self.arena.get(a).refs;
        let rb = &self.arena.get(b).refs;
        ra.iter().zip(rb.iter()).all(|(x, y)| {
            // The same symbol slot is trivially the same target.
            if let (RefTarget::Sym(sa), RefTarget::Sym(sb)) = (x.target, y.target) {
                if sa == sb {
                    return true;
                }
            }
            let spot = |t: RefTarget| -> Option<(SectionId, u64)> {
                match t {
                    RefTarget::Section { section, value } => Some((section, value)),
                    RefTarget::Sym(slot) => match self.symtab.get(slot).body {
                        Body::Regular { section, value } => Some((section, value)),
                        _ => None,
                    },
                }
            };
            match (spot(x.target), spot(y.target)) {
                (Some((sa, va)), Some((sb, vb))) => {
                    if va != vb {
                        return false;
                    }
                    if sa == sb {
                        return true;
                    }
                    let ca = self.current(sa);
                    ca != 0 && ca == self.current(sb)
                }
                _ => false,
            }
        })
    }
}

/// Split one contiguous equal-class slice into subgroups by `eq`, writing
/// next-generation ids. Ids are the global index of each subgroup's first
/// member plus one: deterministic, and never zero.
fn segregate<F>(
    base: usize,
    slice: &mut [SectionId],
    class: &[[AtomicU64; 2]],
    cnt: usize,
    eq: &F,
    split: &AtomicBool,
) where
    F: Fn(SectionId, SectionId) -> bool,
{
    let next = (cnt + 1) % 2;
    let mut begin = 0;
    while begin < slice.len() {
        let head = slice[begin];
        let mut eqs = vec![head];
        let mut rest = Vec::new();
        for &s in &slice[begin + 1..] {
            if eq(head, s) {
                eqs.push(s);
            } else {
                rest.push(s);
            }
        }
        if !rest.is_empty() {
            split.store(true, Ordering::Relaxed);
        }
        let id = (base + begin + 1) as u64;
        for &s in &eqs {
            class[s.0 as usize][next].store(id, Ordering::Relaxed);
        }
        let mid = begin + eqs.len();
        slice[begin..mid].copy_from_slice(&eqs);
        slice[mid..].copy_from_slice(&rest);
        begin = mid;
    }
}

/// One refinement generation over every current class run. Returns true if
/// any class split.
fn refine<F>(
    secs: &mut [SectionId],
    class: &[[AtomicU64; 2]],
    cnt: usize,
    threads: usize,
    eq: F,
) -> bool
where
    F: Fn(SectionId, SectionId) -> bool + Sync,
{
    // Runs of equal current ids are contiguous; carve the vector into
    // per-run work items.
    let cur = cnt % 2;
    let mut boundaries = vec![0usize];
    for i in 1..secs.len() {
        let a = class[secs[i - 1].0 as usize][cur].load(Ordering::Relaxed);
        let b = class[secs[i].0 as usize][cur].load(Ordering::Relaxed);
        if a != b {
            boundaries.push(i);
        }
    }
    boundaries.push(secs.len());
    let runs: Vec<(usize, Vec<SectionId>)> = boundaries
        .windows(2)
        .map(|w| (w[0], secs[w[0]..w[1]].to_vec()))
        .collect();

    let split = AtomicBool::new(false);
    let pending = Mutex::new(runs);
    let done: Mutex<Vec<(usize, Vec<SectionId>)>> = Mutex::new(Vec::new());
    let workers = threads.max(1);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let item = pending.lock().unwrap().pop();
                let Some((base, mut run)) = item else { break };
                segregate(base, &mut run, class, cnt, &eq, &split);
                done.lock().unwrap().push((base, run));
            });
        }
    });
    // Write each segregated run back into place; worker completion order
    // does not matter because runs are disjoint.
    for (base, run) in done.into_inner().unwrap() {
        secs[base..base + run.len()].copy_from_slice(&run);
    }
    split.load(Ordering::Relaxed)
}

/// Run the fold. Returns the number of sections merged away.
pub fn run_icf(
    arena: &mut SectionArena,
    symtab: &SymbolTable,
    threads: usize,
    diags: &mut DiagSink,
) -> usize {
    let mut secs: Vec<SectionId> = arena.ids().filter(|&id| is_eligible(arena, id)).collect();
    if secs.is_empty() {
        return 0;
    }

    let class: Vec<[AtomicU64; 2]> =
        (0..arena.len()).map(|_| [AtomicU64::new(0), AtomicU64::new(0)]).collect();

    let mut cnt = 1;
    {
        let arena: &SectionArena = arena;

        // Seed generation 0 with content hashes; the top bit keeps them
        // clear of the positional ids later generations assign.
        for &id in &secs {
            let sec = arena.get(id);
            let h = seed_hash(sec.flags, sec.size, sec.refs.len() as u64) | TOP_BIT;
            class[id.0 as usize][0].store(h, Ordering::Relaxed);
        }

        // Equal-hash sections become contiguous; the strictest alignment
        // sorts first within a class and becomes the survivor.
        secs.sort_by(|&a, &b| {
            let ca = class[a.0 as usize][0].load(Ordering::Relaxed);
            let cb = class[b.0 as usize][0].load(Ordering::Relaxed);
            ca.cmp(&cb).then(arena.get(b).align.cmp(&arena.get(a).align))
        });

        // One constant pass, then variable passes to a fixed point.
        refine(&mut secs, &class, 0, threads, |a, b| equals_constant(arena, a, b));
        loop {
            let ctx = VarCtx { arena, symtab, class: &class, cnt };
            let changed = refine(&mut secs, &class, cnt, threads, |a, b| ctx.equals_variable(a, b));
            cnt += 1;
            if !changed {
                break;
            }
        }
    }
    diags.log(&format!("ICF needed {} iterations", cnt));

    // Merge each class into its first member.
    let cur = cnt % 2;
    let mut merged = 0;
    let mut i = 0;
    while i < secs.len() {
        let id = class[secs[i].0 as usize][cur].load(Ordering::Relaxed);
        let mut j = i + 1;
        while j < secs.len() && class[secs[j].0 as usize][cur].load(Ordering::Relaxed) == id {
            j += 1;
        }
        if j > i + 1 {
            let head = secs[i];
            diags.log(&format!("selected {}", arena.get(head).name));
            for &loser in &secs[i + 1..j] {
                diags.log(&format!("  removed {}", arena.get(loser).name));
                let align = arena.get(loser).align;
                let sec = arena.get_mut(loser);
                sec.repr = head;
                sec.live = false;
                let head_sec = arena.get_mut(head);
                head_sec.align = head_sec.align.max(align);
                merged += 1;
            }
        }
        i = j;
    }
    merged
}

//! Cycle profiler for AVR programs.
//!
//! Tracks where CPU time goes:
//! - Per-word-address cycle counts (attributed to the executing instruction,
//!   including interrupt entry stalls)
//! - Total active cycles and total cycles including sleep
//! - CPU usage per displayed frame
//! - Hotspots: straight-line address runs ranked by cycles
//!
//! Per-address counting only happens while [`Profiler::enabled`] is set; the
//! totals are always kept. None of this state is read back by the CPU.

use crate::opcodes::Instruction;
use crate::FLASH_WORDS;

/// Frame history kept before the oldest half is discarded.
const MAX_FRAMES: usize = 65536;

/// Addresses whose count is at most this fraction of a hotspot's total are
/// trimmed from its edges.
const LOW_COUNT_DENOM: u64 = 256;

/// A hotspot is split at this many consecutive never-executed instructions.
const SPLIT_ZERO_RUN: usize = 4;

/// Contiguous run of instructions (word addresses, inclusive).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hotspot {
    pub begin: u16,
    pub end: u16,
    pub count: u64,
    /// Share of all active cycles
    pub frac: f64,
}

/// Execution profiler state.
pub struct Profiler {
    /// Whether per-address counting is active
    pub enabled: bool,
    counts: Vec<u64>,
    /// Cycles the CPU was executing (not asleep)
    pub total: u64,
    /// All elapsed cycles
    pub total_with_sleep: u64,
    prev_total: u64,
    prev_total_with_sleep: u64,
    /// Active/elapsed ratio of each displayed frame
    pub frame_cpu_usage: Vec<f32>,
    hotspots: Vec<Hotspot>,
}

impl Profiler {
    pub fn new() -> Self {
        Profiler {
            enabled: false,
            counts: vec![0; FLASH_WORDS],
            total: 0,
            total_with_sleep: 0,
            prev_total: 0,
            prev_total_with_sleep: 0,
            frame_cpu_usage: Vec::new(),
            hotspots: Vec::new(),
        }
    }

    /// Clear all accumulated data. The enabled flag is kept.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.total = 0;
        self.total_with_sleep = 0;
        self.prev_total = 0;
        self.prev_total_with_sleep = 0;
        self.frame_cpu_usage.clear();
        self.hotspots.clear();
    }

    /// Account `cycles` elapsed cycles. `executing` is true when the CPU was
    /// running or entering an interrupt rather than sleeping.
    #[inline]
    pub fn record(&mut self, pc: u16, cycles: u32, executing: bool) {
        self.total_with_sleep += cycles as u64;
        if executing {
            self.total += cycles as u64;
            if self.enabled {
                if let Some(c) = self.counts.get_mut(pc as usize) {
                    *c += cycles as u64;
                }
            }
        }
    }

    /// Close a display frame and store its CPU usage.
    pub fn record_frame(&mut self) {
        let active = self.total - self.prev_total;
        let elapsed = self.total_with_sleep - self.prev_total_with_sleep;
        self.prev_total = self.total;
        self.prev_total_with_sleep = self.total_with_sleep;
        let usage = if elapsed != 0 { active as f64 / elapsed as f64 } else { 0.0 };
        self.frame_cpu_usage.push(usage as f32);
        if self.frame_cpu_usage.len() >= MAX_FRAMES {
            self.frame_cpu_usage.drain(..MAX_FRAMES / 2);
        }
    }

    /// Cycles attributed to one word address.
    pub fn count(&self, pc: u16) -> u64 {
        self.counts.get(pc as usize).copied().unwrap_or(0)
    }

    /// Group the counts into hotspots. `decoded` is the decoded program
    /// (one entry per flash word), `end_words` the size of the loaded program.
    ///
    /// Blocks end after unconditional control transfers (jumps, returns) and
    /// begin at call and jump targets; short forward branches and skips do
    /// not split a block.
    pub fn build_hotspots(&mut self, decoded: &[(Instruction, u8)], end_words: usize) {
        self.hotspots.clear();
        let end_words = end_words.min(decoded.len());

        let mut addrs = Vec::new();
        let mut index_of = vec![usize::MAX; end_words];
        let mut a = 0;
        while a < end_words {
            index_of[a] = addrs.len();
            addrs.push(a);
            a += decoded[a].1.max(1) as usize;
        }
        let n = addrs.len();
        if n == 0 {
            return;
        }

        let mut starts = vec![false; n + 1];
        starts[n] = true;
        for (i, &addr) in addrs.iter().enumerate() {
            // never-taken jumps do not split anything
            if self.counts[addr] == 0 {
                continue;
            }
            let inst = decoded[addr].0;
            let after_skip = i > 0
                && match decoded[addrs[i - 1]].0 {
                    Instruction::Cpse { .. }
                    | Instruction::Sbrc { .. }
                    | Instruction::Sbrs { .. }
                    | Instruction::Sbic { .. }
                    | Instruction::Sbis { .. } => true,
                    Instruction::Brbs { k, .. } | Instruction::Brbc { k, .. } => k == 1 || k == 2,
                    _ => false,
                };
            let (call, target) = match inst {
                Instruction::Call { k } => (true, Some(k as usize)),
                Instruction::Rcall { k } => (true, Some((addr as i64 + 1 + k as i64) as usize)),
                Instruction::Icall => (true, None),
                Instruction::Jmp { k } if k > 4 => (false, Some(k as usize)),
                Instruction::Rjmp { k } if !(0..=4).contains(&k) => (false, None),
                Instruction::Ijmp | Instruction::Ret | Instruction::Reti => (false, None),
                _ => continue,
            };
            if after_skip {
                continue;
            }
            if !call {
                starts[i + 1] = true;
            }
            if let Some(&t) = target.and_then(|t| index_of.get(t)) {
                if t != usize::MAX && t > 0 {
                    starts[t] = true;
                }
            }
        }

        let mut start = 0;
        for index in 1..=n {
            if starts[index] {
                self.collect(&addrs[start..index]);
                start = index;
            }
        }

        let total = self.total;
        for h in &mut self.hotspots {
            h.frac = if total != 0 { h.count as f64 / total as f64 } else { 0.0 };
        }
        self.hotspots.sort_by(|a, b| b.count.cmp(&a.count));
    }

    /// Turn one block of instruction addresses into hotspots: trim cold
    /// edges, split at long runs of unexecuted code.
    fn collect(&mut self, block: &[usize]) {
        let count = |addrs: &[usize]| addrs.iter().map(|&a| self.counts[a]).sum::<u64>();
        let total = count(block);
        if total == 0 {
            return;
        }
        let cold = total / LOW_COUNT_DENOM;
        let first = block.iter().position(|&a| self.counts[a] > cold);
        let last = block.iter().rposition(|&a| self.counts[a] > cold);
        let (Some(first), Some(last)) = (first, last) else {
            return;
        };
        let block = &block[first..=last];

        let mut pieces = Vec::new();
        let mut begin = 0;
        let mut zeros = 0;
        for (i, &a) in block.iter().enumerate() {
            if self.counts[a] == 0 {
                zeros += 1;
                continue;
            }
            if zeros >= SPLIT_ZERO_RUN {
                pieces.push(&block[begin..i - zeros]);
                begin = i;
            }
            zeros = 0;
        }
        pieces.push(&block[begin..]);

        let found: Vec<Hotspot> = pieces
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|p| Hotspot {
                begin: p[0] as u16,
                end: p[p.len() - 1] as u16,
                count: count(p),
                frac: 0.0,
            })
            .filter(|h| h.count != 0)
            .collect();
        self.hotspots.extend(found);
    }

    /// The `n` hottest hotspots from the last [`build_hotspots`](Self::build_hotspots).
    pub fn top(&self, n: usize) -> &[Hotspot] {
        &self.hotspots[..n.min(self.hotspots.len())]
    }

    /// Format a profiling report of the top hotspots.
    pub fn report(&self, n: usize) -> String {
        let mut s = String::new();
        s.push_str("=== Profiler Report ===\n");
        s.push_str(&format!("Active cycles: {}\n", self.total));
        s.push_str(&format!("Elapsed cycles: {}\n", self.total_with_sleep));
        if self.total_with_sleep > 0 {
            let usage = self.total as f64 / self.total_with_sleep as f64 * 100.0;
            s.push_str(&format!("CPU usage: {:.1}%\n", usage));
        }
        s.push_str(&format!("\n--- Top {} Hotspots ---\n", n));
        for h in self.top(n) {
            s.push_str(&format!(
                "0x{:04X}-0x{:04X}  {:>10} cycles  ({:.1}%)\n",
                h.begin as u32 * 2,
                h.end as u32 * 2,
                h.count,
                h.frac * 100.0
            ));
        }
        s
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

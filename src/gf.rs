//! Galois-field arithmetic over GF(2^bits), plus the per-element XOR
//! "multiply programs" used to scale a whole stripe chunk by a constant.
//!
//! Grounded on `xlators/cluster/ec/src/ec-galois.h` and the portable
//! reference path in `ec-code-c.h`/`ec-code.c` (which every accelerated
//! implementation must agree with byte-for-byte).

use smallvec::SmallVec;

use crate::errno::{Errno, Result};

/// GF(2⁸) with the reduction polynomial GlusterFS's erasure-coding
/// translator uses (`x⁸ + x⁴ + x³ + x² + 1`).
pub const DEFAULT_BITS: u32 = 8;
/// `0x11D`, the default irreducible polynomial (one bit wider than the field
/// itself, as is conventional: bit 8 is implicit).
pub const DEFAULT_MOD: u32 = 0x11D;

/// One field element's data source inside a [`MulProgram`]: either the raw
/// input block, or the input block doubled (multiplied by 2 in the field)
/// `n` times.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Source {
    /// The block as given, unscaled.
    Input,
    /// The block scaled by `2^n` in the field.
    Doubled(u8),
}

/// One instruction in a [`MulProgram`]. Registers are named by small
/// integer ids; the register-allocation map is simply "how many registers
/// this program needs," returned alongside the opcode list.
#[derive(Clone, Debug)]
pub enum Opcode {
    /// Materialize `src` into register `dst`.
    Load { dst: u8, src: Source },
    /// Write register `src` to the output block.
    Store { src: u8 },
    /// `dst := src`
    Copy { dst: u8, src: u8 },
    /// `dst ^= a`
    Xor2 { dst: u8, a: u8 },
    /// `dst := a ^ b`
    Xor3 { dst: u8, a: u8, b: u8 },
    /// `dst := xor of all of srcs`, for combining more than two terms in
    /// one step once three-address `Xor3` isn't enough.
    Xorm { dst: u8, srcs: SmallVec<[u8; 8]> },
}

/// A compiled "multiply the whole block by `v`" routine, expressed purely
/// in terms of block-wide XOR combinations of doublings of the input.
/// This is the XOR decomposition a vectorized backend would lower onto
/// wide registers; see [`MulProgram::apply`] for the (table-driven, always
/// correct) interpreter used here.
#[derive(Clone, Debug)]
pub struct MulProgram {
    opcodes: Vec<Opcode>,
    registers: u8,
    element: u32,
}

impl MulProgram {
    /// The field element this program multiplies by.
    pub fn element(&self) -> u32 {
        self.element
    }

    /// Number of logical registers this program's allocator assigned.
    pub fn register_count(&self) -> u8 {
        self.registers
    }

    /// Applies this program to `input`, writing `v * input` (byte-wise, in
    /// the field) into `output`. Both slices must be the same length.
    pub fn apply(&self, gf: &Gf, input: &[u8], output: &mut [u8]) {
        assert_eq!(input.len(), output.len());
        let mut regs: Vec<Vec<u8>> = vec![Vec::new(); self.registers as usize];
        let mut doubled_cache: Vec<Option<Vec<u8>>> = vec![None; 9];
        for op in &self.opcodes {
            match *op {
                Opcode::Load { dst, src } => {
                    regs[dst as usize] = match src {
                        Source::Input => input.to_vec(),
                        Source::Doubled(n) => {
                            doubled(gf, input, n, &mut doubled_cache).to_vec()
                        }
                    };
                }
                Opcode::Store { src } => {
                    output.copy_from_slice(&regs[src as usize]);
                }
                Opcode::Copy { dst, src } => {
                    regs[dst as usize] = regs[src as usize].clone();
                }
                Opcode::Xor2 { dst, a } => {
                    let a = regs[a as usize].clone();
                    for (d, a) in regs[dst as usize].iter_mut().zip(a.iter()) {
                        *d ^= a;
                    }
                }
                Opcode::Xor3 { dst, a, b } => {
                    let (a, b) = (regs[a as usize].clone(), regs[b as usize].clone());
                    let out = a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect();
                    regs[dst as usize] = out;
                }
                Opcode::Xorm { dst, ref srcs } => {
                    let mut acc = vec![0u8; input.len()];
                    for &s in srcs {
                        for (a, b) in acc.iter_mut().zip(regs[s as usize].iter()) {
                            *a ^= b;
                        }
                    }
                    regs[dst as usize] = acc;
                }
            }
        }
    }
}

/// Doubles `input` (multiplies every byte by 2 in the field) `n` times,
/// memoizing intermediate results in `cache` (indexed by doubling count).
fn doubled<'a>(gf: &Gf, input: &[u8], n: u8, cache: &'a mut [Option<Vec<u8>>]) -> &'a Vec<u8> {
    if cache[0].is_none() {
        cache[0] = Some(input.to_vec());
    }
    for i in 1..=n as usize {
        if cache[i].is_none() {
            let prev = cache[i - 1].as_ref().unwrap();
            let next = prev.iter().map(|&b| gf.mul(b as u32, 2) as u8).collect();
            cache[i] = Some(next);
        }
    }
    cache[n as usize].as_ref().unwrap()
}

fn build_program(element: u32) -> MulProgram {
    let bits: Vec<u8> = (0..8u8).filter(|&i| (element >> i) & 1 == 1).collect();

    if bits.is_empty() {
        // v == 0: load anything, self-xor to clear, store.
        return MulProgram {
            opcodes: vec![
                Opcode::Load { dst: 0, src: Source::Input },
                Opcode::Xor2 { dst: 0, a: 0 },
                Opcode::Store { src: 0 },
            ],
            registers: 1,
            element,
        };
    }

    if bits == [0] {
        // v == 1: degenerates to a copy.
        return MulProgram {
            opcodes: vec![
                Opcode::Load { dst: 0, src: Source::Input },
                Opcode::Store { src: 0 },
            ],
            registers: 1,
            element,
        };
    }

    let mut opcodes = Vec::new();
    opcodes.push(Opcode::Load { dst: 0, src: Source::Doubled(bits[0]) });
    let mut next_reg: u8 = 1;
    for &b in &bits[1..] {
        opcodes.push(Opcode::Load { dst: next_reg, src: Source::Doubled(b) });
        opcodes.push(Opcode::Xor2 { dst: 0, a: next_reg });
        next_reg += 1;
    }
    opcodes.push(Opcode::Store { src: 0 });

    MulProgram {
        opcodes,
        registers: next_reg.max(1),
        element,
    }
}

/// A prepared Galois field: log/exp tables plus one compiled [`MulProgram`]
/// per element, built once at startup.
#[derive(Debug)]
pub struct Gf {
    bits: u32,
    size: u32,
    log: Vec<u32>,
    exp: Vec<u32>,
    programs: Vec<MulProgram>,
}

impl Gf {
    /// Builds log/exp tables for GF(2^bits) under the given irreducible
    /// polynomial, and a [`MulProgram`] for every field element. The only
    /// failure mode is allocation.
    pub fn prepare(bits: u32, modulus: u32) -> Result<Gf> {
        if bits == 0 || bits > 16 {
            return Err(Errno::Invalid);
        }
        let size = 1u32 << bits;
        let mut log = vec![0u32; size as usize];
        let mut exp = vec![0u32; size as usize];

        let mut x: u32 = 1;
        for i in 0..(size - 1) {
            exp[i as usize] = x;
            log[x as usize] = i;
            x <<= 1;
            if x & size != 0 {
                x ^= modulus;
            }
        }
        exp[(size - 1) as usize] = 1;

        let mut gf = Gf {
            bits,
            size,
            log,
            exp,
            programs: Vec::with_capacity(size as usize),
        };
        for v in 0..size {
            gf.programs.push(build_program(v));
        }
        Ok(gf)
    }

    /// Builds the default GF(2⁸) field used by the erasure-coding matrix
    /// cache (§6: `chunk_size = word_size * gf_bits`).
    pub fn default_field() -> Result<Gf> {
        Gf::prepare(DEFAULT_BITS, DEFAULT_MOD)
    }

    /// Number of elements in the field.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of bits (`log2(size)`).
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// `a + b` (XOR, in a binary field).
    pub fn add(&self, a: u32, b: u32) -> u32 {
        a ^ b
    }

    /// `a * b`.
    pub fn mul(&self, a: u32, b: u32) -> u32 {
        if a == 0 || b == 0 {
            return 0;
        }
        let sum = self.log[a as usize] + self.log[b as usize];
        self.exp[(sum % (self.size - 1)) as usize]
    }

    /// `a / b`. Fails with [`Errno::Invalid`] if `b == 0`.
    pub fn div(&self, a: u32, b: u32) -> Result<u32> {
        if b == 0 {
            return Err(Errno::Invalid);
        }
        if a == 0 {
            return Ok(0);
        }
        let diff = (self.size - 1) + self.log[a as usize] - self.log[b as usize];
        Ok(self.exp[(diff % (self.size - 1)) as usize])
    }

    /// `a ^ e`. By convention `0^0 == 1`... except GF exponentiation is
    /// only defined for nonzero `a` here; `gf_exp(0, e)` is `0` for `e >
    /// 0` and `1` for `e == 0`, matching the usual `pow` convention.
    pub fn exp(&self, a: u32, e: u32) -> u32 {
        if e == 0 {
            return 1;
        }
        if a == 0 {
            return 0;
        }
        let p = (self.log[a as usize] as u64 * e as u64) % (self.size - 1) as u64;
        self.exp[p as usize]
    }

    /// The compiled multiply-by-`v` program.
    pub fn program(&self, v: u32) -> &MulProgram {
        &self.programs[v as usize]
    }

    /// Reference oracle: multiplies every byte of `input` by `v` via a
    /// plain table lookup, with no XOR-program indirection. Used to check
    /// that [`MulProgram::apply`] agrees with the field definition.
    pub fn reference_muladd(&self, v: u32, input: &[u8]) -> Vec<u8> {
        input.iter().map(|&b| self.mul(b as u32, v) as u8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> Gf {
        Gf::default_field().unwrap()
    }

    #[test]
    fn mul_div_roundtrip() {
        let gf = field();
        for a in 0..gf.size() {
            for b in 1..gf.size() {
                let quotient = gf.div(a, b).unwrap();
                assert_eq!(gf.mul(quotient, b), a, "a={a} b={b}");
            }
        }
    }

    #[test]
    fn div_by_zero_fails() {
        let gf = field();
        assert_eq!(gf.div(5, 0), Err(Errno::Invalid));
    }

    #[test]
    fn exp_zero_is_one() {
        let gf = field();
        for a in 1..gf.size() {
            assert_eq!(gf.exp(a, 0), 1);
        }
    }

    #[test]
    fn mul_program_matches_reference_for_every_element() {
        let gf = field();
        let mut input = vec![0u8; 512];
        for (i, b) in input.iter_mut().enumerate() {
            *b = (i * 37 + 11) as u8;
        }
        for v in 0..gf.size() {
            let mut out = vec![0u8; 512];
            gf.program(v).apply(&gf, &input, &mut out);
            assert_eq!(out, gf.reference_muladd(v, &input), "v={v}");
        }
    }

    #[test]
    fn mul_program_zero_clears() {
        let gf = field();
        let input = vec![0xABu8; 512];
        let mut out = vec![0xFFu8; 512];
        gf.program(0).apply(&gf, &input, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn mul_program_one_is_identity() {
        let gf = field();
        let input: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        let mut out = vec![0u8; 512];
        gf.program(1).apply(&gf, &input, &mut out);
        assert_eq!(out, input);
    }
}

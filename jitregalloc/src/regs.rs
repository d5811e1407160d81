//! Physical registers, register sets, and the register masks that describe a calling convention.

use crate::errors::RegAllocError;
use static_assertions::const_assert;
use std::fmt;
use strum::{Display, EnumCount};

/// How many registers each [RegClass] has.
pub const REGS_PER_CLASS: usize = 16;
// A [RegSet] is a `u16`.
const_assert!(REGS_PER_CLASS <= 16);

#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[strum(serialize_all = "lowercase")]
pub enum RegClass {
    Int,
    Vec,
}

impl RegClass {
    /// The index of this class when classes are laid out consecutively (e.g. for fixed intervals).
    pub fn index(self) -> usize {
        match self {
            RegClass::Int => 0,
            RegClass::Vec => 1,
        }
    }
}

static INT_REG_NAMES: [&str; REGS_PER_CLASS] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

static VEC_REG_NAMES: [&str; REGS_PER_CLASS] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10", "xmm11",
    "xmm12", "xmm13", "xmm14", "xmm15",
];

/// A physical register.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Register {
    pub class: RegClass,
    pub index: u8,
}

impl Register {
    pub fn new(class: RegClass, index: u8) -> Self {
        assert!(usize::from(index) < REGS_PER_CLASS);
        Self { class, index }
    }

    pub fn int(index: u8) -> Self {
        Self::new(RegClass::Int, index)
    }

    pub fn vec(index: u8) -> Self {
        Self::new(RegClass::Vec, index)
    }

    /// Look up a register by its x64 name (e.g. `rax` or `xmm3`).
    pub fn from_name(s: &str) -> Option<Self> {
        if let Some(i) = INT_REG_NAMES.iter().position(|x| *x == s) {
            return Some(Self::int(i as u8));
        }
        VEC_REG_NAMES
            .iter()
            .position(|x| *x == s)
            .map(|i| Self::vec(i as u8))
    }

    /// A dense index over both classes: integer registers come first.
    pub fn flat_index(self) -> usize {
        self.class.index() * REGS_PER_CLASS + usize::from(self.index)
    }

    pub fn from_flat_index(i: usize) -> Self {
        match i / REGS_PER_CLASS {
            0 => Self::int((i % REGS_PER_CLASS) as u8),
            1 => Self::vec((i % REGS_PER_CLASS) as u8),
            _ => panic!("Flat register index {i} out of range"),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = match self.class {
            RegClass::Int => &INT_REG_NAMES,
            RegClass::Vec => &VEC_REG_NAMES,
        };
        write!(f, "{}", names[usize::from(self.index)])
    }
}

/// A set of registers of a single class, one bit per register.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct RegSet(u16);

impl RegSet {
    /// Create a [RegSet] with all registers unused.
    pub fn blank() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_set(self, index: u8) -> bool {
        self.0 & (1 << index) != 0
    }

    pub fn set(&mut self, index: u8) {
        self.0 |= 1 << index;
    }

    pub fn unset(&mut self, index: u8) {
        self.0 &= !(1 << index);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate over the set registers from lowest to highest index.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..REGS_PER_CLASS as u8).filter(move |i| self.is_set(*i))
    }

    /// Return the highest indexed register *not* in the set, if there is one.
    pub fn find_empty(self) -> Option<u8> {
        if self.0 == u16::MAX {
            None
        } else {
            Some(15 - (!self.0).leading_zeros() as u8)
        }
    }

    /// Return the highest indexed register in the set, if there is one.
    pub fn highest(self) -> Option<u8> {
        (!self).find_empty()
    }
}

impl std::ops::Not for RegSet {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// The register contract of one [RegClass].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClassMasks {
    /// Registers the allocator may hand out.
    pub available: RegSet,
    /// Registers a call may clobber.
    pub caller_saved: RegSet,
    /// Registers a call preserves.
    pub callee_saved: RegSet,
}

/// The calling convention contract the allocators work against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterMasks {
    pub int: ClassMasks,
    pub vec: ClassMasks,
}

impl RegisterMasks {
    pub fn new(int: ClassMasks, vec: ClassMasks) -> Result<Self, RegAllocError> {
        for (class, m) in [(RegClass::Int, &int), (RegClass::Vec, &vec)] {
            if !m.caller_saved.is_subset(m.available) || !m.callee_saved.is_subset(m.available) {
                return Err(RegAllocError::Config(format!(
                    "{class} caller/callee saved registers must be available registers"
                )));
            }
            if !m.caller_saved.intersection(m.callee_saved).is_empty() {
                return Err(RegAllocError::Config(format!(
                    "{class} registers cannot be both caller and callee saved"
                )));
            }
        }
        Ok(Self { int, vec })
    }

    /// The x64 SysV calling convention: `rsp` and `rbp` are never allocated.
    pub fn sysv() -> Self {
        let mut int_avail = RegSet::from_bits(u16::MAX);
        int_avail.unset(4);
        int_avail.unset(5);
        let mut int_caller = RegSet::blank();
        for i in [0, 1, 2, 6, 7, 8, 9, 10, 11] {
            int_caller.set(i);
        }
        Self {
            int: ClassMasks {
                available: int_avail,
                caller_saved: int_caller,
                callee_saved: int_avail.difference(int_caller),
            },
            vec: ClassMasks {
                available: RegSet::from_bits(u16::MAX),
                caller_saved: RegSet::from_bits(u16::MAX),
                callee_saved: RegSet::blank(),
            },
        }
    }

    pub fn class(&self, class: RegClass) -> &ClassMasks {
        match class {
            RegClass::Int => &self.int,
            RegClass::Vec => &self.vec,
        }
    }

    pub fn is_caller_saved(&self, reg: Register) -> bool {
        self.class(reg.class).caller_saved.is_set(reg.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regset() {
        let mut rs = RegSet::blank();
        assert_eq!(rs.find_empty(), Some(15));
        rs.set(15);
        assert_eq!(rs.find_empty(), Some(14));
        rs.set(14);
        assert_eq!(rs.find_empty(), Some(13));
        rs.unset(14);
        assert!(!rs.is_set(14));
        assert_eq!(rs.find_empty(), Some(14));
        assert_eq!(rs.highest(), Some(15));
        assert_eq!(RegSet::from_bits(u16::MAX).find_empty(), None);
        assert_eq!(RegSet::blank().highest(), None);
        assert_eq!(
            RegSet::from_bits(0b1010).iter().collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn names() {
        assert_eq!(Register::int(0).to_string(), "rax");
        assert_eq!(Register::int(15).to_string(), "r15");
        assert_eq!(Register::vec(3).to_string(), "xmm3");
        assert_eq!(Register::from_name("rdi"), Some(Register::int(7)));
        assert_eq!(Register::from_name("xmm12"), Some(Register::vec(12)));
        assert_eq!(Register::from_name("eax"), None);
        let r = Register::vec(2);
        assert_eq!(Register::from_flat_index(r.flat_index()), r);
    }

    #[test]
    fn masks() {
        let m = RegisterMasks::sysv();
        assert!(m.is_caller_saved(Register::from_name("rdi").unwrap()));
        assert!(!m.is_caller_saved(Register::from_name("rbx").unwrap()));
        assert!(!m.int.available.is_set(4));
        assert_eq!(m.int.callee_saved.count(), 5);
        assert!(RegisterMasks::new(
            ClassMasks {
                available: RegSet::from_bits(0b11),
                caller_saved: RegSet::from_bits(0b100),
                callee_saved: RegSet::blank(),
            },
            m.vec
        )
        .is_err());
    }
}

//! Page protection flags accepted by `MMAP`/`MPROTECT`.

use bitflags::bitflags;

bitflags! {
    /// User-visible page protection bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Protection: u32 {
        /// Pages may be read.
        const READ  = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXEC  = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_values() {
        assert_eq!(Protection::READ.bits(), 1);
        assert_eq!(Protection::WRITE.bits(), 2);
        assert_eq!(Protection::EXEC.bits(), 4);
        assert_eq!(Protection::from_bits_truncate(0xFF), Protection::all());
    }
}

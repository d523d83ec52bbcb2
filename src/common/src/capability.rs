//! Process capability bitmask.

use bitflags::bitflags;

bitflags! {
    /// Privileges a process may hold beyond its own address space.
    ///
    /// Requested through `REQUEST_CAP`; granted only within the ceiling the
    /// process inherited from its creator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Capabilities: u32 {
        /// Map the boot framebuffer directly.
        const DIRECT_FB_ACCESS = 1 << 0;
        /// Shut down or reboot the machine.
        const MANAGE_POWER     = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_values() {
        assert_eq!(Capabilities::DIRECT_FB_ACCESS.bits(), 1);
        assert_eq!(Capabilities::MANAGE_POWER.bits(), 2);
        assert_eq!(Capabilities::from_bits(4), None);
    }
}

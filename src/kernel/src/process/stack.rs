//! System V initial user stack.
//!
//! Layout, from the returned stack pointer upwards:
//!
//! ```text
//! argc
//! argv[0..argc], NULL
//! envp[0..envc], NULL
//! auxv pairs, AT_NULL
//! padding
//! argument and environment strings
//! ```

use alloc::vec::Vec;

use super::LoadedElf;
use crate::config::{align_down, PAGE_SIZE};
use crate::mm::{AddressSpace, MapError};

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;

/// Write argv, envp and the auxiliary vector below `stack_top` and return
/// the initial stack pointer (16-byte aligned, pointing at `argc`).
pub fn build_initial_stack(
    space: &AddressSpace,
    stack_top: u64,
    args: &[&str],
    env: &[&str],
    image: &LoadedElf,
) -> Result<u64, MapError> {
    let mut cursor = stack_top;
    let mut push_str = |s: &str| -> Result<u64, MapError> {
        let len = s.len() as u64 + 1;
        cursor = cursor.checked_sub(len).ok_or(MapError::BadAddress)?;
        space.copy_to_user(cursor, s.as_bytes())?;
        space.copy_to_user(cursor + s.len() as u64, &[0])?;
        Ok(cursor)
    };

    let argv: Vec<u64> = args.iter().map(|s| push_str(s)).collect::<Result<_, _>>()?;
    let envp: Vec<u64> = env.iter().map(|s| push_str(s)).collect::<Result<_, _>>()?;

    let auxv = [
        (AT_PHDR, image.phdr),
        (AT_PHENT, u64::from(image.phent)),
        (AT_PHNUM, u64::from(image.phnum)),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_ENTRY, image.entry),
        (AT_NULL, 0),
    ];

    let mut words: Vec<u64> = Vec::with_capacity(3 + argv.len() + envp.len() + 2 * auxv.len());
    words.push(argv.len() as u64);
    words.extend_from_slice(&argv);
    words.push(0);
    words.extend_from_slice(&envp);
    words.push(0);
    for (key, value) in auxv {
        words.push(key);
        words.push(value);
    }

    let table = (words.len() * 8) as u64;
    let sp = align_down(
        cursor.checked_sub(table).ok_or(MapError::BadAddress)?,
        16,
    );
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    space.copy_to_user(sp, &bytes)?;
    log::trace!(target: "elf", "initial stack at {:#x}, argc {}", sp, args.len());
    Ok(sp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HUGE_PAGE_SIZE;
    use crate::mm::{FramePool, PhysMemory, Placement};
    use alloc::sync::Arc;
    use kestrel_common::Protection;

    fn read_u64(space: &AddressSpace, addr: u64) -> u64 {
        let mut raw = [0u8; 8];
        space.copy_from_user(addr, &mut raw).unwrap();
        u64::from_le_bytes(raw)
    }

    fn read_cstr(space: &AddressSpace, mut addr: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            space.copy_from_user(addr, &mut byte).unwrap();
            if byte[0] == 0 {
                return out;
            }
            out.push(byte[0]);
            addr += 1;
        }
    }

    #[test]
    fn argv_envp_and_auxv_are_laid_out() {
        let frames = Arc::new(FramePool::new(PhysMemory::hosted(HUGE_PAGE_SIZE, HUGE_PAGE_SIZE)));
        let mut space = AddressSpace::new(frames, None).unwrap();
        let base = space
            .allocate(Placement::Anywhere, 4 * PAGE_SIZE, Protection::READ | Protection::WRITE)
            .unwrap();
        let top = base + 4 * PAGE_SIZE;
        let image = LoadedElf {
            entry: 0x40_1000,
            base: 0x40_0000,
            phdr: 0x40_0040,
            phnum: 3,
            phent: 56,
        };

        let sp = build_initial_stack(&space, top, &["/bin/init", "-v"], &["HOME=/"], &image).unwrap();
        assert_eq!(sp % 16, 0);
        assert_eq!(read_u64(&space, sp), 2);
        assert_eq!(read_cstr(&space, read_u64(&space, sp + 8)), b"/bin/init");
        assert_eq!(read_cstr(&space, read_u64(&space, sp + 16)), b"-v");
        assert_eq!(read_u64(&space, sp + 24), 0);
        assert_eq!(read_cstr(&space, read_u64(&space, sp + 32)), b"HOME=/");
        assert_eq!(read_u64(&space, sp + 40), 0);

        let auxv = sp + 48;
        assert_eq!(read_u64(&space, auxv), AT_PHDR);
        assert_eq!(read_u64(&space, auxv + 8), 0x40_0040);
        assert_eq!(read_u64(&space, auxv + 5 * 16), AT_NULL);
    }

    #[test]
    fn unmapped_stack_is_bad_address() {
        let frames = Arc::new(FramePool::new(PhysMemory::hosted(HUGE_PAGE_SIZE, HUGE_PAGE_SIZE)));
        let space = AddressSpace::new(frames, None).unwrap();
        let image = LoadedElf {
            entry: 0,
            base: 0,
            phdr: 0,
            phnum: 0,
            phent: 0,
        };
        assert_eq!(
            build_initial_stack(&space, 0x7000_0000, &["x"], &[], &image),
            Err(MapError::BadAddress)
        );
    }
}

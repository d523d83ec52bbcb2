//! Support for the primary and secondary 8259 Programmable Interrupt Controllers (PICs).

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

/// The offset of the first PIC (master).
///
/// IRQs 0..7 are mapped to interrupts 32..39.
pub const PIC_1_OFFSET: u8 = 32;

/// The offset of the second PIC (slave).
///
/// IRQs 8..15 are mapped to interrupts 40..47.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const PIC_END: u8 = PIC_2_OFFSET + 8;

/// The global instance of the chained PICs.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap both controllers and mask every line except the timer and the
/// cascade.
pub fn init() {
    without_interrupts(|| {
        let mut pics = PICS.lock();
        // SAFETY: the offsets above do not overlap CPU exception vectors.
        unsafe {
            pics.initialize();
            pics.write_masks(0b1111_1010, 0b1111_1111);
        }
    });
    log::debug!(target: "boot", "8259 remapped to {}..{}", PIC_1_OFFSET, PIC_END);
}

fn line(vector: u8) -> Option<u8> {
    (PIC_1_OFFSET..PIC_END)
        .contains(&vector)
        .then(|| vector - PIC_1_OFFSET)
}

/// Acknowledge `vector` if one of the controllers raised it.
pub fn end_of_interrupt(vector: u8) {
    if line(vector).is_none() {
        return;
    }
    without_interrupts(|| {
        // SAFETY: `vector` belongs to the chained PICs.
        unsafe { PICS.lock().notify_end_of_interrupt(vector) }
    });
}

/// Set or clear the mask bit of the line behind `vector`.
pub fn set_masked(vector: u8, masked: bool) {
    let Some(line) = line(vector) else {
        return;
    };
    without_interrupts(|| {
        let mut pics = PICS.lock();
        // SAFETY: only the mask registers are touched.
        unsafe {
            let mut masks = pics.read_masks();
            let (index, bit) = (usize::from(line / 8), line % 8);
            if masked {
                masks[index] |= 1 << bit;
            } else {
                masks[index] &= !(1 << bit);
            }
            pics.write_masks(masks[0], masks[1]);
        }
    });
}

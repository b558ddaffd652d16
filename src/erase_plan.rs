use core::time::Duration;

use crate::device::EraseOp;

/// A single erase instruction within an `ErasePlan`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct EraseStep {
    pub opcode: u8,
    pub size: usize,
    pub address: u32,
    pub time_max: Duration,
}

/// Sequence of erase instructions covering exactly a range of memory.
#[derive(Clone, Debug)]
pub(crate) struct ErasePlan(pub Vec<EraseStep>);

impl ErasePlan {
    /// Plan the erase of `length` bytes from `start`.
    ///
    /// `ops` must be sorted smallest first, and `start` and `length` must be
    /// multiples of the smallest op size. No step erases outside the range:
    /// at each position the largest op which is aligned there and fits
    /// before the end is selected.
    pub fn new(ops: &[EraseOp], start: usize, length: usize) -> Self {
        log::trace!("Creating erase plan, start={} length={}", start, length);
        let mut plan = Vec::new();

        let end = start + length;
        let mut pos = start;
        while pos < end {
            let op = ops.iter().rev()
                .find(|op| pos % op.size == 0 && pos + op.size <= end);
            let op = match op {
                Some(op) => op,
                None => {
                    // Only reachable if the caller did not align the range.
                    log::error!("No erase instruction fits at 0x{:08X}", pos);
                    break;
                }
            };
            log::trace!("  Erase 0x{:02X} ({} bytes) at 0x{:08X}", op.opcode, op.size, pos);
            plan.push(EraseStep { opcode: op.opcode, size: op.size, address: pos as u32,
                                  time_max: op.time_max });
            pos += op.size;
        }

        log::debug!("Erase plan: {} instructions", plan.len());

        ErasePlan(plan)
    }

    pub fn total_size(&self) -> usize {
        self.0.iter().map(|x| x.size).sum()
    }
}

#[test]
fn test_erase_plan() {
    let ops = &[EraseOp::new(4, 1, 0), EraseOp::new(32, 2, 0), EraseOp::new(64, 3, 0)];
    let steps = |start, length| -> Vec<(u8, usize, u32)> {
        ErasePlan::new(ops, start, length).0.iter().map(|s| (s.opcode, s.size, s.address)).collect()
    };
    // Use a single 4kB erase to erase an aligned 4kB block.
    assert_eq!(steps(0, 4), vec![(1, 4, 0)]);
    // Use a single 64kB erase to erase an aligned 64kB block.
    assert_eq!(steps(0, 64), vec![(3, 64, 0)]);
    // Use three 64kB erases to erase an aligned 192kB block.
    assert_eq!(steps(0, 192), vec![(3, 64, 0), (3, 64, 64), (3, 64, 128)]);
    // Use 64kB followed by 4kB to erase an aligned 68kB block.
    assert_eq!(steps(0, 68), vec![(3, 64, 0), (1, 4, 64)]);
    // Use 64kB, 32kB, 4kB to erase an aligned 100kB block.
    assert_eq!(steps(0, 100), vec![(3, 64, 0), (2, 32, 64), (1, 4, 96)]);
    // Never erase before the start: 4kB steps up to the 32kB boundary, then larger.
    assert_eq!(steps(24, 72), vec![(1, 4, 24), (1, 4, 28), (2, 32, 32), (2, 32, 64)]);
    // Never erase past the end.
    assert_eq!(steps(64, 60), vec![(2, 32, 64), (1, 4, 96), (1, 4, 100), (1, 4, 104),
                                   (1, 4, 108), (1, 4, 112), (1, 4, 116), (1, 4, 120)]);
    assert!(steps(8, 0).is_empty());
}

#[test]
fn test_erase_plan_total_size() {
    let ops = &[EraseOp::new(4096, 0x20, 0), EraseOp::new(65536, 0xD8, 0)];
    let plan = ErasePlan::new(ops, 0x7000, 0x1_0000);
    assert_eq!(plan.total_size(), 0x1_0000);
    assert!(plan.0.iter().all(|s| s.address >= 0x7000 && s.address as usize + s.size <= 0x1_7000));
}

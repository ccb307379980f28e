#![no_main]

use libfuzzer_sys::fuzz_target;
use mcu_sim_core::{InterruptTable, Segment, StateSnapshot};

fuzz_target!(|data: &[u8]| {
    let Some((&len, ops)) = data.split_first() else {
        return;
    };

    let state = StateSnapshot::default();
    let mut segment = Segment::new("fuzz", usize::from(len), 0xA5);
    let Ok(mut table) = InterruptTable::new(64) else {
        return;
    };

    for chunk in ops.chunks_exact(3) {
        let addr = u32::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let inum = chunk[1] & 0x3F;
        match chunk[0] % 8 {
            0 => segment.write(addr, chunk[2], &state),
            1 => {
                let value = segment.read(addr, &state);
                if addr >= u32::from(len) {
                    assert_eq!(value, 0xA5);
                }
            }
            2 => assert_eq!(segment.get(addr).is_ok(), addr < u32::from(len)),
            3 => {
                let _ = table.post(inum, &state);
            }
            4 => {
                let _ = table.unpost(inum, &state);
            }
            5 => {
                let _ = table.enable(inum, &state);
            }
            6 => {
                let _ = table.disable(inum, &state);
            }
            _ => {
                let _ = table.force(inum, &state);
            }
        }
        assert_eq!(
            table.pending_mask(),
            table.posted_mask() & table.enabled_mask()
        );
        if let Some(lowest) = table.lowest_pending() {
            assert!(table.is_pending(lowest));
        }
    }
});

#![no_main]
use libfuzzer_sys::fuzz_target;
use qalloc_core::{Heap, HeapConfig, VecRegion};

// Interprets the input as 4-byte operations against a small heap and checks
// integrity plus block contents after every step.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let config = HeapConfig::new().with_initial_pages(1).with_extend_pages(1);
    let Ok(mut heap) = Heap::new(VecRegion::new(4096, 1 << 20), config) else {
        return;
    };
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    for (step, chunk) in data.chunks_exact(4).enumerate() {
        let op = chunk[0] % 6;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize % 8192;
        let pick = chunk[3] as usize;
        let tag = step as u8 | 1;

        match op {
            0 | 1 => {
                if let Ok(addr) = heap.malloc(size) {
                    heap.write_bytes(addr, &vec![tag; size]);
                    live.push((addr, size, tag));
                }
            }
            2 => {
                if !live.is_empty() {
                    let (addr, _, _) = live.swap_remove(pick % live.len());
                    heap.free(addr);
                }
            }
            3 => {
                if !live.is_empty() {
                    let idx = pick % live.len();
                    let (addr, old, old_tag) = live[idx];
                    match heap.realloc(addr, size) {
                        Ok(Some(moved)) => {
                            let mut kept = vec![0u8; old.min(size)];
                            heap.read_bytes(moved, &mut kept);
                            assert!(kept.iter().all(|&b| b == old_tag));
                            heap.write_bytes(moved, &vec![tag; size]);
                            live[idx] = (moved, size, tag);
                        }
                        Ok(None) => {
                            live.swap_remove(idx);
                        }
                        Err(_) => {}
                    }
                }
            }
            4 => {
                let align = 1usize << (pick % 13);
                if let Ok(addr) = heap.aligned_alloc(align, size) {
                    assert_eq!(addr % align, 0);
                    heap.write_bytes(addr, &vec![tag; size]);
                    live.push((addr, size, tag));
                }
            }
            _ => {
                if let Ok(addr) = heap.calloc(pick, size % 64) {
                    let mut zeroed = vec![0xFFu8; pick * (size % 64)];
                    heap.read_bytes(addr, &mut zeroed);
                    assert!(zeroed.iter().all(|&b| b == 0));
                    live.push((addr, 0, tag));
                }
            }
        }

        assert!(heap.check_integrity().is_ok());
    }

    for (addr, size, tag) in live {
        let mut bytes = vec![0u8; size];
        heap.read_bytes(addr, &mut bytes);
        assert!(bytes.iter().all(|&b| b == tag));
        heap.free(addr);
    }
    assert!(heap.check_integrity().is_ok());
    assert_eq!(heap.stats().used_chunks, 0);
});

//! End-to-end scans over small hand-built and generated snapshots

#[cfg(test)]
mod tests {
    use crate::pointer_scan::chain_builder::search;
    use crate::pointer_scan::index::PointerIndex;
    use crate::pointer_scan::scanner::build_pointer_index;
    use crate::pointer_scan::snapshot::MemorySnapshot;
    use crate::pointer_scan::tests::mock_memory::{scattered_pointers, MockMemory};
    use crate::pointer_scan::types::{PointerChainResult, ScanConfig};

    fn index_for(snapshot: &MemorySnapshot, config: &ScanConfig) -> PointerIndex {
        build_pointer_index(snapshot, config.index_params(), 0, |_, _, _| {}, || false).unwrap()
    }

    fn scan(snapshot: &MemorySnapshot, config: &ScanConfig) -> Vec<PointerChainResult> {
        let index = index_for(snapshot, config);
        search(&index, config).unwrap().collect()
    }

    /// Two-level fixture: 0x1004 -> 0x1010 -> 0x2000
    fn two_level_snapshot() -> MemorySnapshot {
        let mut memory = MockMemory::new(0x1000, 0x40, false);
        memory.write_u32(0x1004, 0x1010).write_u32(0x1010, 0x2000);
        memory.snapshot()
    }

    #[test]
    fn test_single_direct_pointer() {
        let mut memory = MockMemory::new(0x1000, 0x40, false);
        memory.write_u32(0x1008, 0x1020);
        let config = ScanConfig::new(0x1020)
            .with_addressable_range(0x1000, 0x40)
            .with_depth(1)
            .with_offsets(0, 0, 0)
            .with_align(4);

        let results = scan(&memory.snapshot(), &config);
        assert_eq!(results, vec![PointerChainResult::new(0x1008, vec![0])]);
    }

    #[test]
    fn test_two_level_chain() {
        let config = ScanConfig::new(0x2000)
            .with_addressable_range(0x1000, 0x1100)
            .with_depth(2)
            .with_offsets(0, 0, 0);

        let results = scan(&two_level_snapshot(), &config);
        assert!(results.contains(&PointerChainResult::new(0x1010, vec![0])));
        assert!(results.contains(&PointerChainResult::new(0x1004, vec![0, 0])));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_offset_window_excludes_other_offsets() {
        let config = ScanConfig::new(0x2004)
            .with_addressable_range(0x1000, 0x1100)
            .with_depth(2)
            .with_offsets(4, 4, 4);

        let results = scan(&two_level_snapshot(), &config);
        // 0x1004 -> 0x1010 would need offset 0 at the second hop
        assert_eq!(results, vec![PointerChainResult::new(0x1010, vec![4])]);
    }

    #[test]
    fn test_little_endian_chain() {
        let mut memory = MockMemory::new(0x1000, 0x40, true);
        memory.write_u32(0x1004, 0x1010).write_u32(0x1010, 0x2000);
        let config = ScanConfig::new(0x2008)
            .with_addressable_range(0x1000, 0x1100)
            .with_depth(2)
            .with_offsets(0, 8, 0);

        let results = scan(&memory.snapshot(), &config);
        assert_eq!(
            results,
            vec![
                PointerChainResult::new(0x1010, vec![8]),
                PointerChainResult::new(0x1004, vec![0, 8]),
            ]
        );
        assert_eq!(results[1].to_string(), "00001004->+0x0->+0x8");
    }

    #[test]
    fn test_generated_snapshot_properties() {
        println!("\n=== Chain properties over a generated snapshot ===\n");

        let base = 0x1000_0000;
        let memory = scattered_pointers(base, 0x4000, 0xC0FF_EE00);
        let snapshot = memory.snapshot();
        let config = ScanConfig::new(base + 0x2000)
            .with_addressable_range(base, 0x4000)
            .with_depth(4)
            .with_offsets(0, 0x20, 0x60);

        let index = index_for(&snapshot, &config);
        println!("Indexed {} pointers", index.len());
        for entry in index.entries() {
            assert_eq!(snapshot.read_u32(entry.address), Some(entry.value));
            assert!(entry.value >= base && entry.value < base + 0x4000);
        }

        let first: Vec<_> = search(&index, &config).unwrap().collect();
        let second: Vec<_> = search(&index, &config).unwrap().collect();
        println!("Found {} chains", first.len());
        assert!(!first.is_empty());
        assert_eq!(first, second);

        let mut last_depth = 0;
        for chain in &first {
            assert!((1..=4).contains(&chain.depth()), "{}", chain);
            assert!(chain.depth() >= last_depth, "results are not level ordered");
            last_depth = chain.depth();

            assert_eq!(chain.resolve(&snapshot), Some(config.search_address), "{}", chain);

            let (nearest, rest) = chain.offsets.split_last().unwrap();
            assert!((0..=0x20).contains(nearest), "{}", chain);
            assert!(rest.iter().all(|o| (0..=0x60).contains(o)), "{}", chain);
        }

        println!("\n=== Done ===\n");
    }

    #[test]
    fn test_rebuilt_index_gives_same_results() {
        let memory = scattered_pointers(0x2000_0000, 0x2000, 7);
        let config = ScanConfig::new(0x2000_1000)
            .with_addressable_range(0x2000_0000, 0x2000)
            .with_depth(3)
            .with_offsets(4, 0x80, 0x80);

        let snapshot = memory.snapshot();
        assert_eq!(scan(&snapshot, &config), scan(&snapshot, &config));
    }

    #[test]
    fn test_no_pointers_yields_no_results() {
        let memory = MockMemory::new(0x1000, 0x40, false);
        let config = ScanConfig::new(0x1020).with_addressable_range(0x1000, 0x40);
        assert!(scan(&memory.snapshot(), &config).is_empty());
    }
}

#[cfg(test)]
mod tests {
    use memshadow::{
        origin::{OriginKind, Otag},
        secmap::Uniform,
        vbits::Width,
        CheckLevel, ShadowConfig, ShadowMemory,
    };

    fn engine_with_origins() -> ShadowMemory {
        ShadowMemory::new(ShadowConfig {
            level: CheckLevel::UndefinedWithOrigins,
            ..ShadowConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_copy_range_states_and_patterns() {
        let mut shadow = ShadowMemory::new(ShadowConfig::default()).unwrap();
        shadow.mark_range(0x1_0000, 0x100, Uniform::Undefined);
        shadow.mark_range(0x2_0000, 0x100, Uniform::Defined);
        shadow.store(0x1_0000, Width::W32, 0);
        shadow.store(0x1_0004, Width::W8, 0x3c);

        shadow.copy_range(0x1_0000, 0x2_0010, 16);

        assert_eq!(shadow.load(0x2_0010, Width::W32), (0, true));
        assert_eq!(shadow.load(0x2_0014, Width::W8), (0x3c, true));
        assert_eq!(shadow.load(0x2_0015, Width::W8), (0xff, true));
        // Bytes outside the copy keep their state.
        assert_eq!(shadow.load(0x2_0020, Width::W8), (0, true));
    }

    #[test]
    fn test_copy_range_overlapping() {
        let mut shadow = ShadowMemory::new(ShadowConfig::default()).unwrap();
        shadow.mark_range(0x1_0000, 0x100, Uniform::Defined);
        shadow.store(0x1_0000, Width::W64, u64::MAX);
        // Forward overlap, copied like memmove: the undefined window
        // shifts up by four bytes without smearing over itself.
        shadow.copy_range(0x1_0000, 0x1_0004, 12);
        assert_eq!(shadow.load(0x1_0000, Width::W64), (u64::MAX, true));
        assert_eq!(shadow.load(0x1_0008, Width::W64), (0x0000_0000_ffff_ffff, true));
        assert_eq!(shadow.load(0x1_0010, Width::W8), (0, true));
    }

    #[test]
    fn test_copy_range_carries_origins() {
        let mut shadow = engine_with_origins();
        let tag = Otag::new(0x42, OriginKind::Heap);
        shadow.mark_undefined_with_origin(0x1_0000, 32, tag);
        shadow.mark_range(0x2_0000, 0x100, Uniform::Defined);
        shadow.copy_range(0x1_0000, 0x2_0040, 32);
        assert_eq!(shadow.load_origin(0x2_0040, 4), tag);
        assert_eq!(shadow.load(0x2_0040, Width::W32), (Width::W32.mask(), true));
    }

    #[test]
    fn test_copy_range_noaccess_propagates() {
        let mut shadow = ShadowMemory::new(ShadowConfig::default()).unwrap();
        shadow.mark_range(0x2_0000, 0x100, Uniform::Defined);
        // Source was never mapped; the copied bytes become no-access too.
        shadow.copy_range(0x1_0000, 0x2_0000, 4);
        let (_, ok) = shadow.load(0x2_0000, Width::W32);
        assert!(!ok);
    }

    #[test]
    fn test_stats_counters() {
        let mut shadow = engine_with_origins();
        shadow.mark_range(0x1_0000, 0x1_0000, Uniform::Defined);
        shadow.store(0x1_0000, Width::W32, 0);
        shadow.load(0x1_0000, Width::W32);
        shadow.load(0x1_0004, Width::W32);
        shadow.store_origin(0x1_0000, 4, Otag::new(1, OriginKind::Heap));
        let stats = shadow.stats();
        assert_eq!(stats.loads, 2);
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.pages.defined, 1);
        assert!(stats.ocache.l1_hits + stats.ocache.l1_misses > 0);
        let dump = stats.to_string();
        assert!(dump.contains("pages:"));
        assert!(dump.contains("ocache:"));
    }

    #[test]
    fn test_reset_all_defined() {
        let mut shadow = engine_with_origins();
        shadow.mark_range(0x1_0000, 0x1_0000, Uniform::Undefined);
        shadow.store(0x1_0005, Width::W8, 0x0f);
        shadow.store_origin(0x1_0000, 4, Otag::new(2, OriginKind::Stack));
        shadow.reg_write(0, Width::W64, u64::MAX).unwrap();

        shadow.reset_all_defined();

        assert_eq!(shadow.load(0x1_0005, Width::W8), (0, true));
        assert_eq!(shadow.load(0x1_0000, Width::W64), (0, true));
        assert_eq!(shadow.load_origin(0x1_0000, 4), Otag::NONE);
        assert_eq!(shadow.reg_read(0, Width::W64), Ok(0));
        assert_eq!(shadow.stats().secvbit_nodes, 0);
        // Every primary page now reads defined, even previously unmapped
        // ones.
        assert_eq!(shadow.load(0x9_0000, Width::W8), (0, true));
    }
}

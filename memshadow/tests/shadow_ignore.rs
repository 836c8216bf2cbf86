#[cfg(test)]
mod tests {
    use memshadow::{
        ignore::{IgnoreError, IgnoreLabel},
        vbits::Width,
        ShadowConfig, ShadowMemory, ShadowMemoryError,
    };

    fn engine() -> ShadowMemory {
        ShadowMemory::new(ShadowConfig::default()).unwrap()
    }

    #[test]
    fn test_runtime_bind_and_classify() {
        let mut shadow = engine();
        shadow
            .bind_ignore(0x3000..0x4000, IgnoreLabel::RuntimeIgnore)
            .unwrap();
        assert_eq!(shadow.classify_ignore(0x3500), IgnoreLabel::RuntimeIgnore);
        assert_eq!(shadow.classify_ignore(0x4500), IgnoreLabel::NotIgnored);
    }

    #[test]
    fn test_configured_ignores_from_config() {
        let shadow = ShadowMemory::new(ShadowConfig {
            configured_ignores: vec![0x5000..0x6000],
            ..ShadowConfig::default()
        })
        .unwrap();
        assert_eq!(shadow.classify_ignore(0x5800), IgnoreLabel::ConfiguredIgnore);
        assert_eq!(shadow.classify_ignore(0x6000), IgnoreLabel::NotIgnored);
    }

    #[test]
    fn test_oversized_configured_range_rejected() {
        let cap = 64 * 1024 * 1024;
        let err = ShadowMemory::new(ShadowConfig {
            configured_ignores: vec![0..cap + 1],
            ..ShadowConfig::default()
        })
        .unwrap_err();
        assert_eq!(
            err,
            ShadowMemoryError::Config(IgnoreError::RangeTooLarge(0, cap + 1, cap))
        );
    }

    #[test]
    fn test_findings_suppressed_in_ignored_range() {
        let mut shadow = engine();
        shadow
            .bind_ignore(0x1000..0x2000, IgnoreLabel::RuntimeIgnore)
            .unwrap();
        // Both addresses are no-access; only the one outside the ignored
        // range produces a finding.
        let (_, ok) = shadow.load(0x1800, Width::W8);
        assert!(!ok);
        let (_, ok) = shadow.load(0x2800, Width::W8);
        assert!(!ok);
        let findings = shadow.take_findings();
        assert_eq!(findings.len(), 1);
        assert_eq!(shadow.stats().findings_suppressed, 1);
    }

    #[test]
    fn test_unbind_restores_reporting() {
        let mut shadow = engine();
        shadow
            .bind_ignore(0x1000..0x2000, IgnoreLabel::RuntimeIgnore)
            .unwrap();
        shadow
            .bind_ignore(0x1000..0x2000, IgnoreLabel::NotIgnored)
            .unwrap();
        let (_, ok) = shadow.load(0x1800, Width::W8);
        assert!(!ok);
        assert_eq!(shadow.take_findings().len(), 1);
    }

    #[test]
    fn test_exit_diagnostics_listing() {
        let mut shadow = ShadowMemory::new(ShadowConfig {
            configured_ignores: vec![0x5000..0x6000],
            ..ShadowConfig::default()
        })
        .unwrap();
        shadow
            .bind_ignore(0x8000..0x9000, IgnoreLabel::RuntimeIgnore)
            .unwrap();
        let ranges: Vec<_> = shadow.ignored_ranges().collect();
        assert_eq!(
            ranges,
            vec![
                (0x5000..0x6000, IgnoreLabel::ConfiguredIgnore),
                (0x8000..0x9000, IgnoreLabel::RuntimeIgnore),
            ]
        );
    }
}

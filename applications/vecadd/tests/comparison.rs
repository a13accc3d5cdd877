use offload::{Harness, HostBackend};
use proptest::prelude::*;
use vecadd::VecAddHooks;

fn cpu_vecadd(a: &[f32], b: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0f32; a.len()];
    for i in 0..a.len() {
        out[i] = a[i] + b[i];
    }
    out
}

#[test]
fn test_vecadd_matches_cpu() {
    let desc = vecadd::descriptor().unwrap();
    assert_eq!(desc.buffers.len(), 3);

    let report = Harness::new(HostBackend::new(vecadd::host_kernels()), desc)
        .run(&mut VecAddHooks::default())
        .unwrap();

    assert!(report.validation.passed(), "{}", report.validation);
    assert_eq!(report.iterations(), 1);
    let a = report.buffers.f32("a").unwrap();
    let b = report.buffers.f32("b").unwrap();
    let c = report.buffers.f32("c").unwrap();
    assert_eq!(c.len(), 4096);
    assert_eq!(c, cpu_vecadd(a, b).as_slice());
}

#[test]
fn test_embedded_descriptor_is_valid() {
    let desc = vecadd::descriptor().unwrap();
    offload::validate_descriptor(&desc).unwrap();
    assert!(desc.program.iter().all(|p| p.path.is_absolute()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn vecadd_any_length(len in 1usize..300, seed in any::<u64>()) {
        let desc = vecadd::descriptor_with_len(len).unwrap();
        let report = Harness::new(HostBackend::new(vecadd::host_kernels()), desc)
            .run(&mut VecAddHooks::seeded(seed))
            .unwrap();
        prop_assert!(report.validation.passed());
        let expected = cpu_vecadd(report.buffers.f32("a").unwrap(), report.buffers.f32("b").unwrap());
        prop_assert_eq!(report.buffers.f32("c").unwrap(), expected.as_slice());
    }
}

use hotspot::{Coefficients, HotspotHooks};
use offload::{Harness, HostBackend, RunReport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ROWS: usize = 64;
const COLS: usize = 64;
const SEED: u64 = 17;

/// Straightforward five-point stencil, clamped at the edges.
fn cpu_hotspot(temp: &[f32], power: &[f32], k: &Coefficients, iterations: u64) -> Vec<f32> {
    let mut cur = temp.to_vec();
    for _ in 0..iterations {
        let mut next = cur.clone();
        for r in 0..ROWS {
            for c in 0..COLS {
                let t = cur[r * COLS + c];
                let n = if r > 0 { cur[(r - 1) * COLS + c] } else { t };
                let s = if r + 1 < ROWS { cur[(r + 1) * COLS + c] } else { t };
                let w = if c > 0 { cur[r * COLS + c - 1] } else { t };
                let e = if c + 1 < COLS { cur[r * COLS + c + 1] } else { t };
                next[r * COLS + c] = t + k.step_div_cap
                    * (power[r * COLS + c]
                        + (s + n - 2.0 * t) * k.ry_inv
                        + (e + w - 2.0 * t) * k.rx_inv
                        + (k.amb_temp - t) * k.rz_inv);
            }
        }
        cur = next;
    }
    cur
}

fn initial_field() -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(99);
    (0..ROWS * COLS).map(|_| rng.gen_range(300.0..360.0)).collect()
}

fn run(iterations: u64, initial: Vec<f32>) -> RunReport {
    let desc = hotspot::descriptor().unwrap();
    Harness::new(HostBackend::new(hotspot::host_kernels()), desc)
        .run(&mut HotspotHooks::seeded(iterations, SEED).with_initial(initial))
        .unwrap()
}

#[test]
fn test_hotspot_matches_cpu() {
    let t0 = initial_field();
    let report = run(hotspot::ITERATIONS, t0.clone());

    assert!(report.validation.passed(), "{}", report.validation);
    assert_eq!(report.iterations(), 100);
    assert_eq!(report.profile.samples.len(), 100);
    assert!(!report.state.continue_flag);

    let k = Coefficients::for_grid(ROWS, COLS, 80.0);
    assert_eq!(report.scalars.f32("rx_inv").unwrap(), k.rx_inv);
    let expected = cpu_hotspot(&t0, report.buffers.f32("power").unwrap(), &k, 100);
    let got = report.buffers.f32("temp_src").unwrap();
    for (i, (g, e)) in got.iter().zip(&expected).enumerate() {
        assert!((g - e).abs() <= 1e-3, "cell {i}: got {g}, expected {e}");
    }
}

#[test]
fn test_split_run_equals_single_run() {
    let t0 = initial_field();
    let first = run(10, t0.clone());
    let t1 = first.buffers.f32("temp_src").unwrap().to_vec();
    let second = run(10, t1);
    let whole = run(20, t0);

    assert!(second.validation.passed());
    assert!(whole.validation.passed());
    assert_eq!(
        second.buffers.f32("temp_src").unwrap(),
        whole.buffers.f32("temp_src").unwrap()
    );
}

#[test]
fn test_single_iteration_still_swaps() {
    let t0 = initial_field();
    let report = run(1, t0.clone());
    assert_eq!(report.iterations(), 1);
    assert_eq!(report.buffers.f32("temp_dst").unwrap(), t0.as_slice());
    assert!(report.validation.passed());
}

use offload::RunReport;

pub struct BenchResult {
    pub name: String,
    pub backend: Option<&'static str>,
    pub iterations: u64,
    pub total_ms: f64,
    pub average_ms: f64,
    pub verified: Option<bool>,
}

fn median(mut times: Vec<f64>) -> f64 {
    if times.is_empty() {
        return f64::NAN;
    }
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    times[times.len() / 2]
}

/// Run a benchmark function `iterations` times and return the median.
pub fn median_of(iterations: usize, mut f: impl FnMut() -> f64) -> f64 {
    median((0..iterations).map(|_| f()).collect())
}

/// Run one application `rounds` times; times are the dispatch latencies the
/// harness measured, not process wall-clock.
pub fn measure(name: &str, rounds: usize, mut run: impl FnMut() -> offload::Result<RunReport>) -> BenchResult {
    let mut result = BenchResult {
        name: name.to_string(),
        backend: None,
        iterations: 0,
        total_ms: f64::NAN,
        average_ms: f64::NAN,
        verified: Some(true),
    };
    let mut averages = Vec::new();

    let total_ms = median_of(rounds.max(1), || match run() {
        Ok(report) => {
            result.backend = Some(report.backend);
            result.iterations = report.iterations();
            if !report.validation.passed() {
                result.verified = Some(false);
            }
            averages.push(report.profile.average.as_secs_f64() * 1000.0);
            report.profile.total.as_secs_f64() * 1000.0
        }
        Err(e) => {
            eprintln!("{} failed: {}", name, e);
            result.verified = Some(false);
            f64::NAN
        }
    });
    result.total_ms = total_ms;
    result.average_ms = median(averages);
    result
}

fn ms(value: f64) -> String {
    if value.is_nan() {
        "N/A".to_string()
    } else {
        format!("{:.3}ms", value)
    }
}

/// Print a latency table to stdout.
pub fn print_table(results: &[BenchResult]) {
    let name_w = 12;
    let col_w = 12;

    println!();
    println!(
        "{:<name_w$} {:>8} {:>10} {:>col_w$} {:>col_w$} {:>6}",
        "Benchmark", "Backend", "Iterations", "Total", "Average", "Check",
        name_w = name_w, col_w = col_w
    );
    println!("{}", "-".repeat(name_w + 8 + 10 + col_w * 2 + 6 + 5));

    for r in results {
        let check_str = match r.verified {
            Some(true) => "✓",
            Some(false) => "✗",
            None => "-",
        };

        println!(
            "{:<name_w$} {:>8} {:>10} {:>col_w$} {:>col_w$} {:>6}",
            r.name,
            r.backend.unwrap_or("-"),
            r.iterations,
            ms(r.total_ms),
            ms(r.average_ms),
            check_str,
            name_w = name_w, col_w = col_w
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_of_odd_and_even_counts() {
        let mut samples = vec![5.0, 1.0, 3.0].into_iter();
        assert_eq!(median_of(3, || samples.next().unwrap()), 3.0);
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), 3.0);
        assert!(median(Vec::new()).is_nan());
    }

    #[test]
    fn test_failed_round_marks_result_unverified() {
        let result = measure("broken", 3, || Err(offload::Error::NoDeviceAvailable));
        assert_eq!(result.verified, Some(false));
        assert!(result.total_ms.is_nan());
        assert_eq!(result.backend, None);
    }
}

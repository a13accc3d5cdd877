//! Output validation against reference arrays.
//!
//! Integer buffers compare exactly. Float buffers compare with the buffer's
//! tolerance (0 when none is declared) using an asymmetric boundary: an
//! actual value above the expected one is rejected once it is `epsilon` or
//! more away, one at or below the expected value only once it is strictly
//! more than `epsilon` away. NaN on either side never counts as a mismatch,
//! since neither ordered comparison holds.

use std::fmt;

use tracing::{info, warn};

use crate::buffer::{BufferSet, HostArray, HostBuffer};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mismatch {
    pub buffer: String,
    pub index: usize,
    pub expected: Value,
    pub actual: Value,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]: expected {}, got {}",
            self.buffer, self.index, self.expected, self.actual
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationReport {
    pub compared: Vec<String>,
    pub mismatches: Vec<Mismatch>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn first(&self) -> Option<&Mismatch> {
        self.mismatches.first()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            write!(f, "PASS ({} buffer(s) compared)", self.compared.len())
        } else {
            write!(
                f,
                "FAIL ({} mismatch(es) across {} buffer(s), first {})",
                self.mismatches.len(),
                self.compared.len(),
                self.mismatches[0]
            )
        }
    }
}

/// Whether `actual` is out of tolerance of `expected`.
///
/// The two sides differ at the boundary: `expected + epsilon` fails while
/// `expected - epsilon` passes. Making the upper test strict would let
/// `5.0 + eps` through whenever the f64 difference rounds to exactly `eps`.
pub fn exceeds_tolerance(expected: f64, actual: f64, epsilon: f64) -> bool {
    (actual > expected && actual - expected >= epsilon) || (expected >= actual && expected - actual > epsilon)
}

fn exact<T: PartialEq + Copy>(
    name: &str,
    actual: &[T],
    expected: &[T],
    wrap: impl Fn(T) -> Value,
    out: &mut Vec<Mismatch>,
) {
    for (index, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        if a != e {
            out.push(Mismatch {
                buffer: name.to_string(),
                index,
                expected: wrap(e),
                actual: wrap(a),
            });
        }
    }
}

fn tolerant<T: Copy + Into<f64>>(name: &str, actual: &[T], expected: &[T], epsilon: f64, out: &mut Vec<Mismatch>) {
    for (index, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let (a, e) = (a.into(), e.into());
        if exceeds_tolerance(e, a, epsilon) {
            out.push(Mismatch {
                buffer: name.to_string(),
                index,
                expected: Value::Float(e),
                actual: Value::Float(a),
            });
        }
    }
}

/// All mismatches of one buffer against its reference array. Buffers
/// without a reference compare clean.
pub fn compare(buffer: &HostBuffer) -> Vec<Mismatch> {
    let Some(reference) = buffer.reference() else {
        return Vec::new();
    };
    let name = buffer.name();
    let epsilon = buffer.tolerance().unwrap_or(0.0);
    let mut out = Vec::new();
    match (buffer.data(), reference) {
        (HostArray::U8(a), HostArray::U8(e)) => exact(name, a, e, |v| Value::UInt(v as u64), &mut out),
        (HostArray::I32(a), HostArray::I32(e)) => exact(name, a, e, |v| Value::Int(v as i64), &mut out),
        (HostArray::U32(a), HostArray::U32(e)) => exact(name, a, e, |v| Value::UInt(v as u64), &mut out),
        (HostArray::I64(a), HostArray::I64(e)) => exact(name, a, e, Value::Int, &mut out),
        (HostArray::F32(a), HostArray::F32(e)) => tolerant(name, a, e, epsilon, &mut out),
        (HostArray::F64(a), HostArray::F64(e)) => tolerant(name, a, e, epsilon, &mut out),
        // both arrays are created from the same buffer description
        _ => unreachable!("reference array of `{name}` has a different element type"),
    }
    out
}

/// Compare every buffer that carries a reference array. Never stops at the
/// first mismatch.
pub fn validate(buffers: &BufferSet) -> ValidationReport {
    let mut report = ValidationReport::default();
    for buffer in buffers.iter().filter(|b| b.reference().is_some()) {
        let mismatches = compare(buffer);
        for m in &mismatches {
            warn!(
                buffer = %m.buffer,
                index = m.index,
                expected = %m.expected,
                actual = %m.actual,
                "mismatch"
            );
        }
        report.compared.push(buffer.name().to_string());
        report.mismatches.extend(mismatches);
    }
    info!(
        compared = report.compared.len(),
        mismatches = report.mismatches.len(),
        passed = report.passed(),
        "validation complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_types::{AccessMode, BufferSpec, ElementType};
    use proptest::prelude::*;

    fn set_with(element: ElementType, tolerance: Option<f64>) -> BufferSet {
        BufferSet::from_specs(&[BufferSpec {
            name: "out".into(),
            element,
            len: 4,
            access: AccessMode::WriteOnly,
            reference: true,
            tolerance,
        }])
    }

    #[test]
    fn test_epsilon_boundary_is_asymmetric() {
        let eps = 0.5;
        assert!(exceeds_tolerance(5.0, 5.0 + eps, eps));
        assert!(!exceeds_tolerance(5.0, 5.0 - eps, eps));
        assert!(!exceeds_tolerance(5.0, 5.0, eps));
        assert!(!exceeds_tolerance(5.0, 5.25, eps));
        assert!(exceeds_tolerance(5.0, 4.4, eps));
    }

    #[test]
    fn test_float_buffer_boundary() {
        let mut set = set_with(ElementType::F32, Some(0.5));
        set.reference_mut::<f32>("out").unwrap().fill(5.0);
        set.f32_mut("out").unwrap().copy_from_slice(&[5.5, 4.5, 5.0, 6.0]);
        let mismatches = compare(set.get("out").unwrap());
        let indices: Vec<usize> = mismatches.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 3]);
        assert_eq!(mismatches[0].expected, Value::Float(5.0));
        assert_eq!(mismatches[0].actual, Value::Float(5.5));
    }

    #[test]
    fn test_nan_never_flags() {
        let mut set = set_with(ElementType::F64, Some(1e-6));
        set.slice_mut::<f64>("out").unwrap()[0] = f64::NAN;
        assert!(compare(set.get("out").unwrap()).is_empty());
    }

    #[test]
    fn test_integer_buffers_compare_exactly() {
        let mut set = set_with(ElementType::I32, None);
        set.i32_mut("out").unwrap().copy_from_slice(&[1, 2, 3, 4]);
        set.reference_mut::<i32>("out").unwrap().copy_from_slice(&[1, 0, 3, -4]);
        let report = validate(&set);
        assert!(!report.passed());
        assert_eq!(report.mismatches.len(), 2);
        assert_eq!(report.first().unwrap().index, 1);
        assert_eq!(report.mismatches[1].actual, Value::Int(4));
    }

    #[test]
    fn test_validate_keeps_going_across_buffers() {
        let specs: Vec<BufferSpec> = ["x", "y", "z"]
            .iter()
            .map(|n| BufferSpec {
                name: n.to_string(),
                element: ElementType::U32,
                len: 2,
                access: AccessMode::ReadWrite,
                reference: *n != "y",
                tolerance: None,
            })
            .collect();
        let mut set = BufferSet::from_specs(&specs);
        set.u32_mut("x").unwrap()[1] = 7;
        set.u32_mut("z").unwrap()[0] = 9;
        let report = validate(&set);
        assert_eq!(report.compared, vec!["x", "z"]);
        let found: Vec<(&str, usize)> = report
            .mismatches
            .iter()
            .map(|m| (m.buffer.as_str(), m.index))
            .collect();
        assert_eq!(found, vec![("x", 1), ("z", 0)]);
        assert!(report.to_string().starts_with("FAIL"));
    }

    proptest! {
        #[test]
        fn test_tolerance_window(
            expected in -1.0e3f64..1.0e3,
            eps in 1.0e-3f64..1.0,
            frac in 0.0f64..0.9,
        ) {
            prop_assert!(!exceeds_tolerance(expected, expected + eps * frac, eps));
            prop_assert!(!exceeds_tolerance(expected, expected - eps * frac, eps));
            prop_assert!(exceeds_tolerance(expected, expected + eps * 2.0, eps));
            prop_assert!(exceeds_tolerance(expected, expected - eps * 2.0, eps));
            prop_assert!(!exceeds_tolerance(expected, f64::NAN, eps));
            prop_assert!(!exceeds_tolerance(f64::NAN, expected, eps));
        }
    }
}

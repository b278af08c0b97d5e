//! Angular error between axis-angle rotations, and the per-class median
//! aggregate used to score an evaluation pass.

use nalgebra::{Rotation3, Vector3};

/// An axis-angle rotation vector: direction = axis, norm = angle (radians).
pub type RotationVector = [f32; 3];

fn rotation(v: &RotationVector) -> Rotation3<f64> {
    Rotation3::new(Vector3::new(v[0] as f64, v[1] as f64, v[2] as f64))
}

/// Angle (radians, in `[0, π]`) of the rotation mapping `a` onto `b`.
///
/// Computed from `trace(R(a)ᵀ R(b))`; the cosine is clamped to `[-1, 1]`
/// so rounding near 0 and π never reaches `acos` out of domain.
pub fn geodesic_distance(a: &RotationVector, b: &RotationVector) -> f64 {
    let relative = rotation(a).transpose() * rotation(b);
    let cos = (relative.matrix().trace() - 1.0) / 2.0;
    cos.clamp(-1.0, 1.0).acos()
}

/// Median of a slice (mean of the two middle values for even lengths).
/// Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    } else {
        Some(sorted[mid])
    }
}

/// Median geodesic error for each class; `None` where the class has no samples.
///
/// Panics if the three sequences differ in length or a label is `>= num_classes`.
pub fn per_class_medians(
    predictions: &[RotationVector],
    targets: &[RotationVector],
    labels: &[u32],
    num_classes: usize,
) -> Vec<Option<f64>> {
    assert_eq!(predictions.len(), targets.len(), "predictions/targets length mismatch");
    assert_eq!(predictions.len(), labels.len(), "predictions/labels length mismatch");

    let mut errors = vec![Vec::new(); num_classes];
    for ((p, t), &label) in predictions.iter().zip(targets).zip(labels) {
        errors[label as usize].push(geodesic_distance(p, t));
    }
    errors.iter().map(|e| median(e)).collect()
}

/// Mean over populated classes of the per-class median geodesic error (radians).
///
/// Classes without samples are left out of the mean rather than counted as
/// zero error. Returns `NaN` when no class is populated.
pub fn aggregate(
    predictions: &[RotationVector],
    targets: &[RotationVector],
    labels: &[u32],
    num_classes: usize,
) -> f64 {
    let medians: Vec<f64> = per_class_medians(predictions, targets, labels, num_classes)
        .into_iter()
        .flatten()
        .collect();
    if medians.is_empty() {
        return f64::NAN;
    }
    medians.iter().sum::<f64>() / medians.len() as f64
}

// ── Tests ───────────────────────────────────────────────────────────────────

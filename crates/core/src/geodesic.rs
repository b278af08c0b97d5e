//! Differentiable rotation geometry on batched axis-angle tensors.
//!
//! Candle has no inverse-cosine op, so [`acos`] is a custom op with an
//! explicit backward pass. It runs on host memory; the batches it sees are
//! `(B,)` cosines, so the round trip is cheap.

use candle_core::{bail, CpuStorage, CustomOp1, Device, Layout, Result, Shape, Tensor, D};

/// Cosines fed to [`acos`] inside the loss are kept this far from ±1 so the
/// derivative `-1/√(1-x²)` stays finite.
const COS_MARGIN: f64 = 1e-6;

/// Added under the square root of `|v|²` so `|v|` is differentiable at 0.
const NORM_EPS: f64 = 1e-12;

// ── acos ────────────────────────────────────────────────────────────────────

struct Acos;

impl CustomOp1 for Acos {
    fn name(&self) -> &'static str {
        "acos"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let (start, end) = match layout.contiguous_offsets() {
            Some(offsets) => offsets,
            None => bail!("acos: input must be contiguous"),
        };
        let out = match storage {
            CpuStorage::F32(v) => CpuStorage::F32(v[start..end].iter().map(|x| x.acos()).collect()),
            CpuStorage::F64(v) => CpuStorage::F64(v[start..end].iter().map(|x| x.acos()).collect()),
            _ => bail!("acos: expected an f32 or f64 tensor"),
        };
        Ok((out, layout.shape().clone()))
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        // d/dx acos(x) = -1 / √(1 - x²)
        let denom = (arg.sqr()?.neg()? + 1.0)?.sqrt()?;
        Ok(Some((grad_res.neg()? / denom)?))
    }
}

/// Element-wise inverse cosine with gradient support. Inputs must lie in `[-1, 1]`.
pub fn acos(x: &Tensor) -> Result<Tensor> {
    let device = x.device().clone();
    let host = x.to_device(&Device::Cpu)?.contiguous()?;
    host.apply_op1(Acos)?.to_device(&device)
}

// ── Rotation matrices ───────────────────────────────────────────────────────

/// Rodrigues' formula: `(B, 3)` axis-angle vectors → `(B, 3, 3)` rotation matrices.
///
/// Uses the unnormalised skew matrix `K = [v]ₓ`:
/// `R = I + (sin θ / θ)·K + ((1 − cos θ) / θ²)·K²`, `θ = |v|`.
pub fn axis_angle_to_matrix(v: &Tensor) -> Result<Tensor> {
    let (b, _) = v.dims2()?;
    let theta = (v.sqr()?.sum_keepdim(1)? + NORM_EPS)?.sqrt()?;

    let x = v.narrow(1, 0, 1)?;
    let y = v.narrow(1, 1, 1)?;
    let z = v.narrow(1, 2, 1)?;
    let zero = x.zeros_like()?;
    let k = Tensor::cat(
        &[
            &zero, &z.neg()?, &y, //
            &z, &zero, &x.neg()?, //
            &y.neg()?, &x, &zero,
        ],
        1,
    )?
    .reshape((b, 3, 3))?;
    let k2 = k.matmul(&k)?;

    let a = (theta.sin()? / &theta)?.reshape((b, 1, 1))?;
    let c = ((theta.cos()?.neg()? + 1.0)? / theta.sqr()?)?.reshape((b, 1, 1))?;
    let eye = Tensor::from_vec(
        vec![1f32, 0., 0., 0., 1., 0., 0., 0., 1.],
        (3, 3),
        v.device(),
    )?
    .to_dtype(v.dtype())?;

    k.broadcast_mul(&a)?.broadcast_add(&eye)? + k2.broadcast_mul(&c)?
}

/// Cosine of the geodesic angle between paired rotations: `(tr(R₁ᵀR₂) − 1) / 2`, shape `(B,)`.
fn relative_cosine(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (n, _) = a.dims2()?;
    let ra = axis_angle_to_matrix(a)?;
    let rb = axis_angle_to_matrix(b)?;
    let trace = (ra * rb)?.reshape((n, 9))?.sum(1)?;
    (trace - 1.0)? * 0.5
}

/// Per-sample geodesic angle (radians) between two `(B, 3)` axis-angle batches.
pub fn geodesic_angles(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let cos = relative_cosine(pred, target)?.clamp(-1.0 + COS_MARGIN, 1.0 - COS_MARGIN)?;
    acos(&cos)
}

/// Mean geodesic angle over the batch; a scalar tensor.
pub fn geodesic_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    geodesic_angles(pred, target)?.mean_all()
}

// ── Bin + residual reconstruction ───────────────────────────────────────────

/// `center[argmax(bin_logits)] + residual`, shape `(B, 3)`.
///
/// `centers` is the `(K, 3)` dictionary tensor. The bin comes from the
/// model's own prediction, not the target bin.
pub fn reconstruct(centers: &Tensor, bin_logits: &Tensor, residual: &Tensor) -> Result<Tensor> {
    let bins = bin_logits.argmax(D::Minus1)?;
    centers.index_select(&bins, 0)? + residual
}

// ── Tests ───────────────────────────────────────────────────────────────────

//! Truncated-normal parameter initialization.
//!
//! Samples are generated by drawing uniformly from the image of the
//! truncation interval under the normal CDF and mapping back through the
//! inverse error function, then clamping to guard the floating-point tails.

use candle_core::{Device, Result, Shape, Tensor};

/// Standard normal cumulative distribution function.
fn norm_cdf(x: f64) -> f64 {
    (1.0 + erf(x / std::f64::consts::SQRT_2)) / 2.0
}

/// Error function, Abramowitz & Stegun approximation 7.1.26.
/// Max absolute error 1.5e-7, ample for sampling bounds.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = ((((1.061405429 * t - 1.453152027) * t + 1.421413741) * t - 0.284496736) * t
        + 0.254829592)
        * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// Inverse error function, Giles' single-precision approximation.
fn erf_inv(x: f32) -> f32 {
    let w = -((1.0 - x) * (1.0 + x)).ln();
    if w < 5.0 {
        let w = w - 2.5;
        let mut p = 2.810_226_4e-8;
        p = 3.432_739_4e-7 + p * w;
        p = -3.523_387_7e-6 + p * w;
        p = -4.391_506_5e-6 + p * w;
        p = 2.185_808_7e-4 + p * w;
        p = -1.253_725_0e-3 + p * w;
        p = -4.177_681_6e-3 + p * w;
        p = 2.466_407_3e-1 + p * w;
        p = 1.501_409_4 + p * w;
        p * x
    } else {
        let w = w.sqrt() - 3.0;
        let mut p = -2.002_142_6e-4;
        p = 1.009_505_6e-4 + p * w;
        p = 1.349_343_2e-3 + p * w;
        p = -3.673_428_4e-3 + p * w;
        p = 5.739_507_7e-3 + p * w;
        p = -7.622_461_3e-3 + p * w;
        p = 9.438_870_5e-3 + p * w;
        p = 1.001_674_1 + p * w;
        p = 2.832_976_8 + p * w;
        p * x
    }
}

/// Sample a tensor from a normal distribution with the given `mean` and
/// `std`, truncated to `[a, b]`.
///
/// The bounds apply to the final values (after `mean`/`std` scaling), so
/// they should be chosen in the same range. Deterministic given the device
/// random source.
pub fn trunc_normal<S: Into<Shape>>(
    shape: S,
    mean: f64,
    std: f64,
    a: f64,
    b: f64,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();

    if mean < a - 2.0 * std || mean > b + 2.0 * std {
        tracing::warn!(
            mean,
            std,
            a,
            b,
            "truncated-normal mean is more than 2 std outside the bounds; \
             the distribution of sampled values may be incorrect"
        );
    }

    let lower = norm_cdf((a - mean) / std);
    let upper = norm_cdf((b - mean) / std);

    // Uniform over the CDF image of [a, b], shifted to erf's [-1, 1] domain.
    let lo = (2.0 * lower - 1.0) as f32;
    let up = (2.0 * upper - 1.0) as f32;
    if up - lo < f32::EPSILON {
        // Degenerate interval: the whole mass sits at one point.
        return Tensor::full(
            (mean.clamp(a, b)) as f32,
            shape,
            device,
        );
    }

    let uniform = Tensor::rand(lo, up, shape.elem_count(), device)?;
    let samples = uniform.to_vec1::<f32>()?;

    let scale = (std * std::f64::consts::SQRT_2) as f32;
    let (min, max) = (a as f32, b as f32);
    let data: Vec<f32> = samples
        .into_iter()
        .map(|v| (erf_inv(v) * scale + mean as f32).clamp(min, max))
        .collect();

    Tensor::from_vec(data, shape, device)
}

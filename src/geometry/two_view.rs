//! Two-view reconstruction for monocular map initialization.
//!
//! - normalized 8-point fundamental matrix inside RANSAC, scored with the
//!   symmetric epipolar chi-square test
//! - essential matrix decomposition into four `(R, t)` hypotheses
//! - linear triangulation and cheirality/reprojection/parallax checks

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x4, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;

/// Chi-square 95% for one degree of freedom.
const CHI2_1DOF: f64 = 3.841;
/// Chi-square 95% for two degrees of freedom, used as score offset.
const CHI2_2DOF: f64 = 5.991;
/// `cos` of the smallest parallax a point must have to count as well conditioned.
const MAX_COS_PARALLAX: f64 = 0.99998;

/// Eigenvector of `AᵀA` with the smallest eigenvalue (least-squares null vector).
pub(crate) fn smallest_eigenvector(a: &DMatrix<f64>) -> DVector<f64> {
    let ata = a.transpose() * a;
    let eig = ata.symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &v)| if v < best.1 { (i, v) } else { best });
    eig.eigenvectors.column(min_idx).into_owned()
}

/// SVD with singular values sorted in decreasing order.
fn sorted_svd3(m: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let v = v_t.transpose();
    let s = svd.singular_values;
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| s[b].partial_cmp(&s[a]).unwrap_or(std::cmp::Ordering::Equal));
    let mut u_s = Matrix3::zeros();
    let mut v_s = Matrix3::zeros();
    let mut s_s = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        u_s.set_column(dst, &u.column(src));
        v_s.set_column(dst, &v.column(src));
        s_s[dst] = s[src];
    }
    Some((u_s, s_s, v_s))
}

/// Hartley normalization: zero mean, unit mean absolute deviation.
fn normalize(points: &[Vector2<f64>]) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let n = points.len().max(1) as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mut dev = Vector2::zeros();
    for p in points {
        dev.x += (p.x - mean.x).abs();
        dev.y += (p.y - mean.y).abs();
    }
    dev /= n;
    let sx = if dev.x > 0.0 { 1.0 / dev.x } else { 1.0 };
    let sy = if dev.y > 0.0 { 1.0 / dev.y } else { 1.0 };
    let normalized = points
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(
        sx, 0.0, -mean.x * sx,
        0.0, sy, -mean.y * sy,
        0.0, 0.0, 1.0,
    );
    (normalized, t)
}

/// Linear fundamental matrix `F21` (x2ᵀ F21 x1 = 0) with rank 2 enforced.
fn compute_f21(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    let mut a = DMatrix::zeros(n, 9);
    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);
        let row = [u2 * u1, u2 * v1, u2, v2 * u1, v2 * v1, v2, u1, v1, 1.0];
        for (j, val) in row.iter().enumerate() {
            a[(i, j)] = *val;
        }
    }
    let f = smallest_eigenvector(&a);
    let f_pre = Matrix3::from_row_slice(f.as_slice());
    let (u, mut s, v) = sorted_svd3(&f_pre)?;
    s[2] = 0.0;
    Some(u * Matrix3::from_diagonal(&s) * v.transpose())
}

/// Symmetric transfer score of `F21`. Returns the score and inlier flags.
fn check_fundamental(
    f21: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    sigma: f64,
) -> (f64, Vec<bool>) {
    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut score = 0.0;
    let mut inliers = vec![false; p1.len()];
    for i in 0..p1.len() {
        let x1 = Vector3::new(p1[i].x, p1[i].y, 1.0);
        let x2 = Vector3::new(p2[i].x, p2[i].y, 1.0);
        let mut good = true;

        // Epipolar line of x1 in the second image.
        let l2 = f21 * x1;
        let num2 = l2.dot(&x2);
        let chi2_2 = num2 * num2 / (l2.x * l2.x + l2.y * l2.y) * inv_sigma2;
        if chi2_2 > CHI2_1DOF || !chi2_2.is_finite() {
            good = false;
        } else {
            score += CHI2_2DOF - chi2_2;
        }

        let l1 = f21.transpose() * x2;
        let num1 = l1.dot(&x1);
        let chi2_1 = num1 * num1 / (l1.x * l1.x + l1.y * l1.y) * inv_sigma2;
        if chi2_1 > CHI2_1DOF || !chi2_1.is_finite() {
            good = false;
        } else {
            score += CHI2_2DOF - chi2_1;
        }

        inliers[i] = good;
    }
    (score, inliers)
}

/// Best-scoring fundamental matrix over `iterations` random 8-point sets.
pub fn find_fundamental(
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    iterations: usize,
    sigma: f64,
    rng: &mut StdRng,
) -> Option<(Matrix3<f64>, Vec<bool>, f64)> {
    let n = p1.len();
    if n < 8 || p2.len() != n {
        return None;
    }
    let (n1, t1) = normalize(p1);
    let (n2, t2) = normalize(p2);

    let mut best: Option<(Matrix3<f64>, Vec<bool>, f64)> = None;
    for _ in 0..iterations {
        let idx = sample(rng, n, 8);
        let s1: Vec<_> = idx.iter().map(|i| n1[i]).collect();
        let s2: Vec<_> = idx.iter().map(|i| n2[i]).collect();
        let Some(fn21) = compute_f21(&s1, &s2) else {
            continue;
        };
        let f21 = t2.transpose() * fn21 * t1;
        let (score, inliers) = check_fundamental(&f21, p1, p2, sigma);
        if best.as_ref().map_or(true, |b| score > b.2) {
            best = Some((f21, inliers, score));
        }
    }
    best
}

/// Linear triangulation of one correspondence given two projection matrices.
pub fn triangulate(
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
) -> Option<Vector3<f64>> {
    let mut a = DMatrix::zeros(4, 4);
    for j in 0..4 {
        a[(0, j)] = x1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = x1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = x2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = x2.y * p2[(2, j)] - p2[(1, j)];
    }
    let x = smallest_eigenvector(&a);
    if x[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    (p.x.is_finite() && p.y.is_finite() && p.z.is_finite()).then_some(p)
}

/// Outcome of checking one motion hypothesis.
struct RtCheck {
    n_good: usize,
    parallax_deg: f64,
    points: Vec<Option<Vector3<f64>>>,
    triangulated: Vec<bool>,
}

fn check_rt(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    inliers: &[bool],
    k: &Matrix3<f64>,
    th2: f64,
) -> RtCheck {
    let mut proj1 = Matrix3x4::zeros();
    proj1.fixed_view_mut::<3, 3>(0, 0).copy_from(k);
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    rt.set_column(3, t);
    let proj2 = k * rt;

    let o1 = Vector3::zeros();
    let o2 = -r.transpose() * t;
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);

    let mut out = RtCheck {
        n_good: 0,
        parallax_deg: 0.0,
        points: vec![None; p1.len()],
        triangulated: vec![false; p1.len()],
    };
    let mut cos_parallaxes = Vec::new();

    for i in 0..p1.len() {
        if !inliers[i] {
            continue;
        }
        let Some(p3d_c1) = triangulate(&p1[i], &p2[i], &proj1, &proj2) else {
            continue;
        };

        let normal1 = p3d_c1 - o1;
        let normal2 = p3d_c1 - o2;
        let cos_parallax = normal1.dot(&normal2) / (normal1.norm() * normal2.norm());

        if p3d_c1.z <= 0.0 && cos_parallax < MAX_COS_PARALLAX {
            continue;
        }
        let p3d_c2 = r * p3d_c1 + t;
        if p3d_c2.z <= 0.0 && cos_parallax < MAX_COS_PARALLAX {
            continue;
        }

        let inv_z1 = 1.0 / p3d_c1.z;
        let e1x = fx * p3d_c1.x * inv_z1 + cx - p1[i].x;
        let e1y = fy * p3d_c1.y * inv_z1 + cy - p1[i].y;
        if e1x * e1x + e1y * e1y > th2 {
            continue;
        }
        let inv_z2 = 1.0 / p3d_c2.z;
        let e2x = fx * p3d_c2.x * inv_z2 + cx - p2[i].x;
        let e2y = fy * p3d_c2.y * inv_z2 + cy - p2[i].y;
        if e2x * e2x + e2y * e2y > th2 {
            continue;
        }

        cos_parallaxes.push(cos_parallax);
        out.points[i] = Some(p3d_c1);
        out.n_good += 1;
        if cos_parallax < MAX_COS_PARALLAX {
            out.triangulated[i] = true;
        }
    }

    if !cos_parallaxes.is_empty() {
        cos_parallaxes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = 50.min(cos_parallaxes.len() - 1);
        out.parallax_deg = cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees();
    }
    out
}

/// Relative motion and structure recovered from two views.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// Rotation from the first to the second camera.
    pub r21: Matrix3<f64>,
    /// Translation from the first to the second camera (unit norm).
    pub t21: Vector3<f64>,
    /// Triangulated points in the first camera frame, per correspondence.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Correspondences with enough parallax to seed the map.
    pub triangulated: Vec<bool>,
    pub parallax_deg: f64,
}

/// Pick the unique `(R, t)` of `E = Kᵀ F K` that places most points in front
/// of both cameras.
#[allow(clippy::too_many_arguments)]
pub fn reconstruct_from_fundamental(
    f21: &Matrix3<f64>,
    k: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    inliers: &[bool],
    sigma: f64,
    min_parallax_deg: f64,
    min_triangulated: usize,
) -> Option<TwoViewReconstruction> {
    let n_inliers = inliers.iter().filter(|&&b| b).count();
    let e21 = k.transpose() * f21 * k;

    let (u, _, v) = sorted_svd3(&e21)?;
    let t = u.column(2).normalize();
    let w = Matrix3::new(
        0.0, -1.0, 0.0,
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
    );
    let mut r1 = u * w * v.transpose();
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v.transpose();
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }

    let th2 = 4.0 * sigma * sigma;
    let hypotheses = [(r1, t), (r2, t), (r1, -t), (r2, -t)];
    let checks: Vec<RtCheck> = hypotheses
        .iter()
        .map(|(r, t)| check_rt(r, t, p1, p2, inliers, k, th2))
        .collect();

    let max_good = checks.iter().map(|c| c.n_good).max().unwrap_or(0);
    let min_good = ((0.9 * n_inliers as f64) as usize).max(min_triangulated);
    let n_similar = checks
        .iter()
        .filter(|c| c.n_good as f64 > 0.7 * max_good as f64)
        .count();

    if max_good < min_good || n_similar > 1 {
        return None;
    }

    let best = checks.iter().position(|c| c.n_good == max_good)?;
    let check = &checks[best];
    if check.parallax_deg <= min_parallax_deg {
        return None;
    }
    let (r, t) = hypotheses[best];
    Some(TwoViewReconstruction {
        r21: r,
        t21: t,
        points: check.points.clone(),
        triangulated: check.triangulated.clone(),
        parallax_deg: check.parallax_deg,
    })
}

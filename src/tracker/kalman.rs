// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! 8-dimensional constant-velocity Kalman filter over `(x, y, a, h, vx, vy,
//! va, vh)`, where `(x, y, a, h)` is the `xyah` bounding-box parameterization.
//! Matrix operations are hand-rolled fixed-size arrays rather than a general
//! linear-algebra crate, mirroring the small, fixed-dimension math in the
//! original tracker's `kalmanfilter.cpp`.

const NDIM: usize = 4;
const DIM: usize = 8;

const STD_WEIGHT_POSITION: f64 = 1.0 / 20.0;
const STD_WEIGHT_VELOCITY: f64 = 1.0 / 160.0;

pub type Vec8 = [f64; DIM];
pub type Mat8 = [[f64; DIM]; DIM];
pub type Vec4 = [f64; NDIM];
pub type Mat4 = [[f64; NDIM]; NDIM];

fn mat8_mul(a: &Mat8, b: &Mat8) -> Mat8 {
    let mut out = [[0.0; DIM]; DIM];
    for i in 0..DIM {
        for j in 0..DIM {
            let mut sum = 0.0;
            for k in 0..DIM {
                sum += a[i][k] * b[k][j];
            }
            out[i][j] = sum;
        }
    }
    out
}

fn mat8_transpose(a: &Mat8) -> Mat8 {
    let mut out = [[0.0; DIM]; DIM];
    for i in 0..DIM {
        for j in 0..DIM {
            out[j][i] = a[i][j];
        }
    }
    out
}

fn vec8_mat8_mul(v: &Vec8, m: &Mat8) -> Vec8 {
    let mut out = [0.0; DIM];
    for j in 0..DIM {
        let mut sum = 0.0;
        for i in 0..DIM {
            sum += v[i] * m[i][j];
        }
        out[j] = sum;
    }
    out
}

fn motion_matrix() -> Mat8 {
    let mut f = [[0.0; DIM]; DIM];
    for i in 0..DIM {
        f[i][i] = 1.0;
    }
    for i in 0..NDIM {
        f[i][i + NDIM] = 1.0;
    }
    f
}

/// Measurement matrix H: picks out the first four (position) dimensions.
fn update_matrix() -> [[f64; DIM]; NDIM] {
    let mut h = [[0.0; DIM]; NDIM];
    for i in 0..NDIM {
        h[i][i] = 1.0;
    }
    h
}

fn process_noise(h: f64) -> Vec8 {
    [
        STD_WEIGHT_POSITION * h,
        STD_WEIGHT_POSITION * h,
        1e-2,
        STD_WEIGHT_POSITION * h,
        STD_WEIGHT_VELOCITY * h,
        STD_WEIGHT_VELOCITY * h,
        1e-5,
        STD_WEIGHT_VELOCITY * h,
    ]
}

fn measurement_noise(h: f64) -> Vec4 {
    [
        STD_WEIGHT_POSITION * h,
        STD_WEIGHT_POSITION * h,
        1e-1,
        STD_WEIGHT_POSITION * h,
    ]
}

/// Per-track Kalman filter state, owned by the track and destroyed with it.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    pub mean: Vec8,
    pub covariance: Mat8,
    cached_projection: Option<(Vec4, Mat4)>,
}

impl KalmanFilter {
    /// Initiates a new track from a single `xyah` measurement.
    pub fn initiate(measurement: Vec4) -> Self {
        let mut mean = [0.0; DIM];
        mean[..NDIM].copy_from_slice(&measurement);

        let h = measurement[3];
        let std = [
            2.0 * STD_WEIGHT_POSITION * h,
            2.0 * STD_WEIGHT_POSITION * h,
            1e-2,
            2.0 * STD_WEIGHT_POSITION * h,
            10.0 * STD_WEIGHT_VELOCITY * h,
            10.0 * STD_WEIGHT_VELOCITY * h,
            1e-5,
            10.0 * STD_WEIGHT_VELOCITY * h,
        ];

        let mut covariance = [[0.0; DIM]; DIM];
        for i in 0..DIM {
            covariance[i][i] = std[i] * std[i];
        }

        KalmanFilter {
            mean,
            covariance,
            cached_projection: None,
        }
    }

    /// `mean <- mean . F^T`, `covariance <- F . covariance . F^T + Q(h)`.
    pub fn predict(&mut self) {
        let h = self.mean[3].max(1e-6);

        let f = motion_matrix();
        self.mean = vec8_mat8_mul(&self.mean, &f);

        let ft = mat8_transpose(&f);
        let cov = mat8_mul(&mat8_mul(&f, &self.covariance), &ft);

        let q = process_noise(h);
        let mut next = cov;
        for i in 0..DIM {
            next[i][i] += q[i] * q[i];
        }
        self.covariance = next;
        self.cached_projection = None;
    }

    /// `mean <- mean . H^T`, `S <- H . covariance . H^T + R(h)`. Cached so
    /// repeated calls within one `Update` don't recompute.
    pub fn project(&mut self) -> (Vec4, Mat4) {
        if let Some(cached) = self.cached_projection {
            return cached;
        }

        let h_mat = update_matrix();
        let mut mean = [0.0; NDIM];
        for i in 0..NDIM {
            mean[i] = self.mean[i];
        }

        // S = H . cov . H^T; since H just selects the first NDIM rows/cols,
        // this is the top-left NDIM x NDIM block of `covariance`.
        let mut s = [[0.0; NDIM]; NDIM];
        for i in 0..NDIM {
            for j in 0..NDIM {
                s[i][j] = self.covariance[i][j];
            }
        }

        let r = measurement_noise(self.mean[3].max(1e-6));
        for i in 0..NDIM {
            s[i][i] += r[i] * r[i];
        }
        let _ = h_mat;

        self.cached_projection = Some((mean, s));
        (mean, s)
    }

    /// `K = cov . H^T . S^-1`; `mean += (z - H.mean).K^T`; `cov -= K.H.cov`.
    pub fn update(&mut self, measurement: Vec4) {
        let (projected_mean, s) = self.project();
        let s_inv = invert4(&s);

        // K is DIM x NDIM: cov's left NDIM columns times S^-1.
        let mut k = [[0.0; NDIM]; DIM];
        for i in 0..DIM {
            for j in 0..NDIM {
                let mut sum = 0.0;
                for l in 0..NDIM {
                    sum += self.covariance[i][l] * s_inv[l][j];
                }
                k[i][j] = sum;
            }
        }

        let mut innovation = [0.0; NDIM];
        for i in 0..NDIM {
            innovation[i] = measurement[i] - projected_mean[i];
        }

        let mut new_mean = self.mean;
        for i in 0..DIM {
            let mut delta = 0.0;
            for j in 0..NDIM {
                delta += innovation[j] * k[i][j];
            }
            new_mean[i] += delta;
        }
        self.mean = new_mean;

        // cov -= K . H . cov; H selects rows 0..NDIM of cov.
        let mut new_cov = self.covariance;
        for i in 0..DIM {
            for j in 0..DIM {
                let mut delta = 0.0;
                for l in 0..NDIM {
                    delta += k[i][l] * self.covariance[l][j];
                }
                new_cov[i][j] -= delta;
            }
        }
        self.covariance = new_cov;
        self.cached_projection = None;
    }

    /// Squared Mahalanobis distance `d.S^-1.d^T` for each of `measurements`,
    /// against this track's current projected state.
    pub fn gating_distance(&mut self, measurements: &[Vec4]) -> Vec<f64> {
        let (mean, s) = self.project();
        let s_inv = invert4(&s);

        measurements
            .iter()
            .map(|m| {
                let mut d = [0.0; NDIM];
                for i in 0..NDIM {
                    d[i] = m[i] - mean[i];
                }
                let mut acc = 0.0;
                for i in 0..NDIM {
                    let mut row_sum = 0.0;
                    for j in 0..NDIM {
                        row_sum += d[j] * s_inv[j][i];
                    }
                    acc += row_sum * d[i];
                }
                acc
            })
            .collect()
    }

    /// Current `xyah` estimate.
    pub fn xyah(&self) -> Vec4 {
        [self.mean[0], self.mean[1], self.mean[2], self.mean[3]]
    }
}

/// 4x4 matrix inverse via Gauss-Jordan elimination with partial pivoting;
/// `S` is always symmetric positive-definite here so this never degenerates.
fn invert4(m: &Mat4) -> Mat4 {
    let mut a = *m;
    let mut inv = [[0.0; NDIM]; NDIM];
    for i in 0..NDIM {
        inv[i][i] = 1.0;
    }

    for col in 0..NDIM {
        let mut pivot_row = col;
        let mut pivot_val = a[col][col].abs();
        for row in (col + 1)..NDIM {
            if a[row][col].abs() > pivot_val {
                pivot_val = a[row][col].abs();
                pivot_row = row;
            }
        }
        if pivot_row != col {
            a.swap(pivot_row, col);
            inv.swap(pivot_row, col);
        }

        let pivot = a[col][col];
        let pivot = if pivot.abs() < 1e-12 { 1e-12 } else { pivot };
        for j in 0..NDIM {
            a[col][j] /= pivot;
            inv[col][j] /= pivot;
        }

        for row in 0..NDIM {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            for j in 0..NDIM {
                a[row][j] -= factor * a[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn initiate_sets_position_and_zero_velocity() {
        let kf = KalmanFilter::initiate([30.0, 60.0, 0.5, 80.0]);
        assert_eq!(kf.mean[0], 30.0);
        assert_eq!(kf.mean[1], 60.0);
        assert_eq!(kf.mean[2], 0.5);
        assert_eq!(kf.mean[3], 80.0);
        assert_eq!(&kf.mean[4..], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn predict_then_project_recovers_initial_position_when_static() {
        let mut kf = KalmanFilter::initiate([30.0, 60.0, 0.5, 80.0]);
        kf.predict();
        let (mean, _) = kf.project();
        // no velocity yet, so position is unchanged by the first predict.
        assert!((mean[0] - 30.0).abs() < 1e-9);
        assert!((mean[3] - 80.0).abs() < 1e-9);
    }

    #[test]
    fn update_pulls_mean_toward_measurement() {
        let mut kf = KalmanFilter::initiate([10.0, 20.0, 0.5, 80.0]);
        kf.predict();
        kf.update([12.0, 20.0, 0.5, 80.0]);
        assert!(kf.mean[0] > 10.0 && kf.mean[0] <= 12.0);
    }

    #[test]
    fn gating_distance_is_zero_at_projected_mean() {
        let mut kf = KalmanFilter::initiate([10.0, 20.0, 0.5, 80.0]);
        kf.predict();
        let mean = kf.xyah();
        let d = kf.gating_distance(&[mean]);
        assert!(d[0] < 1e-6);
    }
}

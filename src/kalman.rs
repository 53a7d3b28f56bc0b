//! Constant-velocity Kalman filter over `[cx, cy, w, h]`, the motion model
//! spec §4.1 calls for. State vector is `[cx, cy, w, h, vcx, vcy, vw, vh]`,
//! the same "position + velocity" convention the `tracking` crate in the
//! reference corpus uses for its 2D motion model, implemented directly
//! against `nalgebra`'s stable `SMatrix`/`SVector` API rather than that
//! crate's `adskalman` trait plumbing.

use nalgebra::{SMatrix, SVector};

const N: usize = 8;
type StateVec = SVector<f32, N>;
type StateMat = SMatrix<f32, N, N>;

pub struct KalmanBoxTracker {
    x: StateVec,
    p: StateMat,
    /// Process noise scale; larger means the filter trusts new
    /// measurements more than its own prediction.
    q_scale: f32,
    /// Measurement noise scale.
    r_scale: f32,
}

fn transition_matrix(dt: f32) -> StateMat {
    let mut f = StateMat::identity();
    for i in 0..4 {
        f[(i, i + 4)] = dt;
    }
    f
}

impl KalmanBoxTracker {
    pub fn new(bbox: [i32; 4]) -> Self {
        let (cx, cy, w, h) = center_wh(bbox);
        let mut x = StateVec::zeros();
        x[0] = cx;
        x[1] = cy;
        x[2] = w;
        x[3] = h;

        let mut p = StateMat::identity() * 10.0;
        // Velocity components start with much higher uncertainty — we have
        // no velocity observation yet.
        for i in 4..8 {
            p[(i, i)] = 1000.0;
        }

        Self { x, p, q_scale: 1.0, r_scale: 1.0 }
    }

    /// Advance the filter by `dt` (in frames; `dt=1.0` for one tick) and
    /// return the predicted box.
    pub fn predict(&mut self, dt: f32) -> [i32; 4] {
        let f = transition_matrix(dt);
        self.x = f * self.x;
        let q = StateMat::identity() * self.q_scale;
        self.p = f * self.p * f.transpose() + q;
        self.bbox()
    }

    /// Incorporate a new measured box.
    pub fn update(&mut self, bbox: [i32; 4]) {
        let (cx, cy, w, h) = center_wh(bbox);
        let z = nalgebra::SVector::<f32, 4>::new(cx, cy, w, h);

        // H maps the 8-dim state onto the 4 observed dims.
        let mut h_mat = nalgebra::SMatrix::<f32, 4, N>::zeros();
        for i in 0..4 {
            h_mat[(i, i)] = 1.0;
        }

        let r = nalgebra::SMatrix::<f32, 4, 4>::identity() * self.r_scale;
        let y = z - h_mat * self.x;
        let s = h_mat * self.p * h_mat.transpose() + r;
        let s_inv = s.try_inverse().unwrap_or_else(nalgebra::SMatrix::<f32, 4, 4>::identity);
        let k = self.p * h_mat.transpose() * s_inv;

        self.x += k * y;
        self.p = (StateMat::identity() - k * h_mat) * self.p;
    }

    pub fn bbox(&self) -> [i32; 4] {
        wh_to_bbox(self.x[0], self.x[1], self.x[2].max(1.0), self.x[3].max(1.0))
    }
}

fn center_wh(bbox: [i32; 4]) -> (f32, f32, f32, f32) {
    let [x0, y0, x1, y1] = bbox;
    let w = (x1 - x0) as f32;
    let h = (y1 - y0) as f32;
    (x0 as f32 + w / 2.0, y0 as f32 + h / 2.0, w, h)
}

fn wh_to_bbox(cx: f32, cy: f32, w: f32, h: f32) -> [i32; 4] {
    [
        (cx - w / 2.0) as i32,
        (cy - h / 2.0) as i32,
        (cx + w / 2.0) as i32,
        (cy + h / 2.0) as i32,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predict_then_update_tracks_linear_motion() {
        let mut kf = KalmanBoxTracker::new([100, 100, 140, 180]);
        // Feed a few measurements of an object moving +10px/frame in x.
        for step in 1..6 {
            let predicted = kf.predict(1.0);
            let measured = [100 + step * 10, 100, 140 + step * 10, 180];
            kf.update(measured);
            let _ = predicted;
        }
        let bbox = kf.bbox();
        // After consistent motion the filter should track near the true position.
        assert!((bbox[0] - 150).abs() < 20, "bbox={bbox:?}");
    }
}

//! Representative map points for a pack
//!
//! Clients show a handful of markers per pack before it is downloaded.
//! The markers come from greedy k-center selection over hotspot
//! coordinates: each new center is the point farthest from all centers so
//! far, which spreads markers across the region instead of piling them into
//! its densest city.

pub const EARTH_RADIUS_KM: f64 = 6371.0;
pub const MIN_CLUSTERS: usize = 3;
pub const MAX_CLUSTERS: usize = 30;
const CLUSTER_SCALE: f64 = 1.5;

/// A (latitude, longitude) pair in degrees
pub type Point = (f64, f64);

/// Great-circle distance, taking the short way across the date line
pub fn haversine_km(a: Point, b: Point) -> f64 {
    let d_lat = (b.0 - a.0).to_radians();

    let mut d_lng = b.1 - a.1;
    if d_lng > 180.0 {
        d_lng -= 360.0;
    } else if d_lng < -180.0 {
        d_lng += 360.0;
    }
    let d_lng = d_lng.to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.0.to_radians().cos() * b.0.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// `ceil(1.5 * log2(n))`, clamped to [`MIN_CLUSTERS`]..=[`MAX_CLUSTERS`]
pub fn desired_clusters(n: usize) -> usize {
    if n == 0 {
        return MIN_CLUSTERS;
    }
    let k = (CLUSTER_SCALE * (n as f64).log2()).ceil() as usize;
    k.clamp(MIN_CLUSTERS, MAX_CLUSTERS)
}

/// Indices of `k` centers chosen greedily, starting from `points[0]`
///
/// Ties go to the lowest index, so the selection is deterministic for a
/// given point order.
pub fn k_center(points: &[Point], k: usize) -> Vec<usize> {
    if points.is_empty() || k == 0 {
        return Vec::new();
    }
    if k >= points.len() {
        return (0..points.len()).collect();
    }

    let mut centers = vec![0];
    let mut nearest: Vec<f64> = points.iter().map(|&p| haversine_km(points[0], p)).collect();
    nearest[0] = 0.0;
    let mut is_center = vec![false; points.len()];
    is_center[0] = true;

    while centers.len() < k {
        let mut next = None;
        let mut farthest = -1.0;
        for (idx, &distance) in nearest.iter().enumerate() {
            if !is_center[idx] && distance > farthest {
                farthest = distance;
                next = Some(idx);
            }
        }
        let Some(next) = next else { break };

        centers.push(next);
        is_center[next] = true;
        nearest[next] = 0.0;
        for (idx, &p) in points.iter().enumerate() {
            if !is_center[idx] {
                nearest[idx] = nearest[idx].min(haversine_km(points[next], p));
            }
        }
    }

    centers
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Cluster centers for a pack's hotspots, rounded to 3 decimals
pub fn cluster_centers(points: &[Point]) -> Vec<[f64; 2]> {
    k_center(points, desired_clusters(points.len()))
        .into_iter()
        .map(|idx| {
            let (lat, lng) = points[idx];
            [round3(lat), round3(lng)]
        })
        .collect()
}

//! Cross-camera Re-Identification (spec §4.2). Consolidates a per-camera
//! track id into a global `(cam, tube_id)` pair when a tube entering one
//! camera is the continuation of a tube that recently left a topologically
//! adjacent camera.

use std::collections::{HashMap, VecDeque};

use crate::config::ReidConfig;
use crate::model::BBox;
use crate::tracker::cosine_distance;

pub type TubeKey = (String, u64);

/// Axis-aligned entry/exit zone in ratio coordinates [0,1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Zone {
    fn overlaps_box(&self, bbox: BBox, frame_w: f32, frame_h: f32) -> bool {
        let [x0, y0, x1, y1] = bbox;
        let (bx0, by0, bx1, by1) = (x0 as f32 / frame_w, y0 as f32 / frame_h, x1 as f32 / frame_w, y1 as f32 / frame_h);
        let ox0 = self.x0.max(bx0);
        let oy0 = self.y0.max(by0);
        let ox1 = self.x1.min(bx1);
        let oy1 = self.y1.min(by1);
        ox1 > ox0 && oy1 > oy0
    }
}

/// One directed edge: `cam` has an entry zone reachable from `from_cam`.
#[derive(Debug, Clone)]
struct TopologyEdge {
    cam: String,
    from_cam: String,
    zone: Zone,
}

/// Camera adjacency graph loaded from the topology file (spec §4.2 format):
/// `cam_a, x0,y0,x1,y1 : cam_b, x0,y0,x1,y1` — symmetric, both directions
/// stored on load.
#[derive(Debug, Clone, Default)]
pub struct CameraTopology {
    edges: Vec<TopologyEdge>,
}

impl CameraTopology {
    pub fn empty() -> Self {
        Self { edges: Vec::new() }
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut edges = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (left, right) = line
                .split_once(':')
                .ok_or_else(|| format!("topology line {}: missing ':' separator", lineno + 1))?;
            let (cam_a, zone_a) = parse_side(left).map_err(|e| format!("topology line {}: {e}", lineno + 1))?;
            let (cam_b, zone_b) = parse_side(right).map_err(|e| format!("topology line {}: {e}", lineno + 1))?;

            edges.push(TopologyEdge { cam: cam_a.clone(), from_cam: cam_b.clone(), zone: zone_a });
            edges.push(TopologyEdge { cam: cam_b, from_cam: cam_a, zone: zone_b });
        }
        Ok(Self { edges })
    }

    pub fn load_file(path: &str) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("reading topology file {path}: {e}"))?;
        Self::parse(&text)
    }

    fn is_connected(&self, cam: &str, from_cam: &str) -> bool {
        self.edges.iter().any(|e| e.cam == cam && e.from_cam == from_cam)
    }

    fn entry_zone(&self, cam: &str, from_cam: &str) -> Option<Zone> {
        self.edges.iter().find(|e| e.cam == cam && e.from_cam == from_cam).map(|e| e.zone)
    }
}

fn parse_side(s: &str) -> Result<(String, Zone), String> {
    let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
    if parts.len() != 5 {
        return Err(format!("expected 'cam, x0, y0, x1, y1', got '{s}'"));
    }
    let cam = parts[0].to_string();
    if cam.is_empty() || !cam.chars().next().unwrap().is_alphabetic() {
        return Err(format!("camera id '{cam}' must start with a letter"));
    }
    let mut coords = [0f32; 4];
    for (i, p) in parts[1..].iter().enumerate() {
        coords[i] = p.parse::<f32>().map_err(|_| format!("invalid coordinate '{p}'"))?;
    }
    Ok((cam, Zone { x0: coords[0], y0: coords[1], x1: coords[2], y1: coords[3] }))
}

struct TubeState {
    key: TubeKey,
    features: Vec<Vec<f32>>,
    consolidated_feature: Option<Vec<f32>>,
    first_box: BBox,
    last_box: BBox,
    last_frame_id: u64,
    frame_w: f32,
    frame_h: f32,
}

/// Per-(cam,tube) running state plus the confirmed cross-camera id mapping.
pub struct ReidEngine {
    cfg: ReidConfig,
    topology: CameraTopology,
    tubes: HashMap<TubeKey, TubeState>,
    insertion_order: VecDeque<TubeKey>,
    id_mapping: HashMap<TubeKey, TubeKey>,
}

impl ReidEngine {
    pub fn new(cfg: ReidConfig, topology: CameraTopology) -> Self {
        Self {
            cfg,
            topology,
            tubes: HashMap::new(),
            insertion_order: VecDeque::new(),
            id_mapping: HashMap::new(),
        }
    }

    /// Canonicalize `(cam, tube_id)` through the (possibly chained)
    /// `id_mapping`. Testable property #4: chained mappings resolve
    /// transitively to the final canonical pair.
    pub fn canonicalize(&self, key: &TubeKey) -> TubeKey {
        let mut cur = key.clone();
        let mut seen = std::collections::HashSet::new();
        while let Some(next) = self.id_mapping.get(&cur) {
            if !seen.insert(cur.clone()) {
                break; // defensive cycle guard; topology/id_mapping never cycles by construction
            }
            cur = next.clone();
        }
        cur
    }

    /// Feed one person detection with a feature vector for `(cam, tube_id)`
    /// at `frame_id`/`bbox`, observed in a frame of size `frame_w x frame_h`.
    /// Returns the canonical key this tube currently resolves to.
    pub fn observe(
        &mut self,
        cam: &str,
        tube_id: u64,
        frame_id: u64,
        bbox: BBox,
        feature: &[f32],
        frame_w: f32,
        frame_h: f32,
    ) -> TubeKey {
        let key: TubeKey = (cam.to_string(), tube_id);

        if let Some(canonical) = self.id_mapping.get(&key).cloned() {
            return canonical;
        }

        let is_new = !self.tubes.contains_key(&key);
        let state = self.tubes.entry(key.clone()).or_insert_with(|| TubeState {
            key: key.clone(),
            features: Vec::new(),
            consolidated_feature: None,
            first_box: bbox,
            last_box: bbox,
            last_frame_id: frame_id,
            frame_w,
            frame_h,
        });
        if is_new {
            self.insertion_order.push_back(key.clone());
        }

        state.last_box = bbox;
        state.last_frame_id = frame_id;

        if state.features.len() < self.cfg.min_tube_duration as usize {
            state.features.push(feature.to_vec());
        }
        if state.features.len() == self.cfg.min_tube_duration as usize && state.consolidated_feature.is_none() {
            state.consolidated_feature = Some(mean_feature(&state.features));
        }

        self.evict_oldest_if_over_capacity();

        if self.tubes[&key].consolidated_feature.is_some() {
            if let Some(winner) = self.find_match(&key) {
                self.id_mapping.insert(key.clone(), winner.clone());
                return winner;
            }
        }

        key
    }

    fn find_match(&self, key: &TubeKey) -> Option<TubeKey> {
        let me = self.tubes.get(key)?;
        let my_feature = me.consolidated_feature.as_ref()?;

        let mut best: Option<(TubeKey, f32, u64)> = None; // (key, dist, time_gap)
        for (other_key, other) in self.tubes.iter() {
            if other_key.0 == key.0 {
                continue; // must be a different camera
            }
            if !self.topology.is_connected(&key.0, &other_key.0) {
                continue;
            }
            let Some(other_feature) = &other.consolidated_feature else { continue };

            let Some(entry_here) = self.topology.entry_zone(&key.0, &other_key.0) else { continue };
            let Some(exit_there) = self.topology.entry_zone(&other_key.0, &key.0) else { continue };

            if !entry_here.overlaps_box(me.first_box, me.frame_w, me.frame_h) {
                continue;
            }
            if !exit_there.overlaps_box(other.last_box, other.frame_w, other.frame_h) {
                continue;
            }

            if me.last_frame_id < other.last_frame_id {
                continue;
            }
            let gap = me.last_frame_id - other.last_frame_id;
            if gap < self.cfg.end_frame_num_thres {
                continue;
            }

            let dist = cosine_distance(my_feature, other_feature);
            if dist >= self.cfg.feature_matching_thres {
                continue;
            }

            // Ground truth quantizes with `int(dist * 10.)` — truncation
            // toward zero, not round-half-away-from-zero.
            let quantized = (dist * 10.0).trunc();
            let better = match &best {
                None => true,
                Some((_, best_dist, best_gap)) => {
                    let best_quantized = (best_dist * 10.0).trunc();
                    quantized < best_quantized || (quantized == best_quantized && gap < *best_gap)
                }
            };
            if better {
                best = Some((other_key.clone(), dist, gap));
            }
        }
        best.map(|(k, _, _)| k)
    }

    fn evict_oldest_if_over_capacity(&mut self) {
        // Evict per-camera, since the cap is per spec §4.2 "a camera's tube table".
        let mut per_cam: HashMap<String, usize> = HashMap::new();
        for key in &self.insertion_order {
            *per_cam.entry(key.0.clone()).or_default() += 1;
        }
        for (cam, count) in per_cam {
            let mut over = count.saturating_sub(self.cfg.max_tube_info_size);
            while over > 0 {
                if let Some(pos) = self.insertion_order.iter().position(|k| k.0 == cam) {
                    let evicted = self.insertion_order.remove(pos).unwrap();
                    self.tubes.remove(&evicted);
                    over -= 1;
                } else {
                    break;
                }
            }
        }
    }

    pub fn tube_count(&self, cam: &str) -> usize {
        self.insertion_order.iter().filter(|k| k.0 == cam).count()
    }
}

fn mean_feature(features: &[Vec<f32>]) -> Vec<f32> {
    let dim = features[0].len();
    let mut sum = vec![0f32; dim];
    for f in features {
        for (s, v) in sum.iter_mut().zip(f) {
            *s += v;
        }
    }
    for s in sum.iter_mut() {
        *s /= features.len() as f32;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology_ab() -> CameraTopology {
        CameraTopology::parse("camA, 0.8, 0.0, 1.0, 1.0 : camB, 0.0, 0.0, 0.2, 1.0").unwrap()
    }

    /// Scenario S4 (spec §8): cam A tube 7 exits at frame 100, cam B tube 3
    /// enters at frame 108 with cosine distance 0.3 between consolidated
    /// features (< 0.4 threshold); topology connects A<->B.
    #[test]
    fn scenario_s4_reid_match() {
        let mut cfg = ReidConfig::default();
        cfg.min_tube_duration = 2;
        let mut engine = ReidEngine::new(cfg, topology_ab());

        let feat_a = vec![1.0, 0.0];
        // cam A tube 7 observed near its exit zone (x in [0.8,1.0]) twice, last at frame 100.
        engine.observe("camA", 7, 99, [850, 100, 900, 200], &feat_a, 1000.0, 1000.0);
        let canon = engine.observe("camA", 7, 100, [860, 100, 910, 200], &feat_a, 1000.0, 1000.0);
        assert_eq!(canon, ("camA".to_string(), 7));

        // cam B tube 3: similar feature (cosine distance ~0), inside B's entry
        // zone (x in [0,0.2]), observed at frame 108 (gap=8 >= 5).
        let feat_b = vec![0.95, 0.05_f32.sqrt()];
        engine.observe("camB", 3, 107, [20, 100, 60, 200], &feat_b, 1000.0, 1000.0);
        let canon = engine.observe("camB", 3, 108, [25, 100, 65, 200], &feat_b, 1000.0, 1000.0);

        assert_eq!(canon, ("camA".to_string(), 7));
        assert_eq!(engine.canonicalize(&("camB".to_string(), 3)), ("camA".to_string(), 7));
    }

    /// Ground truth quantizes the tie-break distance with `int(dist * 10.)`
    /// (truncation), not rounding. Two exited cam A tubes compete for one
    /// incoming cam B tube: X at cosine distance 0.26 (quantized bucket 2)
    /// but a larger time gap, Y at distance 0.31 (bucket 3) but a smaller
    /// gap. Truncation keeps the buckets distinct so X's strictly smaller
    /// distance wins outright; rounding would have collapsed both into
    /// bucket 3 and let Y win the gap tie-break despite being the worse
    /// feature match.
    #[test]
    fn tie_break_truncates_rather_than_rounds_quantized_distance() {
        let mut cfg = ReidConfig::default();
        cfg.min_tube_duration = 2;
        let mut engine = ReidEngine::new(cfg, topology_ab());

        let feat_x = vec![0.74_f32, (1.0 - 0.74_f32 * 0.74).sqrt()];
        engine.observe("camA", 10, 69, [850, 100, 900, 200], &feat_x, 1000.0, 1000.0);
        engine.observe("camA", 10, 70, [860, 100, 910, 200], &feat_x, 1000.0, 1000.0);

        let feat_y = vec![0.69_f32, (1.0 - 0.69_f32 * 0.69).sqrt()];
        engine.observe("camA", 20, 91, [850, 100, 900, 200], &feat_y, 1000.0, 1000.0);
        engine.observe("camA", 20, 92, [860, 100, 910, 200], &feat_y, 1000.0, 1000.0);

        let feat_b = vec![1.0_f32, 0.0];
        engine.observe("camB", 3, 99, [20, 100, 60, 200], &feat_b, 1000.0, 1000.0);
        let canon = engine.observe("camB", 3, 100, [25, 100, 65, 200], &feat_b, 1000.0, 1000.0);

        assert_eq!(canon, ("camA".to_string(), 10));
    }

    /// Testable property #4: chained mappings canonicalize transitively.
    #[test]
    fn reid_consistent_under_chaining() {
        let mut engine = ReidEngine::new(ReidConfig::default(), CameraTopology::empty());
        engine
            .id_mapping
            .insert(("B".to_string(), 1), ("A".to_string(), 1));
        engine
            .id_mapping
            .insert(("C".to_string(), 1), ("B".to_string(), 1));
        assert_eq!(engine.canonicalize(&("C".to_string(), 1)), ("A".to_string(), 1));
    }

    #[test]
    fn missing_topology_degrades_to_no_matches() {
        let mut cfg = ReidConfig::default();
        cfg.min_tube_duration = 1;
        let mut engine = ReidEngine::new(cfg, CameraTopology::empty());
        let feat = vec![1.0, 0.0];
        let canon = engine.observe("camA", 1, 0, [0, 0, 10, 10], &feat, 100.0, 100.0);
        assert_eq!(canon, ("camA".to_string(), 1));
    }

    #[test]
    fn tube_table_capped_at_max_size() {
        let mut cfg = ReidConfig::default();
        cfg.max_tube_info_size = 3;
        cfg.min_tube_duration = 100; // never consolidate, isolate eviction behavior
        let mut engine = ReidEngine::new(cfg, CameraTopology::empty());
        for i in 0..10u64 {
            engine.observe("camA", i, i, [0, 0, 10, 10], &[1.0], 100.0, 100.0);
        }
        assert!(engine.tube_count("camA") <= 3);
    }
}

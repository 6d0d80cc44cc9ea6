//! Landmark database.
//!
//! Landmarks are parameterised in their host camera frame by a stereographic
//! bearing and an inverse depth. Observations are indexed host-first so that
//! evicting a host keyframe cleanly identifies every observation that has to
//! be dropped or relinearised.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Result};
use nalgebra::Vector2;

use super::TimeCamId;

/// Landmark state: host frame, bearing on the chart, inverse depth.
#[derive(Debug, Clone)]
pub struct KeypointPosition {
    pub host: TimeCamId,
    pub dir: Vector2<f64>,
    pub inv_depth: f64,
}

/// A 2D observation of a landmark from some target frame.
#[derive(Debug, Clone)]
pub struct KeypointObservation {
    pub kpt_id: u32,
    pub pos: Vector2<f64>,
}

/// In-memory landmark store with a host → target observation index.
#[derive(Debug, Default)]
pub struct LandmarkDatabase {
    landmarks: BTreeMap<u32, KeypointPosition>,
    observations: BTreeMap<TimeCamId, BTreeMap<TimeCamId, Vec<KeypointObservation>>>,
    landmarks_backup: HashMap<u32, (Vector2<f64>, f64)>,
}

impl LandmarkDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new landmark. The caller guarantees the id is fresh.
    pub fn add_landmark(&mut self, kpt_id: u32, pos: KeypointPosition) {
        self.landmarks.insert(kpt_id, pos);
    }

    pub fn landmark_exists(&self, kpt_id: u32) -> bool {
        self.landmarks.contains_key(&kpt_id)
    }

    pub fn get_landmark(&self, kpt_id: u32) -> Option<&KeypointPosition> {
        self.landmarks.get(&kpt_id)
    }

    pub fn get_landmark_mut(&mut self, kpt_id: u32) -> Option<&mut KeypointPosition> {
        self.landmarks.get_mut(&kpt_id)
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn landmarks(&self) -> &BTreeMap<u32, KeypointPosition> {
        &self.landmarks
    }

    /// Observation groups in host-then-target order.
    pub fn observations(
        &self,
    ) -> &BTreeMap<TimeCamId, BTreeMap<TimeCamId, Vec<KeypointObservation>>> {
        &self.observations
    }

    /// Record an observation of an existing landmark from `target`. The host
    /// is resolved through the landmark.
    pub fn add_observation(&mut self, target: TimeCamId, obs: KeypointObservation) -> Result<()> {
        let Some(lm) = self.landmarks.get(&obs.kpt_id) else {
            bail!("observation of unknown landmark {}", obs.kpt_id);
        };
        self.observations
            .entry(lm.host)
            .or_default()
            .entry(target)
            .or_default()
            .push(obs);
        Ok(())
    }

    /// Number of observations per landmark.
    pub fn observation_counts(&self) -> HashMap<u32, usize> {
        let mut counts = HashMap::new();
        for per_target in self.observations.values() {
            for obs_list in per_target.values() {
                for obs in obs_list {
                    *counts.entry(obs.kpt_id).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Remove a landmark and every observation of it.
    pub fn remove_landmark(&mut self, kpt_id: u32) {
        let Some(lm) = self.landmarks.remove(&kpt_id) else {
            return;
        };
        if let Some(per_target) = self.observations.get_mut(&lm.host) {
            per_target.retain(|_, obs_list| {
                obs_list.retain(|o| o.kpt_id != kpt_id);
                !obs_list.is_empty()
            });
            if per_target.is_empty() {
                self.observations.remove(&lm.host);
            }
        }
    }

    /// Remove this landmark's observations from the given target frames.
    pub fn remove_landmark_observations(&mut self, kpt_id: u32, targets: &BTreeSet<TimeCamId>) {
        let Some(lm) = self.landmarks.get(&kpt_id) else {
            return;
        };
        if let Some(per_target) = self.observations.get_mut(&lm.host) {
            for target in targets {
                if let Some(obs_list) = per_target.get_mut(target) {
                    obs_list.retain(|o| o.kpt_id != kpt_id);
                    if obs_list.is_empty() {
                        per_target.remove(target);
                    }
                }
            }
        }
    }

    /// Drop everything tied to evicted frames: landmarks hosted in
    /// `kfs_to_marg` together with all their observations, and observations
    /// from surviving hosts whose target is being removed. Landmarks left
    /// without observations are dropped.
    pub fn remove_keyframes(
        &mut self,
        kfs_to_marg: &BTreeSet<i64>,
        poses_to_marg: &BTreeSet<i64>,
        states_to_marg_all: &BTreeSet<i64>,
    ) {
        // Hosts being evicted take all their landmarks with them.
        self.observations
            .retain(|host, _| !kfs_to_marg.contains(&host.frame_id));
        self.landmarks
            .retain(|_, lm| !kfs_to_marg.contains(&lm.host.frame_id));

        // Observations into removed target frames.
        for per_target in self.observations.values_mut() {
            per_target.retain(|target, _| {
                !poses_to_marg.contains(&target.frame_id)
                    && !states_to_marg_all.contains(&target.frame_id)
            });
        }
        self.observations.retain(|_, per_target| !per_target.is_empty());

        // Landmarks that lost every observation.
        let counts = self.observation_counts();
        self.landmarks
            .retain(|kpt_id, _| counts.get(kpt_id).copied().unwrap_or(0) > 0);
    }

    /// Snapshot landmark positions before a trial optimization step.
    pub fn backup(&mut self) {
        self.landmarks_backup.clear();
        for (id, lm) in &self.landmarks {
            self.landmarks_backup.insert(*id, (lm.dir, lm.inv_depth));
        }
    }

    /// Restore landmark positions from the last snapshot.
    pub fn restore(&mut self) {
        for (id, (dir, inv_depth)) in &self.landmarks_backup {
            if let Some(lm) = self.landmarks.get_mut(id) {
                lm.dir = *dir;
                lm.inv_depth = *inv_depth;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcid(frame_id: i64, cam_id: usize) -> TimeCamId {
        TimeCamId { frame_id, cam_id }
    }

    fn obs(kpt_id: u32) -> KeypointObservation {
        KeypointObservation {
            kpt_id,
            pos: Vector2::new(10.0, 20.0),
        }
    }

    fn landmark(host: TimeCamId) -> KeypointPosition {
        KeypointPosition {
            host,
            dir: Vector2::new(0.1, -0.2),
            inv_depth: 0.5,
        }
    }

    #[test]
    fn test_add_observation_unknown_landmark_fails() {
        let mut db = LandmarkDatabase::new();
        assert!(db.add_observation(tcid(1, 0), obs(7)).is_err());
    }

    #[test]
    fn test_observation_grouped_by_host() {
        let mut db = LandmarkDatabase::new();
        db.add_landmark(1, landmark(tcid(100, 0)));
        db.add_observation(tcid(100, 0), obs(1)).unwrap();
        db.add_observation(tcid(200, 0), obs(1)).unwrap();
        db.add_observation(tcid(200, 1), obs(1)).unwrap();

        let groups = db.observations();
        assert_eq!(groups.len(), 1);
        let per_target = groups.get(&tcid(100, 0)).unwrap();
        assert_eq!(per_target.len(), 3);
        assert_eq!(db.observation_counts().get(&1), Some(&3));
    }

    #[test]
    fn test_remove_keyframes_drops_hosted_landmarks() {
        let mut db = LandmarkDatabase::new();
        db.add_landmark(1, landmark(tcid(100, 0)));
        db.add_landmark(2, landmark(tcid(300, 0)));
        db.add_observation(tcid(200, 0), obs(1)).unwrap();
        db.add_observation(tcid(300, 0), obs(1)).unwrap();
        db.add_observation(tcid(400, 0), obs(2)).unwrap();

        let kfs: BTreeSet<i64> = [100].into();
        db.remove_keyframes(&kfs, &BTreeSet::new(), &BTreeSet::new());

        assert!(!db.landmark_exists(1));
        assert!(db.landmark_exists(2));
        assert!(db.observations().get(&tcid(100, 0)).is_none());
    }

    #[test]
    fn test_remove_keyframes_drops_observations_into_removed_targets() {
        let mut db = LandmarkDatabase::new();
        db.add_landmark(1, landmark(tcid(100, 0)));
        db.add_observation(tcid(200, 0), obs(1)).unwrap();
        db.add_observation(tcid(300, 0), obs(1)).unwrap();

        // Target frame 200 is removed entirely; the host survives.
        let states: BTreeSet<i64> = [200].into();
        db.remove_keyframes(&BTreeSet::new(), &BTreeSet::new(), &states);

        assert!(db.landmark_exists(1));
        assert_eq!(db.observation_counts().get(&1), Some(&1));

        // Removing the last observation drops the landmark too.
        let states: BTreeSet<i64> = [300].into();
        db.remove_keyframes(&BTreeSet::new(), &BTreeSet::new(), &states);
        assert!(!db.landmark_exists(1));
    }

    #[test]
    fn test_backup_restore_positions() {
        let mut db = LandmarkDatabase::new();
        db.add_landmark(1, landmark(tcid(100, 0)));
        db.backup();
        db.get_landmark_mut(1).unwrap().inv_depth = 99.0;
        db.restore();
        assert_eq!(db.get_landmark(1).unwrap().inv_depth, 0.5);
    }
}

//! Track / init-segment mapping and transitive init dependencies.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{PipelineError, PipelineResult};

use super::source::MediaSourceDescriptor;

#[derive(Debug, Default)]
pub(crate) struct DependencyMap {
    init_to_track: BTreeMap<u32, u32>,
    track_to_init: BTreeMap<u32, u32>,
    /// init segment id -> init segment ids it depends on
    init_depends: BTreeMap<u32, Vec<u32>>,
    extractors: BTreeSet<u32>,
}

impl DependencyMap {
    pub(crate) fn build(source: &MediaSourceDescriptor) -> PipelineResult<Self> {
        if source.tracks.is_empty() {
            return Err(PipelineError::InvalidArgument("media source has no tracks".into()));
        }
        let mut map = DependencyMap::default();
        for t in &source.tracks {
            if map.track_to_init.insert(t.track_id, t.init_segment_id).is_some() {
                return Err(PipelineError::InvalidArgument(format!(
                    "duplicate track id {}",
                    t.track_id
                )));
            }
            if map.init_to_track.insert(t.init_segment_id, t.track_id).is_some() {
                return Err(PipelineError::InvalidArgument(format!(
                    "init segment {} is shared by several tracks",
                    t.init_segment_id
                )));
            }
            if t.is_extractor {
                map.extractors.insert(t.track_id);
            }
        }
        for t in &source.tracks {
            if let Some(missing) = t
                .depends_on
                .iter()
                .find(|id| !map.init_to_track.contains_key(id))
            {
                return Err(PipelineError::InvalidArgument(format!(
                    "track {} depends on unknown init segment {}",
                    t.track_id, missing
                )));
            }
            map.init_depends.insert(t.init_segment_id, t.depends_on.clone());
        }
        Ok(map)
    }

    pub(crate) fn init_for_track(&self, track_id: u32) -> Option<u32> {
        self.track_to_init.get(&track_id).copied()
    }

    pub(crate) fn track_for_init(&self, init_segment_id: u32) -> Option<u32> {
        self.init_to_track.get(&init_segment_id).copied()
    }

    pub(crate) fn is_extractor(&self, track_id: u32) -> bool {
        self.extractors.contains(&track_id)
    }

    pub(crate) fn track_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.track_to_init.keys().copied()
    }

    pub(crate) fn track_count(&self) -> usize {
        self.track_to_init.len()
    }

    /// `init_segment_id` followed by every init segment it transitively
    /// depends on, each listed once. Cycles are cut.
    pub(crate) fn init_chain(&self, init_segment_id: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![init_segment_id];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            chain.push(id);
            if let Some(deps) = self.init_depends.get(&id) {
                stack.extend(deps.iter().rev().copied());
            }
        }
        chain
    }

    pub(crate) fn track_chain(&self, track_id: u32) -> Option<Vec<u32>> {
        self.init_for_track(track_id).map(|init| self.init_chain(init))
    }

    /// True once every init segment in the track's chain has been parsed.
    pub(crate) fn chain_parsed(&self, track_id: u32, parsed: &HashSet<u32>) -> bool {
        match self.track_chain(track_id) {
            Some(chain) => chain.iter().all(|id| parsed.contains(id)),
            None => false,
        }
    }
}

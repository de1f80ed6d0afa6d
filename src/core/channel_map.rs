//! Channel-to-group assignment for tetrode-style probes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use thiserror::Error;

/// Errors raised while building or querying a channel group map.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelMapError {
    #[error("channel {channel} is assigned to both group {first} and group {second}")]
    Overlap { channel: usize, first: u32, second: u32 },

    #[error("group {0} is listed more than once")]
    DuplicateGroup(u32),

    #[error("group {0} has no channels")]
    EmptyGroup(u32),

    #[error("channel {0} is not part of any group")]
    UnknownChannel(usize),

    #[error("group {0} does not exist")]
    UnknownGroup(u32),
}

/// Immutable mapping from channel index to group id.
///
/// Group ids need not be contiguous. Channels inside a group keep the order
/// they were listed in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelGroupMap {
    groups: BTreeMap<u32, Vec<usize>>,
    channel_to_group: BTreeMap<usize, u32>,
}

impl ChannelGroupMap {
    /// Build a map from an ordered list of groups; group ids are list positions.
    pub fn from_groups(groups: &[Vec<usize>]) -> Result<Self, ChannelMapError> {
        Self::from_indexed_groups(
            groups
                .iter()
                .enumerate()
                .map(|(i, channels)| (i as u32, channels.clone())),
        )
    }

    /// Build a map from explicit `(group id, channels)` pairs.
    pub fn from_indexed_groups<I>(groups: I) -> Result<Self, ChannelMapError>
    where
        I: IntoIterator<Item = (u32, Vec<usize>)>,
    {
        let mut map = ChannelGroupMap::default();

        for (group, channels) in groups {
            if map.groups.contains_key(&group) {
                return Err(ChannelMapError::DuplicateGroup(group));
            }
            if channels.is_empty() {
                return Err(ChannelMapError::EmptyGroup(group));
            }

            let mut ordered = Vec::with_capacity(channels.len());
            for channel in channels {
                if let Some(&first) = map.channel_to_group.get(&channel) {
                    return Err(ChannelMapError::Overlap {
                        channel,
                        first,
                        second: group,
                    });
                }
                // A channel repeated inside its own group is still an overlap.
                if ordered.contains(&channel) {
                    return Err(ChannelMapError::Overlap {
                        channel,
                        first: group,
                        second: group,
                    });
                }
                ordered.push(channel);
            }

            for &channel in &ordered {
                map.channel_to_group.insert(channel, group);
            }
            map.groups.insert(group, ordered);
        }

        Ok(map)
    }

    /// Standard tetrode layout: tetrode `t` (1-based) becomes group `t - 1`
    /// holding channels `(t - 1) * n .. t * n`.
    pub fn for_tetrodes(tetrodes: &[u32], channels_per_tetrode: usize) -> Result<Self, ChannelMapError> {
        Self::from_indexed_groups(tetrodes.iter().map(|&t| {
            let group = t.saturating_sub(1);
            let start = group as usize * channels_per_tetrode;
            (group, (start..start + channels_per_tetrode).collect())
        }))
    }

    /// Group id for a channel.
    pub fn group_of(&self, channel: usize) -> Result<u32, ChannelMapError> {
        self.channel_to_group
            .get(&channel)
            .copied()
            .ok_or(ChannelMapError::UnknownChannel(channel))
    }

    /// Channels belonging to a group, in listed order.
    pub fn channels_in(&self, group: u32) -> Result<&[usize], ChannelMapError> {
        self.groups
            .get(&group)
            .map(Vec::as_slice)
            .ok_or(ChannelMapError::UnknownGroup(group))
    }

    #[inline]
    pub fn contains_channel(&self, channel: usize) -> bool {
        self.channel_to_group.contains_key(&channel)
    }

    #[inline]
    pub fn contains_group(&self, group: u32) -> bool {
        self.groups.contains_key(&group)
    }

    /// Group ids in ascending order.
    pub fn groups(&self) -> impl Iterator<Item = u32> + '_ {
        self.groups.keys().copied()
    }

    /// `(group, channels)` pairs in ascending group order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[usize])> + '_ {
        self.groups.iter().map(|(&g, ch)| (g, ch.as_slice()))
    }

    /// All mapped channels, group by group.
    pub fn channels(&self) -> Vec<usize> {
        self.groups.values().flatten().copied().collect()
    }

    /// Number of mapped channels.
    #[inline]
    pub fn len(&self) -> usize {
        self.channel_to_group.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.channel_to_group.is_empty()
    }

    #[inline]
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Largest channel index in the map.
    pub fn max_channel(&self) -> Option<usize> {
        self.channel_to_group.keys().next_back().copied()
    }

    /// New map with the given channels removed. Groups left empty are dropped,
    /// surviving groups keep their ids.
    pub fn without_channels(&self, removed: &HashSet<usize>) -> Self {
        let mut groups = BTreeMap::new();
        let mut channel_to_group = BTreeMap::new();

        for (&group, channels) in &self.groups {
            let kept: Vec<usize> = channels
                .iter()
                .copied()
                .filter(|c| !removed.contains(c))
                .collect();
            if kept.is_empty() {
                continue;
            }
            for &c in &kept {
                channel_to_group.insert(c, group);
            }
            groups.insert(group, kept);
        }

        Self {
            groups,
            channel_to_group,
        }
    }

    /// New map restricted to the given channels.
    pub fn retain_channels(&self, keep: &BTreeSet<usize>) -> Self {
        let removed: HashSet<usize> = self
            .channel_to_group
            .keys()
            .copied()
            .filter(|c| !keep.contains(c))
            .collect();
        self.without_channels(&removed)
    }

    /// Tetrode-style 2D layout used for probe geometry: groups sit 50 units
    /// apart on the x axis, channels form a 2-wide grid with 10 unit pitch.
    pub fn geometry(&self) -> BTreeMap<usize, [f32; 2]> {
        let mut positions = BTreeMap::new();
        for (&group, channels) in &self.groups {
            for (i, &c) in channels.iter().enumerate() {
                let x = group as f32 * 50.0 + (i % 2) as f32 * 10.0;
                let y = (i / 2) as f32 * 10.0;
                positions.insert(c, [x, y]);
            }
        }
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_groups_cover_each_channel_once() {
        let map = ChannelGroupMap::from_groups(&[vec![0, 1, 2, 3], vec![4, 5, 6, 7]]).unwrap();

        assert_eq!(map.len(), 8);
        assert_eq!(map.num_groups(), 2);
        for c in 0..8 {
            let g = map.group_of(c).unwrap();
            let hits = map.iter().filter(|(_, ch)| ch.contains(&c)).count();
            assert_eq!(hits, 1);
            assert!(map.channels_in(g).unwrap().contains(&c));
        }
    }

    #[test]
    fn test_overlapping_groups_rejected() {
        let err = ChannelGroupMap::from_groups(&[vec![0, 1, 2], vec![2, 3]]).unwrap_err();
        assert_eq!(
            err,
            ChannelMapError::Overlap {
                channel: 2,
                first: 0,
                second: 1
            }
        );
    }

    #[test]
    fn test_repeated_channel_within_group_rejected() {
        let err = ChannelGroupMap::from_groups(&[vec![0, 0]]).unwrap_err();
        assert!(matches!(err, ChannelMapError::Overlap { channel: 0, .. }));
    }

    #[test]
    fn test_unknown_channel_lookup() {
        let map = ChannelGroupMap::from_groups(&[vec![0, 1]]).unwrap();
        assert_eq!(map.group_of(9), Err(ChannelMapError::UnknownChannel(9)));
        assert_eq!(map.channels_in(4), Err(ChannelMapError::UnknownGroup(4)));
    }

    #[test]
    fn test_for_tetrodes_non_contiguous_ids() {
        let map = ChannelGroupMap::for_tetrodes(&[1, 3], 4).unwrap();

        assert_eq!(map.groups().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(map.channels_in(2).unwrap(), &[8, 9, 10, 11]);
        assert_eq!(map.group_of(3).unwrap(), 0);
        assert_eq!(map.max_channel(), Some(11));
    }

    #[test]
    fn test_without_channels_keeps_group_ids() {
        let map = ChannelGroupMap::for_tetrodes(&[1, 2, 3], 4).unwrap();
        let removed: HashSet<usize> = [3, 7, 11].into_iter().collect();

        let narrowed = map.without_channels(&removed);

        assert_eq!(narrowed.len(), 9);
        assert_eq!(narrowed.groups().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(narrowed.channels_in(1).unwrap(), &[4, 5, 6]);
        // Source map unchanged
        assert_eq!(map.len(), 12);
    }

    #[test]
    fn test_without_channels_drops_empty_groups() {
        let map = ChannelGroupMap::from_groups(&[vec![0], vec![1, 2]]).unwrap();
        let removed: HashSet<usize> = [0].into_iter().collect();

        let narrowed = map.without_channels(&removed);
        assert!(!narrowed.contains_group(0));
        assert!(narrowed.contains_group(1));
    }
}

use std::collections::HashSet;

use tracing::warn;

use crate::config::{ReleaseRange, ShardSelection};
use crate::domain::{Organism, OrganismName, WorkUnit};
use crate::error::HarvestError;

/// Cross product of releases and organisms, releases outer, both in input
/// order. Organisms that normalize to an already-seen name are dropped.
pub fn enumerate(
    organisms: &[Organism],
    releases: ReleaseRange,
) -> Result<Vec<WorkUnit>, HarvestError> {
    if releases.start > releases.end {
        return Err(HarvestError::InvalidRange {
            start: releases.start,
            end: releases.end,
        });
    }
    if organisms.is_empty() {
        return Err(HarvestError::EmptyOrganismList);
    }

    let mut seen = HashSet::new();
    let mut named = Vec::with_capacity(organisms.len());
    for organism in organisms {
        let name: OrganismName = organism.name.parse()?;
        if !seen.insert(name.clone()) {
            warn!(organism = %organism.name, normalized = %name, "duplicate organism, keeping first");
            continue;
        }
        named.push((name, organism));
    }

    let mut units = Vec::with_capacity(named.len() * releases.release_count());
    for release in releases.iter() {
        for (name, organism) in &named {
            units.push(WorkUnit {
                organism_name: name.clone(),
                display_name: organism.name.clone(),
                taxid: organism.taxid,
                release,
            });
        }
    }
    Ok(units)
}

/// Release owned by shard `task_index`: one shard per release.
pub fn shard_release(
    selection: ShardSelection,
    releases: ReleaseRange,
) -> Result<u32, HarvestError> {
    let ShardSelection {
        task_index,
        task_count,
    } = selection;
    if task_index >= task_count {
        return Err(HarvestError::ShardOutOfRange {
            index: task_index,
            count: task_count,
        });
    }
    if task_count != releases.release_count() {
        return Err(HarvestError::ShardMismatch {
            count: task_count,
            releases: releases.release_count(),
        });
    }
    let release = u32::try_from(task_index)
        .ok()
        .and_then(|offset| releases.start.checked_add(offset))
        .filter(|release| releases.contains(*release))
        .ok_or(HarvestError::ShardOutOfRange {
            index: task_index,
            count: task_count,
        })?;
    Ok(release)
}

/// Work units owned by one shard.
pub fn assign_shard(
    selection: ShardSelection,
    releases: ReleaseRange,
    units: &[WorkUnit],
) -> Result<Vec<WorkUnit>, HarvestError> {
    let release = shard_release(selection, releases)?;
    Ok(units
        .iter()
        .filter(|unit| unit.release == release)
        .cloned()
        .collect())
}

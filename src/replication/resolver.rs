//! Conflict Resolver
//!
//! Decides what happens to one received entity. A conflict exists only
//! when the local copy is strictly newer than the remote one; resolution is
//! whole-record, never field by field.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::model::{MirrorInstance, Resolution, Strategy};

/// Outcome for one received entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not present locally
    Insert,
    /// Local is not newer; remote replaces it
    Overwrite,
    /// Local is strictly newer; settled by the strategy
    Conflict(Resolution),
}

/// The two parties of a decision
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub local_instance: &'a str,
    /// Configured rank of this instance; unset defers to the mirror's rank
    pub local_priority: Option<i32>,
    pub mirror: &'a MirrorInstance,
}

impl ResolutionContext<'_> {
    /// Whether this instance is authoritative under primary-wins.
    ///
    /// Without an explicit primary, a priority 1 mirror always wins and any
    /// other mirror loses unless this instance is configured with a lower
    /// rank. Equal ranks go to the smaller instance id.
    fn local_is_primary(&self, primary_instance_id: Option<&str>) -> bool {
        match primary_instance_id {
            Some(primary) if primary == self.local_instance => true,
            Some(primary) if primary == self.mirror.instance_id => false,
            _ if self.mirror.priority <= 1 => false,
            _ => match self.local_priority.map(|p| p.cmp(&self.mirror.priority)) {
                None | Some(Ordering::Less) => true,
                Some(Ordering::Greater) => false,
                Some(Ordering::Equal) => self.local_instance < self.mirror.instance_id.as_str(),
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn decide(
        &self,
        strategy: &Strategy,
        local_updated_at: Option<DateTime<Utc>>,
        remote_updated_at: DateTime<Utc>,
        ctx: &ResolutionContext<'_>,
    ) -> Decision {
        let Some(local_updated_at) = local_updated_at else {
            return Decision::Insert;
        };
        if local_updated_at <= remote_updated_at {
            return Decision::Overwrite;
        }

        let resolution = match strategy {
            Strategy::LastWriteWins => Resolution::KeptLocal,
            Strategy::PrimaryWins { primary_instance_id } => {
                if ctx.local_is_primary(primary_instance_id.as_deref()) {
                    Resolution::KeptLocal
                } else {
                    Resolution::TookRemote
                }
            }
            Strategy::Manual => Resolution::Deferred,
        };
        Decision::Conflict(resolution)
    }
}

//! Reconciler: pair changed records from both sides through their links and
//! decide what, if anything, to write.
//!
//! Pure over its inputs: the caller supplies the team's links and the two
//! change sets, and gets back an ordered [`Plan`]. Nothing here talks to a
//! connector or the repository, which keeps planning identical between dry
//! and real runs.
//!
//! Rules, applied per changed record:
//!
//! 1. No link: a live record is created on the other side; a deleted one is
//!    ignored. Records are never matched by content.
//! 2. A record (or its counterpart) linked more than once is a link
//!    invariant violation: skipped and reported as an error.
//! 3. Broken link: skipped.
//! 4. Deleted: propagated when the team allows it, otherwise skipped.
//!    A deletion beats a concurrent edit on the other side.
//! 5. Fingerprint equal to the link's last synced fingerprint: skipped.
//! 6. Both sides changed with different content: the later
//!    `last_modified_at` wins, ties go to the team's primary system, and the
//!    loser is recorded as superseded.
//! 7. Otherwise the change is pushed to the counterpart.

use std::collections::HashMap;
use std::fmt;

use tracing::{info, warn};
use worksync_core::{
    CanonicalRecord, Link, NativeFields, RecordId, RecordRef, RunIssue, SupersededChange,
    SyncConfig, SystemTag,
};

use crate::fingerprint::fingerprint;
use crate::mapper::FieldMapper;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    CreateOpposite,
    UpdateOpposite,
    DeleteOpposite,
    NoOp { reason: String },
    /// Lost a conflict to the counterpart's concurrent edit.
    Superseded,
}

impl Classification {
    fn no_op(reason: impl Into<String>) -> Self {
        Classification::NoOp {
            reason: reason.into(),
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Classification::CreateOpposite
                | Classification::UpdateOpposite
                | Classification::DeleteOpposite
        )
    }
}

/// One step of a plan.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub classification: Classification,
    /// The changed record that produced this entry.
    pub source: RecordRef,
    pub target_system: SystemTag,
    /// Counterpart id, for updates and deletes.
    pub target_id: Option<RecordId>,
    /// Native fields for the target system. Empty unless creating or
    /// updating.
    pub payload: NativeFields,
    /// Fingerprint of the source record; stored on the link once applied.
    pub fingerprint: String,
    pub link: Option<Link>,
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self
            .target_id
            .as_ref()
            .map(|id| format!("{}:{id}", self.target_system.as_str()))
            .unwrap_or_else(|| format!("{} (new)", self.target_system));
        match &self.classification {
            Classification::CreateOpposite => write!(f, "create {target} from {}", self.source),
            Classification::UpdateOpposite => write!(f, "update {target} from {}", self.source),
            Classification::DeleteOpposite => write!(f, "delete {target} after {}", self.source),
            Classification::NoOp { reason } => write!(f, "skip {} ({reason})", self.source),
            Classification::Superseded => {
                write!(f, "skip {} (superseded by {target})", self.source)
            }
        }
    }
}

/// Expected effect of a plan if every entry succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanSummary {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// A-side records first, then B-side, each in collection order.
    pub entries: Vec<PlanEntry>,
    pub issues: Vec<RunIssue>,
    pub superseded: Vec<SupersededChange>,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.classification {
                Classification::CreateOpposite => summary.created += 1,
                Classification::UpdateOpposite => summary.updated += 1,
                Classification::DeleteOpposite => summary.deleted += 1,
                Classification::NoOp { .. } | Classification::Superseded => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Links of one team, indexed by either side's id.
struct LinkIndex<'a> {
    by_id: HashMap<(SystemTag, RecordId), Vec<&'a Link>>,
}

impl<'a> LinkIndex<'a> {
    fn new(links: &'a [Link]) -> Self {
        let mut by_id: HashMap<(SystemTag, RecordId), Vec<&'a Link>> = HashMap::new();
        for link in links {
            for system in SystemTag::both() {
                by_id
                    .entry((system, link.id_for(system).clone()))
                    .or_default()
                    .push(link);
            }
        }
        Self { by_id }
    }

    fn get(&self, system: SystemTag, id: &RecordId) -> Vec<&'a Link> {
        self.by_id
            .get(&(system, id.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

pub struct Reconciler<'a> {
    mapper: &'a FieldMapper,
    primary: SystemTag,
    propagate_deletes: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &SyncConfig, mapper: &'a FieldMapper) -> Self {
        Self {
            mapper,
            primary: config.primary,
            propagate_deletes: config.propagate_deletes,
        }
    }

    /// Build the plan for one pass. `a` and `b` hold at most one record per id.
    pub fn plan(&self, links: &[Link], a: &[CanonicalRecord], b: &[CanonicalRecord]) -> Plan {
        let index = LinkIndex::new(links);
        let changes: HashMap<(SystemTag, &RecordId), &CanonicalRecord> = a
            .iter()
            .chain(b)
            .map(|r| ((r.source, &r.external_id), r))
            .collect();

        let mut plan = Plan::default();
        for record in a.iter().chain(b) {
            let entry = self.classify(record, &index, &changes, &mut plan);
            plan.entries.push(entry);
        }
        plan
    }

    fn classify(
        &self,
        record: &CanonicalRecord,
        index: &LinkIndex<'_>,
        changes: &HashMap<(SystemTag, &RecordId), &CanonicalRecord>,
        plan: &mut Plan,
    ) -> PlanEntry {
        let source = record.record_ref();
        let target = record.source.opposite();
        let fp = fingerprint(record);
        let mut entry = PlanEntry {
            classification: Classification::no_op("unchanged"),
            source: source.clone(),
            target_system: target,
            target_id: None,
            payload: NativeFields::new(),
            fingerprint: fp.clone(),
            link: None,
        };

        let link = match index.get(record.source, &record.external_id).as_slice() {
            [] if record.deleted => {
                entry.classification = Classification::no_op("deleted before it was linked");
                return entry;
            }
            [] => {
                entry.classification = Classification::CreateOpposite;
                entry.payload = self.payload(record, target, plan);
                return entry;
            }
            [link] => *link,
            many => {
                self.violation(&mut entry, plan, format!("linked to {} counterparts", many.len()));
                return entry;
            }
        };

        let counterpart_id = link.id_for(target);
        entry.target_id = Some(counterpart_id.clone());
        entry.link = Some(link.clone());

        let reverse = index.get(target, counterpart_id);
        if reverse.len() != 1 {
            self.violation(
                &mut entry,
                plan,
                format!(
                    "counterpart {}:{counterpart_id} is linked {} times",
                    target.as_str(),
                    reverse.len()
                ),
            );
            return entry;
        }

        if link.is_broken() {
            entry.classification = Classification::no_op("link broken");
            return entry;
        }

        let counterpart = changes.get(&(target, counterpart_id)).copied();

        if record.deleted {
            if self.propagate_deletes {
                entry.classification = Classification::DeleteOpposite;
            } else {
                info!(record = %source, "deletion not propagated");
                entry.classification = Classification::no_op("deletion not propagated");
            }
            return entry;
        }

        if counterpart.is_some_and(|c| c.deleted) {
            entry.classification = Classification::no_op("counterpart deleted");
            return entry;
        }

        if fp == link.last_synced_fingerprint {
            return entry;
        }

        if let Some(other) = counterpart {
            let other_fp = fingerprint(other);
            if other_fp != link.last_synced_fingerprint {
                if other_fp == fp {
                    entry.classification = Classification::no_op("both sides already agree");
                    return entry;
                }
                if !self.wins(record, other) {
                    entry.classification = Classification::Superseded;
                    plan.superseded.push(SupersededChange {
                        loser: source,
                        winner: other.record_ref(),
                        loser_modified_at: record.last_modified_at,
                        winner_modified_at: other.last_modified_at,
                    });
                    return entry;
                }
            }
        }

        entry.classification = Classification::UpdateOpposite;
        entry.payload = self.payload(record, target, plan);
        entry
    }

    /// Whether `record` wins a conflict against `other`.
    fn wins(&self, record: &CanonicalRecord, other: &CanonicalRecord) -> bool {
        match record.last_modified_at.cmp(&other.last_modified_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => record.source == self.primary,
        }
    }

    fn payload(&self, record: &CanonicalRecord, target: SystemTag, plan: &mut Plan) -> NativeFields {
        let mapped = self.mapper.from_canonical(record, target);
        plan.issues.extend(mapped.warnings);
        mapped.value
    }

    fn violation(&self, entry: &mut PlanEntry, plan: &mut Plan, detail: String) {
        warn!(record = %entry.source, detail = %detail, "link invariant violation");
        plan.issues.push(RunIssue::error(
            Some(entry.source.clone()),
            format!("link invariant violation: {detail}"),
        ));
        entry.classification = Classification::no_op("link invariant violation");
    }
}

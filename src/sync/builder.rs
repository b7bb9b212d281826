use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::Deserialize;

use crate::model::record::{Link, LinkKind, Record, RecordId, RecordKind};
use crate::model::work_unit::WorkUnit;

/// Which records may anchor a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrimaryRule {
    #[default]
    IssuesOnly,
    IssuesAndMergeRequests,
}

impl PrimaryRule {
    fn eligible(&self, record: &Record) -> bool {
        match self {
            PrimaryRule::IssuesOnly => record.kind() == RecordKind::Issue,
            PrimaryRule::IssuesAndMergeRequests => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub primary_rule: PrimaryRule,
    /// Traversal bound for collecting secondaries; a chain deeper than this
    /// fails the unit it belongs to.
    pub max_depth: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            primary_rule: PrimaryRule::default(),
            max_depth: 5,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("part-of cycle through {0}")]
    CycleDetected(RecordId),
    #[error("traversal from {root} exceeded depth {depth}")]
    DepthExceeded { root: RecordId, depth: usize },
}

#[derive(Debug, Clone)]
pub enum BuildWarning {
    /// A record was requested as a secondary by more than one root; the
    /// smallest-numbered root keeps it.
    AmbiguousMembership {
        record: RecordId,
        kept_by: RecordId,
        contender: RecordId,
    },
    /// A link kind the tool does not understand was skipped.
    UnknownLinkKind { from: RecordId, raw: String },
}

/// Result of one grouping pass. A unit that fails to build lands in
/// `failures` without taking the rest of the run down with it.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub units: Vec<WorkUnit>,
    pub warnings: Vec<BuildWarning>,
    pub failures: Vec<(RecordId, BuildError)>,
}

impl BuildOutcome {
    pub fn unit(&self, id: &RecordId) -> Option<&WorkUnit> {
        self.units.iter().find(|u| u.id() == id)
    }
}

/// Partition records into work units.
///
/// Roots are visited in ascending id order, so when two roots both reach the
/// same secondary, the smaller-numbered root claims it and the later root gets
/// an ambiguous-membership warning.
pub fn build_units(records: &[Record], links: &[Link], config: &BuilderConfig) -> BuildOutcome {
    let by_id: HashMap<&RecordId, &Record> = records.iter().map(|r| (&r.id, r)).collect();
    let mut outcome = BuildOutcome::default();

    // Grouping adjacency, traversed in both directions: the tracker may
    // report either end of a relationship.
    let mut adjacent: HashMap<&RecordId, Vec<&RecordId>> = HashMap::new();
    // part-of edges between primary-eligible records, for cycle detection
    let mut primary_part_of: HashMap<&RecordId, Vec<&RecordId>> = HashMap::new();

    for link in links {
        if let LinkKind::Unknown(raw) = &link.kind {
            outcome.warnings.push(BuildWarning::UnknownLinkKind {
                from: link.from.clone(),
                raw: raw.clone(),
            });
            continue;
        }
        if !link.kind.is_grouping() {
            continue;
        }
        if !by_id.contains_key(&link.from) || !by_id.contains_key(&link.to) {
            log::debug!(
                "grouping link {} -> {} references a record outside this run; skipping",
                link.from,
                link.to
            );
            continue;
        }
        adjacent.entry(&link.from).or_default().push(&link.to);
        adjacent.entry(&link.to).or_default().push(&link.from);

        if link.kind == LinkKind::PartOf {
            let from_eligible = config.primary_rule.eligible(by_id[&link.from]);
            let to_eligible = config.primary_rule.eligible(by_id[&link.to]);
            if from_eligible && to_eligible {
                primary_part_of.entry(&link.from).or_default().push(&link.to);
            }
        }
    }

    let cyclic = find_part_of_cycles(&primary_part_of);

    let mut roots: Vec<&Record> = records
        .iter()
        .filter(|r| config.primary_rule.eligible(r))
        .collect();
    roots.sort_by(|a, b| a.id.cmp(&b.id));

    // record -> id of the root that claimed it (as primary or secondary)
    let mut claimed: BTreeMap<RecordId, RecordId> = BTreeMap::new();
    let mut failed_roots: BTreeSet<RecordId> = BTreeSet::new();

    for root in roots {
        if cyclic.contains(&root.id) {
            failed_roots.insert(root.id.clone());
            outcome
                .failures
                .push((root.id.clone(), BuildError::CycleDetected(root.id.clone())));
            continue;
        }

        match collect_unit(root, &by_id, &adjacent, config, &claimed, &mut outcome.warnings) {
            Ok((unit, new_claims)) => {
                claimed.extend(new_claims);
                outcome.units.push(unit);
            }
            Err(err) => {
                failed_roots.insert(root.id.clone());
                outcome.failures.push((root.id.clone(), err));
            }
        }
    }

    // Anything never claimed becomes an orphan unit so it is not silently
    // dropped from the board. Roots of failed units stay failed.
    for record in records {
        if claimed.contains_key(&record.id) || failed_roots.contains(&record.id) {
            continue;
        }
        log::info!("no eligible root reaches {}; surfacing as orphan unit", record.id);
        claimed.insert(record.id.clone(), record.id.clone());
        let mut unit = WorkUnit::new(record.clone());
        unit.orphan = true;
        outcome.units.push(unit);
    }

    for unit in &mut outcome.units {
        unit.unresolved_blockers = unresolved_blockers(unit, links, &by_id);
    }

    outcome
}

type Claims = Vec<(RecordId, RecordId)>;

fn collect_unit(
    root: &Record,
    by_id: &HashMap<&RecordId, &Record>,
    adjacent: &HashMap<&RecordId, Vec<&RecordId>>,
    config: &BuilderConfig,
    claimed: &BTreeMap<RecordId, RecordId>,
    warnings: &mut Vec<BuildWarning>,
) -> Result<(WorkUnit, Claims), BuildError> {
    let mut unit = WorkUnit::new(root.clone());
    // claims are merged by the caller only if the whole unit builds
    let mut new_claims: Claims = vec![(root.id.clone(), root.id.clone())];

    let mut visited: BTreeSet<&RecordId> = BTreeSet::new();
    visited.insert(&root.id);
    let mut queue: VecDeque<(&RecordId, usize)> = VecDeque::new();
    queue.push_back((&root.id, 0));

    while let Some((current, depth)) = queue.pop_front() {
        if depth > config.max_depth {
            return Err(BuildError::DepthExceeded {
                root: root.id.clone(),
                depth,
            });
        }
        let Some(neighbors) = adjacent.get(current) else {
            continue;
        };
        for &next in neighbors {
            if !visited.insert(next) {
                continue;
            }
            let record = by_id[next];
            if config.primary_rule.eligible(record) {
                // another root, not a secondary; it builds its own unit
                continue;
            }
            match claimed.get(next) {
                Some(winner) => {
                    warnings.push(BuildWarning::AmbiguousMembership {
                        record: next.clone(),
                        kept_by: winner.clone(),
                        contender: root.id.clone(),
                    });
                    continue;
                }
                None => {
                    new_claims.push((next.clone(), root.id.clone()));
                    unit.secondaries.push(record.clone());
                    queue.push_back((next, depth + 1));
                }
            }
        }
    }

    Ok((unit, new_claims))
}

/// Records on some part-of cycle among primary-eligible records.
fn find_part_of_cycles(edges: &HashMap<&RecordId, Vec<&RecordId>>) -> BTreeSet<RecordId> {
    let mut cyclic = BTreeSet::new();
    for &start in edges.keys() {
        // bounded walk; revisiting the start means a cycle
        let mut stack: Vec<(&RecordId, Vec<&RecordId>)> = vec![(start, vec![start])];
        while let Some((node, path)) = stack.pop() {
            let Some(nexts) = edges.get(node) else {
                continue;
            };
            for &next in nexts {
                if next == start {
                    cyclic.extend(path.iter().map(|id| (*id).clone()));
                    continue;
                }
                if path.contains(&next) {
                    continue;
                }
                let mut longer = path.clone();
                longer.push(next);
                stack.push((next, longer));
            }
        }
    }
    cyclic
}

fn unresolved_blockers(
    unit: &WorkUnit,
    links: &[Link],
    by_id: &HashMap<&RecordId, &Record>,
) -> BTreeSet<RecordId> {
    let mut blockers = BTreeSet::new();
    for link in links {
        if !link.kind.is_blocking() {
            continue;
        }
        // normalize both stored directions to "blocker -> blocked member"
        let (blocker, blocked) = match link.kind {
            LinkKind::Blocks => (&link.from, &link.to),
            LinkKind::BlockedBy => (&link.to, &link.from),
            _ => unreachable!(),
        };
        if !unit.contains(blocked) || unit.contains(blocker) {
            continue;
        }
        let open = by_id.get(blocker).map(|r| r.state.is_open()).unwrap_or(false);
        if open {
            blockers.insert(blocker.clone());
        }
    }
    blockers
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::record::RecordState;

    fn record(project: &str, number: u64, kind: RecordKind) -> Record {
        Record {
            id: RecordId {
                project: project.into(),
                kind,
                number,
            },
            title: format!("Record {number}"),
            state: RecordState::Open,
            labels: BTreeSet::new(),
            author: "dev".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            draft: false,
            url: None,
            oldest_unresolved_discussion: None,
        }
    }

    fn issue(number: u64) -> Record {
        record("p", number, RecordKind::Issue)
    }

    fn mr(number: u64) -> Record {
        record("p", number, RecordKind::MergeRequest)
    }

    fn link(from: &Record, to: &Record, kind: LinkKind) -> Link {
        Link {
            from: from.id.clone(),
            to: to.id.clone(),
            kind,
        }
    }

    #[test]
    fn issue_with_part_of_mr_becomes_one_unit() {
        let a = issue(1);
        let b = mr(2);
        let links = vec![link(&a, &b, LinkKind::PartOf)];
        let outcome = build_units(&[a.clone(), b.clone()], &links, &BuilderConfig::default());

        assert_eq!(outcome.units.len(), 1);
        assert!(outcome.failures.is_empty());
        let unit = &outcome.units[0];
        assert_eq!(unit.id(), &a.id);
        assert_eq!(unit.secondaries.len(), 1);
        assert_eq!(unit.secondaries[0].id, b.id);
        assert!(!unit.orphan);
    }

    #[test]
    fn grouping_follows_reverse_edges_too() {
        // only the MR -> issue direction is stored
        let a = issue(1);
        let b = mr(2);
        let links = vec![link(&b, &a, LinkKind::RelatesTo)];
        let outcome = build_units(&[a.clone(), b], &links, &BuilderConfig::default());
        assert_eq!(outcome.unit(&a.id).unwrap().secondaries.len(), 1);
    }

    #[test]
    fn blocking_links_do_not_group() {
        let a = issue(1);
        let b = mr(2);
        let links = vec![link(&a, &b, LinkKind::Blocks)];
        let outcome = build_units(&[a.clone(), b.clone()], &links, &BuilderConfig::default());
        // b is not pulled into a's unit; it surfaces as an orphan
        assert_eq!(outcome.units.len(), 2);
        assert!(outcome.unit(&a.id).unwrap().secondaries.is_empty());
        assert!(outcome.unit(&b.id).unwrap().orphan);
    }

    #[test]
    fn contested_secondary_goes_to_smaller_root() {
        // C and D both part-of E; C also part-of F. E has the smaller number.
        let e = issue(5);
        let f = issue(6);
        let c = mr(10);
        let d = mr(11);
        let links = vec![
            link(&c, &e, LinkKind::PartOf),
            link(&d, &e, LinkKind::PartOf),
            link(&c, &f, LinkKind::PartOf),
        ];
        let outcome = build_units(
            &[e.clone(), f.clone(), c.clone(), d.clone()],
            &links,
            &BuilderConfig::default(),
        );

        assert!(outcome.failures.is_empty());
        let unit_e = outcome.unit(&e.id).unwrap();
        let unit_f = outcome.unit(&f.id).unwrap();
        assert!(unit_e.contains(&c.id));
        assert!(unit_e.contains(&d.id));
        assert!(unit_f.secondaries.is_empty());

        let ambiguous: Vec<_> = outcome
            .warnings
            .iter()
            .filter_map(|w| match w {
                BuildWarning::AmbiguousMembership {
                    record,
                    kept_by,
                    contender,
                } => Some((record.clone(), kept_by.clone(), contender.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(ambiguous, vec![(c.id.clone(), e.id.clone(), f.id.clone())]);
    }

    #[test]
    fn part_of_cycle_fails_only_those_units() {
        let a = issue(1);
        let b = issue(2);
        let c = issue(3);
        let links = vec![
            link(&a, &b, LinkKind::PartOf),
            link(&b, &a, LinkKind::PartOf),
        ];
        let outcome = build_units(&[a.clone(), b.clone(), c.clone()], &links, &BuilderConfig::default());

        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome
            .failures
            .iter()
            .all(|(_, e)| matches!(e, BuildError::CycleDetected(_))));
        // c is untouched by the malformed pair
        assert!(outcome.unit(&c.id).is_some());
    }

    #[test]
    fn deep_chain_fails_the_unit() {
        let root = issue(1);
        let chain: Vec<Record> = (2..=8).map(mr).collect();
        let mut links = vec![link(&root, &chain[0], LinkKind::RelatesTo)];
        for pair in chain.windows(2) {
            links.push(link(&pair[0], &pair[1], LinkKind::RelatesTo));
        }
        let mut records = vec![root.clone()];
        records.extend(chain.iter().cloned());

        let config = BuilderConfig {
            max_depth: 3,
            ..BuilderConfig::default()
        };
        let outcome = build_units(&records, &links, &config);
        assert!(outcome
            .failures
            .iter()
            .any(|(id, e)| id == &root.id && matches!(e, BuildError::DepthExceeded { .. })));
    }

    #[test]
    fn orphan_mr_gets_synthetic_root() {
        let lone = mr(42);
        let outcome = build_units(&[lone.clone()], &[], &BuilderConfig::default());
        let unit = outcome.unit(&lone.id).unwrap();
        assert!(unit.orphan);
        assert!(unit.secondaries.is_empty());
    }

    #[test]
    fn unresolved_blockers_point_outside_the_unit() {
        let a = issue(1);
        let b = mr(2);
        let mut blocker = issue(3);
        let mut closed_blocker = issue(4);
        closed_blocker.state = RecordState::Closed;

        let links = vec![
            link(&a, &b, LinkKind::PartOf),
            // stored only as "b is blocked by 3"
            link(&b, &blocker, LinkKind::BlockedBy),
            link(&closed_blocker, &a, LinkKind::Blocks),
        ];
        blocker.state = RecordState::Open;
        let records = vec![a.clone(), b, blocker.clone(), closed_blocker];
        let outcome = build_units(&records, &links, &BuilderConfig::default());

        let unit = outcome.unit(&a.id).unwrap();
        assert!(unit.unresolved());
        assert_eq!(unit.unresolved_blockers.len(), 1);
        assert!(unit.unresolved_blockers.contains(&blocker.id));
    }

    #[test]
    fn unknown_link_kind_is_warned_and_skipped() {
        let a = issue(1);
        let b = mr(2);
        let links = vec![Link {
            from: a.id.clone(),
            to: b.id.clone(),
            kind: LinkKind::Unknown("mentioned_in".into()),
        }];
        let outcome = build_units(&[a.clone(), b], &links, &BuilderConfig::default());
        assert!(outcome.unit(&a.id).unwrap().secondaries.is_empty());
        assert!(outcome
            .warnings
            .iter()
            .any(|w| matches!(w, BuildWarning::UnknownLinkKind { .. })));
    }
}

//! Ref advertisement shown to the client during the receive handshake.
//!
//! The advertisement is produced by an ordered chain of steps. Each step
//! takes the previous step's output; the chain is fixed once the
//! coordinator is built.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{PermissionError, ReceiveError, ReceiveResult, RepositoryError};
use crate::object::{ref_names, ObjectId, Ref};
use crate::permission::{PermissionBackend, RefFilterOptions};
use crate::project::{ProjectState, UserIdentity};
use crate::repository::Repository;

/// Open changes whose revisions are advertised as `.have` lines.
pub const MAX_OPEN_CHANGE_HAVES: usize = 32;

/// Length of one `.have` advertisement line in bytes.
const HAVE_LINE_LEN: usize = 4 + 40 + 1 + 5 + 1;
/// Budget spent on advertising recent history to legacy clients.
const MAX_EXTRA_BYTES: usize = 8192;
pub const MAX_HISTORY: usize = MAX_EXTRA_BYTES / HAVE_LINE_LEN;
pub const BASE_COMMITS: usize = 64;
pub const STEP_COMMITS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    refs: BTreeMap<String, Ref>,
    haves: BTreeSet<ObjectId>,
}

impl Advertisement {
    pub fn from_refs(refs: impl IntoIterator<Item = Ref>) -> Self {
        Self {
            refs: refs.into_iter().map(|r| (r.name.clone(), r)).collect(),
            haves: BTreeSet::new(),
        }
    }

    pub fn refs(&self) -> impl Iterator<Item = &Ref> {
        self.refs.values()
    }

    pub fn ref_names(&self) -> Vec<String> {
        self.refs.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Ref> {
        self.refs.get(name)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn haves(&self) -> &BTreeSet<ObjectId> {
        &self.haves
    }

    pub fn add_have(&mut self, id: ObjectId) {
        self.haves.insert(id);
    }

    pub fn retain_refs(&mut self, mut keep: impl FnMut(&Ref) -> bool) {
        self.refs.retain(|_, r| keep(r));
    }

    /// Ref tips plus extra haves: everything the client will treat as known.
    pub fn advertised_objects(&self) -> BTreeSet<ObjectId> {
        self.refs
            .values()
            .map(|r| r.object_id)
            .chain(self.haves.iter().copied())
            .collect()
    }

    pub fn into_refs(self) -> Vec<Ref> {
        self.refs.into_values().collect()
    }
}

pub type AdvertiseStep = Box<dyn Fn(Advertisement) -> ReceiveResult<Advertisement> + Send + Sync>;

pub fn step<F>(f: F) -> AdvertiseStep
where
    F: Fn(Advertisement) -> ReceiveResult<Advertisement> + Send + Sync + 'static,
{
    Box::new(f)
}

#[derive(Default)]
pub struct AdvertiseChain {
    steps: Vec<AdvertiseStep>,
}

impl AdvertiseChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: AdvertiseStep) {
        self.steps.push(step);
    }

    pub fn with(mut self, step: AdvertiseStep) -> Self {
        self.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn advertise(&self, initial: Advertisement) -> ReceiveResult<Advertisement> {
        self.steps.iter().try_fold(initial, |adv, step| step(adv))
    }
}

/// Remembers every ref seen at advertisement time, before any filtering.
#[derive(Debug, Clone, Default)]
pub struct AllRefsWatcher {
    refs: Arc<RwLock<Option<BTreeMap<String, Ref>>>>,
}

impl AllRefsWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observer(&self) -> AdvertiseStep {
        let watcher = self.clone();
        step(move |adv| {
            watcher.observe(&adv);
            Ok(adv)
        })
    }

    pub fn observe(&self, adv: &Advertisement) {
        *self.refs.write() = Some(adv.refs.clone());
    }

    pub fn has_observed(&self) -> bool {
        self.refs.read().is_some()
    }

    pub fn all_refs(&self) -> Vec<Ref> {
        self.refs
            .read()
            .as_ref()
            .map(|refs| refs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<Ref> {
        self.refs.read().as_ref()?.get(name).cloned()
    }

    /// Whether `name` existed when the push started.
    pub fn existed(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

pub fn permission_filter(
    permissions: Arc<dyn PermissionBackend>,
    user: UserIdentity,
    project: ProjectState,
    repo: Arc<dyn Repository>,
) -> AdvertiseStep {
    step(move |adv| {
        let haves = adv.haves.clone();
        let visible = permissions
            .filter_refs(
                &user,
                &project,
                repo.as_ref(),
                adv.into_refs(),
                RefFilterOptions { filter_meta: true },
            )
            .map_err(|err| {
                ReceiveError::Permission(match err {
                    PermissionError::Backend(msg) => msg,
                    PermissionError::Denied(reason) => format!("ref filtering refused: {reason}"),
                })
            })?;
        let mut filtered = Advertisement::from_refs(visible);
        filtered.haves = haves;
        Ok(filtered)
    })
}

/// Finds the current revisions of open changes owned by a user.
pub trait OpenChangeQuery: Send + Sync {
    fn open_change_revisions(
        &self,
        project: &ProjectState,
        owner: &UserIdentity,
        limit: usize,
    ) -> Result<Vec<ObjectId>, RepositoryError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpenChanges;

impl OpenChangeQuery for NoOpenChanges {
    fn open_change_revisions(
        &self,
        _project: &ProjectState,
        _owner: &UserIdentity,
        _limit: usize,
    ) -> Result<Vec<ObjectId>, RepositoryError> {
        Ok(Vec::new())
    }
}

/// Hides review and cache refs, then advertises the pusher's open change
/// revisions as haves so re-pushing a change does not resend its objects.
pub fn open_change_haves(
    query: Arc<dyn OpenChangeQuery>,
    user: UserIdentity,
    project: ProjectState,
) -> AdvertiseStep {
    step(move |mut adv| {
        adv.retain_refs(|r| !skip_for_receive(&r.name));
        match query.open_change_revisions(&project, &user, MAX_OPEN_CHANGE_HAVES) {
            Ok(revisions) => {
                for id in revisions.into_iter().take(MAX_OPEN_CHANGE_HAVES) {
                    adv.add_have(id);
                }
            }
            Err(err) => warn!(
                project = %project.name,
                user = %user,
                error = %err,
                "cannot list open changes"
            ),
        }
        Ok(adv)
    })
}

fn skip_for_receive(name: &str) -> bool {
    name.starts_with(ref_names::REFS_CHANGES)
        || name.starts_with(ref_names::REFS_CACHE_AUTOMERGE)
        || ref_names::is_magic_branch(name)
}

/// Advertises a slice of recent branch history so old clients that
/// negotiate poorly find a merge base without sending the whole history.
pub fn push_negotiation_haves(repo: Arc<dyn Repository>) -> AdvertiseStep {
    step(move |mut adv| {
        let history = recent_history(repo.as_ref(), &adv);
        debug!(count = history.len(), "advertising recent history as haves");
        for id in history {
            adv.add_have(id);
        }
        Ok(adv)
    })
}

fn recent_history(repo: &dyn Repository, adv: &Advertisement) -> Vec<ObjectId> {
    let already_sending = adv.advertised_objects();
    let extra = already_sending.len().saturating_sub(adv.len());
    let max = MAX_HISTORY.saturating_sub(extra);
    if max == 0 {
        return Vec::new();
    }

    let starts: Vec<ObjectId> = adv
        .refs()
        .filter(|r| r.name == ref_names::HEAD || r.name.starts_with(ref_names::REFS_HEADS))
        .map(|r| r.object_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if starts.is_empty() {
        return Vec::new();
    }

    let walk = match repo.walk_history(&starts) {
        Ok(walk) => walk,
        Err(err) => {
            warn!(error = %err, "cannot walk history for push negotiation");
            return Vec::new();
        }
    };

    let mut history = Vec::with_capacity(max);
    let mut seen = BTreeSet::new();
    let mut step = 0usize;
    for commit in walk {
        if history.len() >= max {
            break;
        }
        let commit = match commit {
            Ok(commit) => commit,
            Err(err) => {
                warn!(error = %err, "history walk for push negotiation failed");
                break;
            }
        };
        if commit.parent_count > 1
            || already_sending.contains(&commit.id)
            || !seen.insert(commit.id)
        {
            continue;
        }
        if history.len() < BASE_COMMITS {
            history.push(commit.id);
        } else {
            step += 1;
            if step % STEP_COMMITS == 0 {
                history.push(commit.id);
            }
        }
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{CommitInfo, HistoryWalk};

    fn id(n: u32) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[16..].copy_from_slice(&n.to_be_bytes());
        ObjectId::from_bytes(bytes)
    }

    struct LinearRepo {
        refs: Vec<Ref>,
        commits: Vec<CommitInfo>,
    }

    impl Repository for LinearRepo {
        fn all_refs(&self) -> Result<Vec<Ref>, RepositoryError> {
            Ok(self.refs.clone())
        }

        fn walk_history(&self, _starts: &[ObjectId]) -> Result<HistoryWalk<'_>, RepositoryError> {
            Ok(Box::new(self.commits.iter().copied().map(Ok)))
        }
    }

    fn linear(count: u32) -> Vec<CommitInfo> {
        (1..=count)
            .map(|n| CommitInfo {
                id: id(n),
                parent_count: 1,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn steps_run_in_order() {
        let chain = AdvertiseChain::new()
            .with(step(|mut adv| {
                adv.add_have(id(1));
                Ok(adv)
            }))
            .with(step(|mut adv| {
                assert!(adv.haves().contains(&id(1)), "second step sees first");
                adv.retain_refs(|r| r.name != "refs/heads/b");
                Ok(adv)
            }));
        let adv = chain
            .advertise(Advertisement::from_refs([
                Ref::new("refs/heads/a", id(10)),
                Ref::new("refs/heads/b", id(11)),
            ]))
            .expect("advertise");
        assert_eq!(adv.ref_names(), vec!["refs/heads/a".to_string()]);
        assert_eq!(chain.len(), 2);
    }

    #[test_timeout::timeout]
    fn watcher_records_unfiltered_refs() {
        let watcher = AllRefsWatcher::new();
        let chain = AdvertiseChain::new()
            .with(watcher.observer())
            .with(step(|mut adv| {
                adv.retain_refs(|r| r.name.starts_with("refs/heads/"));
                Ok(adv)
            }));
        assert!(!watcher.has_observed());
        let adv = chain
            .advertise(Advertisement::from_refs([
                Ref::new("refs/heads/main", id(1)),
                Ref::new("refs/meta/config", id(2)),
            ]))
            .expect("advertise");
        assert_eq!(adv.len(), 1);
        assert_eq!(watcher.all_refs().len(), 2);
        assert!(watcher.existed("refs/meta/config"));
    }

    #[test_timeout::timeout]
    fn failing_step_stops_the_chain() {
        let chain = AdvertiseChain::new()
            .with(step(|_adv| Err(ReceiveError::Permission("down".into()))))
            .with(step(|_adv| panic!("must not run")));
        assert!(matches!(
            chain.advertise(Advertisement::default()),
            Err(ReceiveError::Permission(_))
        ));
    }

    #[test_timeout::timeout]
    fn skips_review_and_magic_refs() {
        assert!(skip_for_receive("refs/changes/01/1/1"));
        assert!(skip_for_receive("refs/cache-automerge/ab/cdef"));
        assert!(skip_for_receive("refs/for/main"));
        assert!(!skip_for_receive("refs/heads/main"));
    }

    #[test_timeout::timeout]
    fn history_takes_base_commits_then_every_step() {
        let repo = LinearRepo {
            refs: vec![Ref::new("refs/heads/main", id(1))],
            commits: linear(2000),
        };
        let adv = Advertisement::from_refs(repo.refs.clone());
        let history = recent_history(&repo, &adv);

        assert_eq!(history.len(), MAX_HISTORY);
        // id(1) is the advertised tip and is skipped.
        assert_eq!(history[0], id(2));
        assert_eq!(history[BASE_COMMITS - 1], id(BASE_COMMITS as u32 + 1));
        assert_eq!(
            history[BASE_COMMITS],
            id(BASE_COMMITS as u32 + 1 + STEP_COMMITS as u32)
        );
    }

    #[test_timeout::timeout]
    fn history_skips_merges_and_needs_branch_heads() {
        let repo = LinearRepo {
            refs: vec![Ref::new("refs/tags/v1", id(1))],
            commits: vec![
                CommitInfo {
                    id: id(2),
                    parent_count: 2,
                },
                CommitInfo {
                    id: id(3),
                    parent_count: 1,
                },
            ],
        };
        let tags_only = Advertisement::from_refs(repo.refs.clone());
        assert!(recent_history(&repo, &tags_only).is_empty());

        let with_head = Advertisement::from_refs([Ref::new("HEAD", id(1))]);
        assert_eq!(recent_history(&repo, &with_head), vec![id(3)]);
    }
}

//! In-memory collaborators for driving a `PushCoordinator` end to end.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::Registry;
use tidegate_receive::error::{PermissionError, RepositoryError};
use tidegate_receive::permission::{ContributorAgreements, ProjectPermission, RefFilterOptions};
use tidegate_receive::repository::{CommitInfo, HistoryWalk, Repository};
use tidegate_receive::{
    CommitProcessor, ObjectId, PermissionBackend, PostReceiveHook, ProjectState, ProtocolSession,
    PushContext, PushCoordinator, ReceiveCommand, ReceiveConfig, ReceiveExecutor, ReceiveMetrics,
    ReceiveServices, Ref, UserIdentity,
};

pub fn id(n: u32) -> ObjectId {
    let mut bytes = [0u8; 20];
    bytes[16..].copy_from_slice(&n.to_be_bytes());
    ObjectId::from_bytes(bytes)
}

pub fn update(name: &str, old: u32, new: u32) -> ReceiveCommand {
    ReceiveCommand::new(id(old), id(new), name)
}

#[derive(Default)]
pub struct MemoryRepo {
    refs: Mutex<Vec<Ref>>,
    commits: Mutex<Vec<CommitInfo>>,
    broken: AtomicBool,
}

impl MemoryRepo {
    pub fn with_refs(refs: &[(&str, u32)]) -> Arc<Self> {
        let repo = Self::default();
        *repo.refs.lock() = refs.iter().map(|(name, n)| Ref::new(*name, id(*n))).collect();
        Arc::new(repo)
    }

    pub fn set_history(&self, commits: Vec<CommitInfo>) {
        *self.commits.lock() = commits;
    }

    pub fn break_ref_database(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Repository for MemoryRepo {
    fn all_refs(&self) -> Result<Vec<Ref>, RepositoryError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(RepositoryError::RefDatabase("packed-refs unreadable".into()));
        }
        Ok(self.refs.lock().clone())
    }

    fn walk_history(&self, _starts: &[ObjectId]) -> Result<HistoryWalk<'_>, RepositoryError> {
        let commits = self.commits.lock().clone();
        Ok(Box::new(commits.into_iter().map(Ok)))
    }
}

/// Grants everything except what is configured otherwise.
#[derive(Default)]
pub struct Permissions {
    deny_push: AtomicBool,
    deny_read: AtomicBool,
    push_backend_down: AtomicBool,
    hidden: Mutex<BTreeSet<String>>,
    pub push_checks: AtomicUsize,
}

impl Permissions {
    pub fn allow_all() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_push() -> Arc<Self> {
        let perms = Self::default();
        perms.deny_push.store(true, Ordering::SeqCst);
        Arc::new(perms)
    }

    pub fn push_backend_down() -> Arc<Self> {
        let perms = Self::default();
        perms.push_backend_down.store(true, Ordering::SeqCst);
        Arc::new(perms)
    }

    pub fn deny_read(&self) {
        self.deny_read.store(true, Ordering::SeqCst);
    }

    pub fn hide(&self, name: &str) {
        self.hidden.lock().insert(name.to_string());
    }
}

impl PermissionBackend for Permissions {
    fn check(
        &self,
        _user: &UserIdentity,
        project: &ProjectState,
        permission: ProjectPermission,
    ) -> Result<(), PermissionError> {
        let denied = match permission {
            ProjectPermission::Read => self.deny_read.load(Ordering::SeqCst),
            ProjectPermission::PushAtLeastOneRef => {
                self.push_checks.fetch_add(1, Ordering::SeqCst);
                if self.push_backend_down.load(Ordering::SeqCst) {
                    return Err(PermissionError::Backend("group backend unreachable".into()));
                }
                self.deny_push.load(Ordering::SeqCst)
            }
        };
        if denied {
            Err(PermissionError::Denied(format!(
                "{permission:?} not granted on {}",
                project.name
            )))
        } else {
            Ok(())
        }
    }

    fn filter_refs(
        &self,
        _user: &UserIdentity,
        _project: &ProjectState,
        _repo: &dyn Repository,
        refs: Vec<Ref>,
        _options: RefFilterOptions,
    ) -> Result<Vec<Ref>, PermissionError> {
        let hidden = self.hidden.lock();
        Ok(refs
            .into_iter()
            .filter(|r| !hidden.contains(&r.name))
            .collect())
    }
}

pub struct MissingAgreement;

impl ContributorAgreements for MissingAgreement {
    fn check(&self, _project: &ProjectState, _user: &UserIdentity) -> Result<(), PermissionError> {
        Err(PermissionError::Denied(
            "A Contributor Agreement must be completed before uploading".into(),
        ))
    }
}

pub struct AgreementsUnavailable;

impl ContributorAgreements for AgreementsUnavailable {
    fn check(&self, _project: &ProjectState, _user: &UserIdentity) -> Result<(), PermissionError> {
        Err(PermissionError::Backend("agreement store timed out".into()))
    }
}

/// Everything the client would have seen on the wire.
#[derive(Default)]
pub struct RecordingSession {
    pub progress: Mutex<Vec<u8>>,
    pub messages: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingSession {
    pub fn progress_text(&self) -> String {
        String::from_utf8_lossy(&self.progress.lock()).into_owned()
    }
}

impl ProtocolSession for RecordingSession {
    fn send_message(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }

    fn send_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn send_progress(&self, bytes: &[u8]) {
        self.progress.lock().extend_from_slice(bytes);
    }

    fn flush(&self) {}
}

/// Commit processor backed by a closure.
pub struct FnProcessor<F> {
    run: F,
    pub calls: AtomicUsize,
}

impl<F> FnProcessor<F>
where
    F: Fn(&PushContext) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(run: F) -> Arc<Self> {
        Arc::new(Self {
            run,
            calls: AtomicUsize::new(0),
        })
    }
}

impl<F> CommitProcessor for FnProcessor<F>
where
    F: Fn(&PushContext) -> anyhow::Result<()> + Send + Sync,
{
    fn process_commands(&self, ctx: &PushContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.run)(ctx)
    }
}

#[derive(Default)]
pub struct RecordingHook {
    pub seen: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl PostReceiveHook for RecordingHook {
    fn on_post_receive(
        &self,
        _project: &ProjectState,
        _user: &UserIdentity,
        commands: &[&ReceiveCommand],
    ) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .extend(commands.iter().map(|c| c.ref_name().to_string()));
    }
}

pub struct Harness {
    pub services: ReceiveServices,
    pub metrics: ReceiveMetrics,
    pub session: Arc<RecordingSession>,
}

impl Harness {
    pub fn new(
        processor: Arc<dyn CommitProcessor>,
        permissions: Arc<dyn PermissionBackend>,
        timeout: Duration,
    ) -> Self {
        let config = ReceiveConfig::default()
            .with_timeout(timeout)
            .with_thread_pool_size(2)
            .with_progress_interval(Duration::from_millis(20));
        let executor = Arc::new(ReceiveExecutor::new(config.thread_pool_size).expect("executor"));
        let metrics = ReceiveMetrics::new(&Registry::new()).expect("metrics");
        let services =
            ReceiveServices::new(config, executor, metrics.clone(), processor, permissions);
        Self {
            services,
            metrics,
            session: Arc::new(RecordingSession::default()),
        }
    }

    pub fn coordinator(&self, repo: Arc<MemoryRepo>) -> PushCoordinator {
        PushCoordinator::new(
            self.services.clone(),
            ProjectState::new("platform/core"),
            UserIdentity::new(1000)
                .with_username("jdoe")
                .with_full_name("Jane Doe")
                .with_email("jane@example.com"),
            repo,
            Arc::clone(&self.session) as Arc<dyn ProtocolSession>,
            None,
        )
        .expect("coordinator")
    }
}

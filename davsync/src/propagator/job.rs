//! Job tree: one directory job per directory of the change list, one leaf
//! job per file action, stored in an arena and driven by the control task.
//!
//! The tree never performs I/O. Entry points mutate bookkeeping and push
//! [`Effect`]s that the engine carries out (spawning a leaf task, writing a
//! directory's journal record, forwarding an outcome).

use std::collections::{HashSet, VecDeque};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::item::{ChangeKind, ItemOutcome, Status, SyncItem};
use super::leaf::LeafAction;
use crate::paths::validate_relative;

pub type JobId = usize;

pub(crate) const ROOT: JobId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Running,
    Finished(Status),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The directory's own action runs before any child.
    SelfJob,
    Children,
    /// Waiting for the directory's journal record to be written.
    Finalizing,
    Done,
}

#[derive(Debug)]
pub(crate) struct LeafJob {
    pub item: SyncItem,
    pub action: LeafAction,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct DirectoryJob {
    item: Option<SyncItem>,
    first_job: Option<JobId>,
    children: Vec<JobId>,
    current: usize,
    running_now: usize,
    has_error: Status,
    phase: Phase,
    /// Deleted descendants removed together with this directory.
    covered: Vec<SyncItem>,
    waiting_for_slot: bool,
}

#[derive(Debug)]
pub(crate) enum JobKind {
    Leaf(LeafJob),
    Directory(DirectoryJob),
}

#[derive(Debug)]
pub(crate) struct JobNode {
    parent: Option<JobId>,
    state: JobState,
    ready: bool,
    kind: JobKind,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Effect {
    Launch(JobId),
    Finalize(JobId),
    Completed(ItemOutcome),
    RootFinished(Status),
}

#[derive(Debug)]
pub(crate) struct JobTree {
    nodes: Vec<JobNode>,
    cap: usize,
    active_leaves: usize,
    aborted: bool,
    queue: VecDeque<JobId>,
    waiting: VecDeque<JobId>,
    effects: VecDeque<Effect>,
}

impl JobTree {
    /// Groups the ordered change list by directory ancestry.
    ///
    /// Removed directories are appended to the root after everything else,
    /// and deleted entries below a removed directory are covered by it.
    pub fn build(items: Vec<SyncItem>, run_token: &CancellationToken, cap: usize) -> Self {
        let mut tree = Self {
            nodes: vec![JobNode {
                parent: None,
                state: JobState::NotStarted,
                ready: false,
                kind: JobKind::Directory(DirectoryJob::new(None, None)),
            }],
            cap: cap.max(1),
            active_leaves: 0,
            aborted: false,
            queue: VecDeque::new(),
            waiting: VecDeque::new(),
            effects: VecDeque::new(),
        };

        let mut directories: Vec<(String, JobId)> = vec![(String::new(), ROOT)];
        let mut removed_directories: Vec<JobId> = Vec::new();
        let mut removed: Option<(String, JobId)> = None;
        let mut seen: HashSet<String> = HashSet::new();

        for item in items {
            if let Err(message) = check_item(&item, &mut seen) {
                let leaf = tree.push_leaf(item, LeafAction::Error(message), run_token);
                tree.append(ROOT, leaf);
                continue;
            }

            if item.kind == ChangeKind::Deleted
                && let Some((prefix, dir)) = &removed
                && item.path.starts_with(prefix.as_str())
            {
                let dir = *dir;
                tree.directory_mut(dir).covered.push(item);
                continue;
            }

            let destination = item.destination().to_string();
            while directories.len() > 1
                && !destination.starts_with(directories[directories.len() - 1].0.as_str())
            {
                directories.pop();
            }
            let parent = directories[directories.len() - 1].1;

            if item.is_dir {
                let is_removal = item.kind == ChangeKind::Deleted;
                let dir = tree.push_directory(item, run_token);
                if is_removal {
                    removed_directories.push(dir);
                    removed = Some((format!("{destination}/"), dir));
                } else {
                    tree.append(parent, dir);
                }
                directories.push((format!("{destination}/"), dir));
            } else {
                let action = LeafAction::for_item(&item);
                let leaf = tree.push_leaf(item, action, run_token);
                tree.append(parent, leaf);
            }
        }

        for dir in removed_directories {
            tree.append(ROOT, dir);
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn active_leaves(&self) -> usize {
        self.active_leaves
    }

    #[cfg(test)]
    pub fn state(&self, id: JobId) -> JobState {
        self.nodes[id].state
    }

    #[cfg(test)]
    pub fn is_ready(&self, id: JobId) -> bool {
        self.nodes[id].ready
    }

    #[cfg(test)]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn leaf(&self, id: JobId) -> Option<&LeafJob> {
        match &self.nodes.get(id)?.kind {
            JobKind::Leaf(leaf) => Some(leaf),
            JobKind::Directory(_) => None,
        }
    }

    pub fn directory_item(&self, id: JobId) -> Option<&SyncItem> {
        match &self.nodes.get(id)?.kind {
            JobKind::Directory(dir) => dir.item.as_ref(),
            JobKind::Leaf(_) => None,
        }
    }

    #[cfg(test)]
    pub fn children(&self, id: JobId) -> &[JobId] {
        match &self.nodes[id].kind {
            JobKind::Directory(dir) => &dir.children,
            JobKind::Leaf(_) => &[],
        }
    }

    pub fn first_job(&self, id: JobId) -> Option<JobId> {
        match &self.nodes[id].kind {
            JobKind::Directory(dir) => dir.first_job,
            JobKind::Leaf(_) => None,
        }
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    pub fn start(&mut self) {
        if self.nodes[ROOT].state == JobState::NotStarted {
            self.start_job(ROOT);
            self.drain();
        }
    }

    /// The concurrency cap changed or a slot may be free again.
    pub fn set_cap(&mut self, cap: usize) {
        let cap = cap.max(1);
        let raised = cap > self.cap;
        self.cap = cap;
        if raised {
            self.wake_waiting();
            self.drain();
        }
    }

    pub fn on_leaf_finished(&mut self, id: JobId, status: Status, message: Option<String>) {
        if !self.set_finished(id, status) {
            return;
        }
        self.active_leaves = self.active_leaves.saturating_sub(1);
        if let JobKind::Leaf(leaf) = &self.nodes[id].kind {
            self.effects
                .push_back(Effect::Completed(ItemOutcome::new(&leaf.item, status, message.clone())));
        }

        // Directories already queued for a slot get the freed one first.
        self.wake_waiting();
        if let Some(parent) = self.nodes[id].parent {
            if self.first_job(parent) == Some(id) {
                self.on_first_job_finished(parent, status, message);
            } else {
                self.child_done(parent, status);
            }
        }
        self.drain();
    }

    pub fn on_finalized(&mut self, id: JobId, status: Status) {
        let dir = self.directory_mut(id);
        if dir.phase != Phase::Finalizing {
            return;
        }
        dir.phase = Phase::Done;
        let status = match status {
            Status::Success => dir.aggregate(),
            other => other,
        };
        self.finish(id, status);
        self.drain();
    }

    /// Every job not yet started finishes as aborted; running leaves are cancelled.
    pub fn abort_all(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.abort(ROOT);
        self.wake_waiting();
        self.drain();
    }

    fn start_job(&mut self, id: JobId) {
        match &self.nodes[id].kind {
            JobKind::Leaf(_) => self.launch_leaf(id),
            JobKind::Directory(dir) => {
                let phase = if dir.first_job.is_some() {
                    Phase::SelfJob
                } else {
                    Phase::Children
                };
                self.nodes[id].state = JobState::Running;
                self.directory_mut(id).phase = phase;
                self.queue.push_back(id);
            }
        }
    }

    fn launch_leaf(&mut self, id: JobId) {
        let node = &mut self.nodes[id];
        node.state = JobState::Running;
        node.ready = true;
        self.active_leaves += 1;
        debug!(job = id, active = self.active_leaves, "leaf job launched");
        self.effects.push_back(Effect::Launch(id));
    }

    fn has_slot(&self) -> bool {
        self.active_leaves < self.cap
    }

    fn drain(&mut self) {
        while let Some(id) = self.queue.pop_front() {
            self.advance(id);
        }
    }

    fn advance(&mut self, id: JobId) {
        if self.nodes[id].state != JobState::Running {
            return;
        }
        match self.directory(id).phase {
            Phase::SelfJob => self.advance_self_job(id),
            Phase::Children => self.advance_children(id),
            Phase::Finalizing | Phase::Done => {}
        }
    }

    fn advance_self_job(&mut self, id: JobId) {
        let Some(first) = self.first_job(id) else {
            self.directory_mut(id).phase = Phase::Children;
            self.queue.push_back(id);
            return;
        };
        match self.nodes[first].state {
            JobState::NotStarted if self.aborted => {}
            JobState::NotStarted => {
                if self.has_slot() {
                    self.launch_leaf(first);
                } else {
                    self.wait_for_slot(id);
                }
            }
            JobState::Running => {}
            // Only reachable when the self job was aborted before it ran.
            JobState::Finished(status) => {
                let status = status.merge(self.directory(id).has_error);
                self.directory_mut(id).phase = Phase::Done;
                self.finish(id, status);
            }
        }
    }

    fn advance_children(&mut self, id: JobId) {
        loop {
            let dir = self.directory(id);
            if dir.current > 0 {
                let previous = dir.children[dir.current - 1];
                let previous = &self.nodes[previous];
                if !previous.ready && !matches!(previous.state, JobState::Finished(_)) {
                    break;
                }
            }
            if dir.current >= dir.children.len() || self.aborted {
                break;
            }
            let next = dir.children[dir.current];
            if matches!(self.nodes[next].kind, JobKind::Leaf(_)) && !self.has_slot() {
                self.wait_for_slot(id);
                break;
            }
            let dir = self.directory_mut(id);
            dir.current += 1;
            dir.running_now += 1;
            self.start_job(next);
        }

        let dir = self.directory(id);
        let all_started = dir.current >= dir.children.len();
        let running_now = dir.running_now;
        if all_started {
            self.mark_ready(id);
        }
        if running_now == 0 && (all_started || self.aborted) {
            self.complete_children(id);
        }
    }

    fn complete_children(&mut self, id: JobId) {
        let aborted = self.aborted;
        let dir = self.directory_mut(id);
        if dir.phase != Phase::Children {
            return;
        }
        let needs_record = dir.item.as_ref().is_some_and(|item| {
            !matches!(
                item.kind,
                ChangeKind::Deleted | ChangeKind::Ignored | ChangeKind::Error
            )
        });
        if needs_record && dir.has_error == Status::NoStatus && !aborted {
            dir.phase = Phase::Finalizing;
            self.effects.push_back(Effect::Finalize(id));
        } else {
            dir.phase = Phase::Done;
            let status = dir.aggregate();
            self.finish(id, status);
        }
    }

    fn on_first_job_finished(&mut self, id: JobId, status: Status, message: Option<String>) {
        let covered = std::mem::take(&mut self.directory_mut(id).covered);
        for item in &covered {
            self.effects
                .push_back(Effect::Completed(ItemOutcome::new(item, status, message.clone())));
        }

        if self.nodes[id].state != JobState::Running {
            return;
        }
        if status.allows_children() && !self.aborted {
            self.directory_mut(id).phase = Phase::Children;
            self.queue.push_back(id);
        } else {
            // Children never run in a directory whose own action failed.
            let dir = self.directory_mut(id);
            dir.has_error = dir.has_error.merge(status);
            self.abort(id);
            let dir = self.directory_mut(id);
            if dir.running_now == 0 {
                dir.phase = Phase::Done;
                let status = dir.aggregate();
                self.finish(id, status);
            } else {
                dir.phase = Phase::Children;
            }
        }
    }

    fn child_done(&mut self, parent: JobId, status: Status) {
        let dir = self.directory_mut(parent);
        dir.running_now = dir.running_now.saturating_sub(1);
        if status >= Status::Aborted {
            dir.has_error = dir.has_error.merge(status);
        }
        self.queue.push_back(parent);
    }

    fn finish(&mut self, id: JobId, status: Status) {
        if !self.set_finished(id, status) {
            return;
        }
        debug!(job = id, ?status, "directory job finished");
        match self.nodes[id].parent {
            Some(parent) => self.child_done(parent, status),
            None => self.effects.push_back(Effect::RootFinished(status)),
        }
    }

    fn set_finished(&mut self, id: JobId, status: Status) -> bool {
        let node = &mut self.nodes[id];
        if matches!(node.state, JobState::Finished(_)) {
            return false;
        }
        node.state = JobState::Finished(status);
        node.ready = true;
        true
    }

    fn mark_ready(&mut self, id: JobId) {
        let node = &mut self.nodes[id];
        if node.ready {
            return;
        }
        node.ready = true;
        if let Some(parent) = node.parent {
            self.queue.push_back(parent);
        }
    }

    fn wait_for_slot(&mut self, id: JobId) {
        let dir = self.directory_mut(id);
        if !dir.waiting_for_slot {
            dir.waiting_for_slot = true;
            self.waiting.push_back(id);
        }
    }

    fn wake_waiting(&mut self) {
        while let Some(id) = self.waiting.pop_front() {
            self.directory_mut(id).waiting_for_slot = false;
            self.queue.push_back(id);
        }
    }

    fn abort(&mut self, id: JobId) {
        match &self.nodes[id].kind {
            JobKind::Leaf(leaf) => match self.nodes[id].state {
                JobState::NotStarted => {
                    let outcome = ItemOutcome::new(&leaf.item, Status::Aborted, None);
                    self.set_finished(id, Status::Aborted);
                    self.effects.push_back(Effect::Completed(outcome));
                }
                JobState::Running => leaf.cancel.cancel(),
                JobState::Finished(_) => {}
            },
            JobKind::Directory(dir) => {
                let state = self.nodes[id].state;
                if matches!(state, JobState::Finished(_)) {
                    return;
                }
                let first = dir.first_job;
                let children = dir.children.clone();
                let covered = std::mem::take(&mut self.directory_mut(id).covered);
                for item in &covered {
                    self.effects.push_back(Effect::Completed(ItemOutcome::new(
                        item,
                        Status::Aborted,
                        None,
                    )));
                }
                if let Some(first) = first {
                    self.abort(first);
                }
                let mut skipped = false;
                for child in children {
                    skipped |= self.nodes[child].state == JobState::NotStarted;
                    self.abort(child);
                }
                let dir = self.directory_mut(id);
                dir.current = dir.children.len();
                if skipped {
                    dir.has_error = dir.has_error.merge(Status::Aborted);
                }
                if state == JobState::NotStarted {
                    dir.phase = Phase::Done;
                    self.set_finished(id, Status::Aborted);
                } else {
                    self.queue.push_back(id);
                }
            }
        }
    }

    fn push_leaf(
        &mut self,
        item: SyncItem,
        action: LeafAction,
        run_token: &CancellationToken,
    ) -> JobId {
        self.nodes.push(JobNode {
            parent: None,
            state: JobState::NotStarted,
            ready: false,
            kind: JobKind::Leaf(LeafJob {
                item,
                action,
                cancel: run_token.child_token(),
            }),
        });
        self.nodes.len() - 1
    }

    fn push_directory(&mut self, item: SyncItem, run_token: &CancellationToken) -> JobId {
        let first_job = LeafAction::for_directory(&item)
            .map(|action| self.push_leaf(item.clone(), action, run_token));
        self.nodes.push(JobNode {
            parent: None,
            state: JobState::NotStarted,
            ready: false,
            kind: JobKind::Directory(DirectoryJob::new(Some(item), first_job)),
        });
        let id = self.nodes.len() - 1;
        if let Some(first) = first_job {
            self.nodes[first].parent = Some(id);
        }
        id
    }

    fn append(&mut self, parent: JobId, child: JobId) {
        self.nodes[child].parent = Some(parent);
        self.directory_mut(parent).children.push(child);
    }

    fn directory(&self, id: JobId) -> &DirectoryJob {
        match &self.nodes[id].kind {
            JobKind::Directory(dir) => dir,
            JobKind::Leaf(_) => unreachable!("job {id} is not a directory"),
        }
    }

    fn directory_mut(&mut self, id: JobId) -> &mut DirectoryJob {
        match &mut self.nodes[id].kind {
            JobKind::Directory(dir) => dir,
            JobKind::Leaf(_) => unreachable!("job {id} is not a directory"),
        }
    }
}

impl DirectoryJob {
    fn new(item: Option<SyncItem>, first_job: Option<JobId>) -> Self {
        Self {
            item,
            first_job,
            children: Vec::new(),
            current: 0,
            running_now: 0,
            has_error: Status::NoStatus,
            phase: Phase::Children,
            covered: Vec::new(),
            waiting_for_slot: false,
        }
    }

    fn aggregate(&self) -> Status {
        match self.has_error {
            Status::NoStatus => Status::Success,
            other => other,
        }
    }
}

fn check_item(item: &SyncItem, seen: &mut HashSet<String>) -> Result<(), String> {
    validate_relative(&item.path).map_err(|err| err.to_string())?;
    if !seen.insert(item.path.clone()) {
        return Err(format!("duplicate path in change list: {}", item.path));
    }
    if item.kind == ChangeKind::Renamed {
        let target = item
            .rename_target
            .as_deref()
            .ok_or_else(|| format!("rename of {} has no target", item.path))?;
        validate_relative(target).map_err(|err| err.to_string())?;
        if !seen.insert(target.to_string()) {
            return Err(format!("rename target collides with another entry: {target}"));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;

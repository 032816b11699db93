use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;

use crate::data::StatusService;
use crate::mastodon::Status;
use crate::render::{Fragment, Renderer};

/// Upper bound on how far up a reply chain we walk.
pub const MAX_DEPTH: usize = 256;

/// Identifies one rendered view; work started for an older view is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

#[derive(Debug, Default)]
pub struct ViewGeneration {
    current: AtomicU64,
}

impl ViewGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self) -> Generation {
        Generation(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn current(&self) -> Generation {
        Generation(self.current.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEvent {
    /// Prepend `fragment` to the thread shown above `anchor`.
    Ancestor {
        generation: Generation,
        anchor: String,
        fragment: Fragment,
    },
    Finished {
        generation: Generation,
        anchor: String,
    },
}

impl ThreadEvent {
    pub fn generation(&self) -> Generation {
        match self {
            ThreadEvent::Ancestor { generation, .. } | ThreadEvent::Finished { generation, .. } => {
                *generation
            }
        }
    }
}

/// Walk the `in_reply_to_id` links above `status`, calling `visit` with each
/// ancestor from nearest to farthest. Stops at the first fetch that fails,
/// at a repeated id, or when `keep_going` says the work is no longer wanted.
fn walk_ancestors(
    service: &dyn StatusService,
    status: &Status,
    mut keep_going: impl FnMut() -> bool,
    mut visit: impl FnMut(Status),
) {
    let mut seen = HashSet::new();
    seen.insert(status.id.clone());
    let mut next = status.in_reply_to_id.clone();

    while let Some(parent_id) = next {
        if !keep_going() {
            return;
        }
        if seen.len() > MAX_DEPTH || !seen.insert(parent_id.clone()) {
            tracing::debug!(status = %status.id, parent = %parent_id, "reply chain loops or is too deep");
            return;
        }
        match service.load_status(&parent_id) {
            Ok(parent) => {
                next = parent.in_reply_to_id.clone();
                visit(parent);
            }
            Err(err) => {
                tracing::debug!(
                    status = %status.id,
                    parent = %parent_id,
                    error = %format!("{err:#}"),
                    "reply chain truncated"
                );
                return;
            }
        }
    }
}

/// The visible thread ending at `status`: every reachable ancestor, root
/// first, followed by the post itself.
pub fn resolve_thread(
    service: &dyn StatusService,
    renderer: &Renderer,
    status: &Status,
) -> Vec<Fragment> {
    let mut fragments = vec![renderer.fragment(status)];
    walk_ancestors(service, status, || true, |parent| {
        fragments.push(renderer.fragment(&parent));
    });
    fragments.reverse();
    fragments
}

/// Resolves reply chains on worker threads and reports back over a channel.
#[derive(Clone)]
pub struct Resolver {
    service: Arc<dyn StatusService>,
    renderer: Renderer,
    generations: Arc<ViewGeneration>,
    tx: Sender<ThreadEvent>,
}

impl Resolver {
    pub fn new(
        service: Arc<dyn StatusService>,
        renderer: Renderer,
        generations: Arc<ViewGeneration>,
        tx: Sender<ThreadEvent>,
    ) -> Self {
        Self {
            service,
            renderer,
            generations,
            tx,
        }
    }

    /// Start resolving the ancestors of `status`. Events carry `anchor`, which
    /// names the timeline entry that shows the post. Nothing is sent for a
    /// post that is not a reply.
    pub fn spawn(
        &self,
        generation: Generation,
        anchor: String,
        status: Status,
    ) -> Option<thread::JoinHandle<()>> {
        if !status.is_reply() {
            return None;
        }
        let resolver = self.clone();
        Some(thread::spawn(move || resolver.run(generation, anchor, status)))
    }

    fn run(&self, generation: Generation, anchor: String, status: Status) {
        let live = || self.generations.is_current(generation);
        walk_ancestors(self.service.as_ref(), &status, live, |parent| {
            if !live() {
                return;
            }
            let _ = self.tx.send(ThreadEvent::Ancestor {
                generation,
                anchor: anchor.clone(),
                fragment: self.renderer.fragment(&parent),
            });
        });
        if live() {
            let _ = self.tx.send(ThreadEvent::Finished { generation, anchor });
        }
    }
}
